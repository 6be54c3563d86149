//! Ordered results of a map call.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::cluster::SharedBytes;
use crate::error::{FanoutError, FanoutResult};
use crate::object::ObjectId;
use crate::store::ResultStore;

/// A fetched object backing a contiguous run of results.
#[derive(Debug)]
pub(crate) struct SharedChunk {
    pub(crate) view: SharedBytes,
    pub(crate) items: usize,
    /// The object encodes `Vec<T>` rather than a single `T`.
    pub(crate) batched: bool,
}

impl SharedChunk {
    pub(crate) fn batch(view: SharedBytes, items: usize) -> Self {
        Self {
            view,
            items,
            batched: true,
        }
    }

    pub(crate) fn single(view: SharedBytes) -> Self {
        Self {
            view,
            items: 1,
            batched: false,
        }
    }

    fn object(&self) -> ObjectId {
        self.view.object_id()
    }

    fn decode<T: DeserializeOwned>(&self) -> FanoutResult<Vec<T>> {
        let values: Vec<T> = if self.batched {
            self.view.read(|bytes| serde_json::from_slice(bytes))??
        } else {
            vec![self.view.read(|bytes| serde_json::from_slice(bytes))??]
        };
        if values.len() != self.items {
            return Err(FanoutError::invalid_argument(format!(
                "object {} holds {} results, expected {}",
                self.object(),
                values.len(),
                self.items
            )));
        }
        Ok(values)
    }
}

enum ResultsState<T> {
    Shared(Vec<SharedChunk>),
    Local(Vec<T>),
}

pub(crate) struct ResultsInner<T> {
    len: usize,
    store: Option<Arc<ResultStore>>,
    state: Mutex<ResultsState<T>>,
}

impl<T> Drop for ResultsInner<T> {
    fn drop(&mut self) {
        let (Some(store), ResultsState::Shared(chunks)) = (&self.store, self.state.get_mut())
        else {
            return;
        };
        for chunk in chunks.drain(..) {
            store.release(chunk.object());
        }
    }
}

/// Implemented by result sets the shutdown coordinator can drain.
pub(crate) trait Materialize: Send + Sync {
    /// Copy out of shared memory. Returns `true` if anything was copied.
    fn materialize(&self) -> FanoutResult<bool>;

    fn is_materialized(&self) -> bool;
}

impl<T> ResultsInner<T>
where
    T: DeserializeOwned,
{
    fn materialize_shared(&self) -> FanoutResult<bool> {
        let mut state = self.state.lock();
        let ResultsState::Shared(chunks) = &*state else {
            return Ok(false);
        };

        let mut values = Vec::with_capacity(self.len);
        for chunk in chunks {
            values.extend(chunk.decode::<T>()?);
        }
        let objects: Vec<ObjectId> = chunks.iter().map(SharedChunk::object).collect();
        *state = ResultsState::Local(values);
        drop(state);

        if let Some(store) = &self.store {
            for object in objects {
                store.release(object);
            }
        }
        Ok(true)
    }
}

impl<T> Materialize for ResultsInner<T>
where
    T: DeserializeOwned + Send,
{
    fn materialize(&self) -> FanoutResult<bool> {
        self.materialize_shared()
    }

    fn is_materialized(&self) -> bool {
        matches!(*self.state.lock(), ResultsState::Local(_))
    }
}

/// Results of a map call, in input order.
///
/// While the session is alive the values stay in the cluster's shared
/// memory and are decoded on access. [`materialize`](Self::materialize)
/// copies them into process memory; after that they no longer depend on
/// the session. Map results are registered with their session, and
/// [`before_shutdown`](crate::shutdown::before_shutdown) materializes any
/// that are still shared. Dropping unmaterialized results frees their
/// shared objects.
pub struct MapResults<T> {
    inner: Arc<ResultsInner<T>>,
}

impl<T> fmt::Debug for MapResults<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let materialized = match self.inner.state.try_lock() {
            Some(state) => Some(matches!(*state, ResultsState::Local(_))),
            None => None,
        };
        f.debug_struct("MapResults")
            .field("len", &self.inner.len)
            .field("materialized", &materialized)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> MapResults<T> {
    /// Results that already live in process memory.
    pub fn local(values: Vec<T>) -> Self {
        Self {
            inner: Arc::new(ResultsInner {
                len: values.len(),
                store: None,
                state: Mutex::new(ResultsState::Local(values)),
            }),
        }
    }

    pub(crate) fn shared(store: Arc<ResultStore>, chunks: Vec<SharedChunk>) -> Self {
        let len = chunks.iter().map(|chunk| chunk.items).sum();
        Self {
            inner: Arc::new(ResultsInner {
                len,
                store: Some(store),
                state: Mutex::new(ResultsState::Shared(chunks)),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ResultsInner<T>> {
        &self.inner
    }

    /// Number of results.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the map had no input.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }
}

impl<T> MapResults<T>
where
    T: DeserializeOwned,
{
    /// Copy every result into process memory and release the shared
    /// objects. Idempotent.
    pub fn materialize(&self) -> FanoutResult<()> {
        self.inner.materialize_shared().map(|_| ())
    }

    /// Whether the results live in process memory.
    pub fn is_materialized(&self) -> bool {
        matches!(*self.inner.state.lock(), ResultsState::Local(_))
    }

    /// Materialize and take ownership of the values.
    pub fn into_vec(self) -> FanoutResult<Vec<T>> {
        self.inner.materialize_shared()?;
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, ResultsState::Local(Vec::new())) {
            ResultsState::Local(values) => Ok(values),
            ResultsState::Shared(_) => Err(FanoutError::invalid_argument(
                "results were not materialized",
            )),
        }
    }
}

impl<T> MapResults<T>
where
    T: DeserializeOwned + Clone,
{
    /// Result at position `index`.
    ///
    /// Fails with `StaleHandle` if the session shut down before these
    /// results were materialized.
    pub fn get(&self, index: usize) -> FanoutResult<Option<T>> {
        let state = self.inner.state.lock();
        match &*state {
            ResultsState::Local(values) => Ok(values.get(index).cloned()),
            ResultsState::Shared(chunks) => {
                let mut offset = index;
                for chunk in chunks {
                    if offset < chunk.items {
                        let mut values = chunk.decode::<T>()?;
                        return Ok(Some(values.swap_remove(offset)));
                    }
                    offset -= chunk.items;
                }
                Ok(None)
            }
        }
    }

    /// All results, in input order.
    pub fn to_vec(&self) -> FanoutResult<Vec<T>> {
        let state = self.inner.state.lock();
        match &*state {
            ResultsState::Local(values) => Ok(values.clone()),
            ResultsState::Shared(chunks) => {
                let mut values = Vec::with_capacity(self.inner.len);
                for chunk in chunks {
                    values.extend(chunk.decode::<T>()?);
                }
                Ok(values)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterRuntime, LocalCluster};
    use crate::config::ClusterConfig;

    async fn shared_results(
        values: &[Vec<u32>],
    ) -> (Arc<LocalCluster>, Arc<ResultStore>, MapResults<u32>) {
        let cluster = LocalCluster::connect(ClusterConfig::local()).unwrap();
        let runtime: Arc<dyn ClusterRuntime> = cluster.clone();
        let store = Arc::new(ResultStore::new(runtime));

        let mut chunks = Vec::new();
        for chunk in values {
            let handle = store.put(chunk).unwrap();
            let view = store.view(handle).await.unwrap();
            chunks.push(SharedChunk::batch(view, chunk.len()));
        }
        let results = MapResults::shared(Arc::clone(&store), chunks);
        (cluster, store, results)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_results_index_across_chunks() {
        let (_cluster, _store, results) =
            shared_results(&[vec![0, 1, 4], vec![9], vec![16, 25]]).await;

        assert_eq!(results.len(), 6);
        assert_eq!(results.get(3).unwrap(), Some(9));
        assert_eq!(results.get(5).unwrap(), Some(25));
        assert_eq!(results.get(6).unwrap(), None);
        assert_eq!(results.to_vec().unwrap(), vec![0, 1, 4, 9, 16, 25]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_materialize_survives_shutdown() {
        let (cluster, store, results) = shared_results(&[vec![1, 2], vec![3]]).await;
        let before = results.to_vec().unwrap();

        results.materialize().unwrap();
        results.materialize().unwrap();
        assert!(results.is_materialized());
        assert_eq!(store.outstanding(), 0);

        cluster.shutdown().await.unwrap();
        assert_eq!(results.to_vec().unwrap(), before);
        assert_eq!(results.into_vec().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_results_go_stale_at_shutdown() {
        let (cluster, _store, results) = shared_results(&[vec![7]]).await;
        cluster.shutdown().await.unwrap();

        assert!(results.get(0).unwrap_err().is_stale());
        assert!(results.materialize().unwrap_err().is_stale());
        assert!(!results.is_materialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_shared_results_frees_objects() {
        let (cluster, store, results) = shared_results(&[vec![1, 2], vec![3]]).await;
        assert_eq!(cluster.objects().len(), 2);
        assert_eq!(store.outstanding(), 2);

        drop(results);
        assert!(cluster.objects().is_empty());
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn test_local_results() {
        let results = MapResults::local(vec!["a".to_string()]);
        assert!(results.is_materialized());
        assert_eq!(results.get(0).unwrap().as_deref(), Some("a"));
        assert!(MapResults::<u8>::local(Vec::new()).is_empty());
    }
}
