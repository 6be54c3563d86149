use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug};

use crate::cluster::RemoteTask;
use crate::config::MapOptions;
use crate::error::{FanoutError, FanoutResult, TaskError};
use crate::object::ResultHandle;
use crate::results::{MapResults, SharedChunk};
use crate::session::{ClusterSession, encode};
use crate::telemetry::{self, MapTimer, WORKER_POOL};

/// Applies a function to every item using stateless cluster tasks.
///
/// Items are grouped into chunks (one item per chunk by default) and each
/// chunk is submitted as one task. Results come back in input order no
/// matter which task finishes first. The first failing chunk, in
/// submission order, fails the whole call; results already collected are
/// released.
pub struct WorkerPoolMap<'s> {
    session: &'s ClusterSession,
    options: MapOptions,
}

impl fmt::Debug for WorkerPoolMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolMap")
            .field("session", &self.session.id())
            .field("options", &self.options)
            .finish()
    }
}

impl<'s> WorkerPoolMap<'s> {
    pub fn new(session: &'s ClusterSession) -> Self {
        Self {
            session,
            options: MapOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MapOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.options.chunk_size = Some(chunk_size);
        self
    }

    /// Map `f` over `items`.
    pub async fn map<I, O, F>(
        &self,
        f: F,
        items: impl IntoIterator<Item = I>,
    ) -> FanoutResult<MapResults<O>>
    where
        I: Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let name = self.task_name::<F>();
        self.run(name, move |item, _: &()| f(item), items, ()).await
    }

    /// Map `f` over `items`, passing every call a reference to the same
    /// `broadcast` value.
    pub async fn map_with<I, B, O, F>(
        &self,
        f: F,
        items: impl IntoIterator<Item = I>,
        broadcast: B,
    ) -> FanoutResult<MapResults<O>>
    where
        I: Send + 'static,
        B: Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let name = self.task_name::<F>();
        self.run(name, f, items, broadcast).await
    }

    fn task_name<F>(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| type_name::<F>().to_string())
    }

    async fn run<I, B, O, F>(
        &self,
        name: String,
        f: F,
        items: impl IntoIterator<Item = I>,
        broadcast: B,
    ) -> FanoutResult<MapResults<O>>
    where
        I: Send + 'static,
        B: Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let items: Vec<I> = items.into_iter().collect();
        if items.is_empty() {
            debug!(task = %name, "empty input, nothing to submit");
            return Ok(MapResults::local(Vec::new()));
        }

        let chunk_size = self.options.chunk_size.unwrap_or(1).clamp(1, items.len());
        if self.options.inline {
            return run_inline(&name, &f, items, &broadcast, chunk_size);
        }

        let span = telemetry::map_span(&name, items.len(), items.len().div_ceil(chunk_size));
        let timer = MapTimer::start(WORKER_POOL, name.as_str());
        let result = self
            .submit_and_collect(&name, Arc::new(f), Arc::new(broadcast), items, chunk_size)
            .instrument(span)
            .await;
        timer.finish(if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn submit_and_collect<I, B, O, F>(
        &self,
        name: &str,
        f: Arc<F>,
        broadcast: Arc<B>,
        items: Vec<I>,
        chunk_size: usize,
    ) -> FanoutResult<MapResults<O>>
    where
        I: Send + 'static,
        B: Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let store = self.session.store();
        let total = items.len();
        let mut handles: Vec<(ResultHandle<Vec<O>>, usize)> =
            Vec::with_capacity(total.div_ceil(chunk_size));

        let mut remaining = items.into_iter();
        let mut start = 0;
        while start < total {
            let chunk: Vec<I> = remaining.by_ref().take(chunk_size).collect();
            let len = chunk.len();
            let task = chunk_task(name, Arc::clone(&f), Arc::clone(&broadcast), chunk, start);
            match self.session.submit_task::<Vec<O>>(task) {
                Ok(handle) => handles.push((handle, len)),
                Err(err) => {
                    release(self.session, &handles);
                    return Err(err);
                }
            }
            start += len;
        }
        telemetry::record_tasks_submitted(WORKER_POOL, handles.len());

        let mut chunks = Vec::with_capacity(handles.len());
        for (index, (handle, len)) in handles.iter().enumerate() {
            match store.view(*handle).await {
                Ok(view) => chunks.push(SharedChunk::batch(view, *len)),
                Err(err) => {
                    let err = err.in_chunk(index);
                    telemetry::record_task_failed(WORKER_POOL, name, err.failed_item(), &err);
                    release(self.session, &handles);
                    return Err(err);
                }
            }
            telemetry::record_progress(WORKER_POOL, index + 1, handles.len());
        }

        let results = MapResults::shared(Arc::clone(store), chunks);
        self.session.register_results(&results);
        Ok(results)
    }
}

fn chunk_task<I, B, O, F>(
    name: &str,
    f: Arc<F>,
    broadcast: Arc<B>,
    chunk: Vec<I>,
    start: usize,
) -> RemoteTask
where
    I: Send + 'static,
    B: Send + Sync + 'static,
    O: Serialize + 'static,
    F: Fn(I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
{
    let task_name = name.to_string();
    RemoteTask::new(name, move || {
        let mut values = Vec::with_capacity(chunk.len());
        for (offset, item) in chunk.into_iter().enumerate() {
            let index = start + offset;
            let value = match panic::catch_unwind(AssertUnwindSafe(|| f(item, &*broadcast))) {
                Ok(Ok(value)) => value,
                Ok(Err(err)) => {
                    return Err(TaskError::raised(task_name.as_str(), &err).at_item(index));
                }
                Err(payload) => {
                    return Err(
                        TaskError::panicked(task_name.as_str(), payload.as_ref()).at_item(index)
                    );
                }
            };
            values.push(value);
        }
        encode(&task_name, &values)
    })
}

fn run_inline<I, B, O, F>(
    name: &str,
    f: &F,
    items: Vec<I>,
    broadcast: &B,
    chunk_size: usize,
) -> FanoutResult<MapResults<O>>
where
    F: Fn(I, &B) -> anyhow::Result<O>,
{
    debug!(task = %name, items = items.len(), "running map inline");
    let mut values = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let source = match panic::catch_unwind(AssertUnwindSafe(|| f(item, broadcast))) {
            Ok(Ok(value)) => {
                values.push(value);
                continue;
            }
            Ok(Err(err)) => TaskError::raised(name, &err),
            Err(payload) => TaskError::panicked(name, payload.as_ref()),
        };
        let err = FanoutError::task_failure(source.at_item(index)).in_chunk(index / chunk_size);
        telemetry::record_task_failed(WORKER_POOL, name, Some(index), &err);
        return Err(err);
    }
    Ok(MapResults::local(values))
}

fn release<T>(session: &ClusterSession, handles: &[(ResultHandle<T>, usize)]) {
    for (handle, _) in handles {
        session.store().release(handle.object_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterRuntime, LocalCluster};
    use crate::config::ClusterConfig;
    use anyhow::bail;

    async fn session() -> ClusterSession {
        ClusterSession::start(ClusterConfig::local().with_num_workers(4))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_map_preserves_order_with_chunks() {
        let session = session().await;
        for chunk_size in [1, 3, 7, 100] {
            let results = WorkerPoolMap::new(&session)
                .with_chunk_size(chunk_size)
                .map(|x: u64| Ok(x * x), 0..20u64)
                .await
                .unwrap();
            let expected: Vec<u64> = (0..20).map(|x| x * x).collect();
            assert_eq!(results.to_vec().unwrap(), expected, "chunk_size {chunk_size}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_map_with_broadcast() {
        let session = session().await;
        let results = WorkerPoolMap::new(&session)
            .map_with(|x: i32, offset: &i32| Ok(x + offset), vec![1, 2, 3], 10)
            .await
            .unwrap();
        assert_eq!(results.to_vec().unwrap(), vec![11, 12, 13]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_reports_chunk_and_item() {
        let session = session().await;
        let err = WorkerPoolMap::new(&session)
            .with_chunk_size(4)
            .map(
                |x: usize| {
                    if x == 6 {
                        bail!("item {x} is bad");
                    }
                    Ok(x)
                },
                0..10usize,
            )
            .await
            .unwrap_err();

        match err {
            FanoutError::TaskFailure { chunk, item, source } => {
                assert_eq!(chunk, Some(1));
                assert_eq!(item, Some(6));
                assert!(source.message.contains("item 6 is bad"));
            }
            other => panic!("expected task failure, got {other:?}"),
        }
        assert_eq!(session.store().outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_item_is_reported() {
        let session = session().await;
        let err = WorkerPoolMap::new(&session)
            .map(
                |x: u8| {
                    if x == 2 {
                        panic!("cannot handle two");
                    }
                    Ok(x)
                },
                0..4u8,
            )
            .await
            .unwrap_err();
        assert_eq!(err.failed_item(), Some(2));
    }

    #[tokio::test]
    async fn test_inline_mode_matches_cluster_mode() {
        let session = session().await;
        let results = WorkerPoolMap::new(&session)
            .with_options(MapOptions::default().inline(true))
            .map(|x: u32| Ok(x + 1), vec![1, 2, 3])
            .await
            .unwrap();
        assert!(results.is_materialized());
        assert_eq!(results.to_vec().unwrap(), vec![2, 3, 4]);

        let err = WorkerPoolMap::new(&session)
            .with_options(MapOptions::default().inline(true).with_chunk_size(2))
            .map(
                |x: u32| if x == 3 { bail!("three") } else { Ok(x) },
                vec![0, 1, 2, 3],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FanoutError::TaskFailure {
                chunk: Some(1),
                item: Some(3),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_inline_panic_is_reported() {
        let session = session().await;
        let err = WorkerPoolMap::new(&session)
            .with_options(MapOptions::default().inline(true).with_chunk_size(2))
            .map(
                |x: u8| {
                    if x == 2 {
                        panic!("cannot handle two");
                    }
                    Ok(x)
                },
                0..4u8,
            )
            .await
            .unwrap_err();

        match err {
            FanoutError::TaskFailure { chunk, item, source } => {
                assert_eq!(chunk, Some(1));
                assert_eq!(item, Some(2));
                assert!(source.message.contains("cannot handle two"));
            }
            other => panic!("expected task failure, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_results_free_cluster_memory() {
        let config = ClusterConfig::local().with_num_workers(4);
        let cluster = LocalCluster::connect(config.clone()).unwrap();
        let runtime: Arc<dyn ClusterRuntime> = cluster.clone();
        let session = ClusterSession::with_runtime(config, runtime);

        for _ in 0..5 {
            let results = WorkerPoolMap::new(&session)
                .map(|x: u64| Ok(x * x), 0..100u64)
                .await
                .unwrap();
            assert_eq!(results.get(99).unwrap(), Some(9801));
        }

        assert!(cluster.objects().is_empty());
        assert_eq!(cluster.objects().bytes_in_use(), 0);
        assert_eq!(session.store().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_named_task() {
        let session = session().await;
        let err = WorkerPoolMap::new(&session)
            .with_options(MapOptions::default().with_name("parse").inline(true))
            .map(|_: u8| -> anyhow::Result<u8> { bail!("nope") }, vec![0])
            .await
            .unwrap_err();
        match err {
            FanoutError::TaskFailure { source, .. } => assert_eq!(source.task, "parse"),
            other => panic!("expected task failure, got {other:?}"),
        }
    }
}
