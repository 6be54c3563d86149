//! Typed view over the cluster's shared object store.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cluster::{ClusterRuntime, SharedBytes};
use crate::error::{FanoutError, FanoutResult, TaskError};
use crate::object::{ObjectId, ResultHandle, StoreId};

/// Materialized copy of an object: process-local bytes, or the task error
/// the object resolved to.
type LocalEntry = Result<Arc<[u8]>, TaskError>;

/// Issues [`ResultHandle`]s for a session and resolves them.
///
/// While the session is alive, [`get`](Self::get) and
/// [`view`](Self::view) read straight out of shared memory.
/// [`materialize`](Self::materialize) copies the object into a
/// process-local table first, so it stays readable after the session
/// closes. Resolving a handle that was never materialized after the store
/// closes fails with `StaleHandle`.
pub struct ResultStore {
    id: StoreId,
    runtime: Arc<dyn ClusterRuntime>,
    issued: Mutex<HashSet<ObjectId>>,
    local: Mutex<HashMap<ObjectId, LocalEntry>>,
    closed: AtomicBool,
}

impl fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStore")
            .field("id", &self.id)
            .field("runtime", &self.runtime.address())
            .field("issued", &self.issued.lock().len())
            .field("materialized", &self.local.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ResultStore {
    pub(crate) fn new(runtime: Arc<dyn ClusterRuntime>) -> Self {
        Self {
            id: StoreId::new(),
            runtime,
            issued: Mutex::new(HashSet::new()),
            local: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier stamped into every handle this store issues.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Record `object` as owned by this store and hand out a handle for it.
    pub(crate) fn track<T>(&self, object: ObjectId) -> ResultHandle<T> {
        self.issued.lock().insert(object);
        ResultHandle::new(self.id, object)
    }

    /// Store a caller-produced value.
    pub fn put<T: Serialize>(&self, value: &T) -> FanoutResult<ResultHandle<T>> {
        if self.is_closed() {
            return Err(FanoutError::SessionClosed);
        }
        let bytes = serde_json::to_vec(value)?;
        let object = self.runtime.put(bytes)?;
        Ok(self.track(object))
    }

    /// Resolve a handle, reading from shared memory when it has not been
    /// materialized. Waits for the producing task to finish.
    pub async fn get<T: DeserializeOwned>(&self, handle: ResultHandle<T>) -> FanoutResult<T> {
        self.check(&handle)?;
        if let Some(entry) = self.local_entry(handle.object_id()) {
            return decode(entry);
        }
        let view = self.view(handle).await?;
        Ok(view.read(|bytes| serde_json::from_slice(bytes))??)
    }

    /// Zero-copy view of a handle's value.
    ///
    /// Views of objects that were already materialized are detached copies.
    pub async fn view<T>(&self, handle: ResultHandle<T>) -> FanoutResult<SharedBytes> {
        self.check(&handle)?;
        let object = handle.object_id();
        if let Some(entry) = self.local_entry(object) {
            let bytes = entry.map_err(FanoutError::task_failure)?;
            return Ok(SharedBytes::new(object, bytes.to_vec()));
        }
        self.ensure_open(object)?;
        self.runtime
            .get(object)
            .await?
            .map_err(FanoutError::task_failure)
    }

    /// Copy a handle's value into process memory and return it.
    ///
    /// Idempotent: later calls read the local copy, including after the
    /// session shut down.
    pub async fn materialize<T: DeserializeOwned>(
        &self,
        handle: ResultHandle<T>,
    ) -> FanoutResult<T> {
        self.check(&handle)?;
        let entry = self.materialize_object(handle.object_id()).await?;
        decode(entry)
    }

    /// Materialize every issued handle that is still only in shared memory.
    ///
    /// Task failures are recorded as the handle's local value rather than
    /// returned; they surface when the handle is resolved. Returns the
    /// number of objects copied.
    pub async fn materialize_outstanding(&self) -> FanoutResult<usize> {
        let mut pending: Vec<ObjectId> = {
            let issued = self.issued.lock();
            let local = self.local.lock();
            issued
                .iter()
                .filter(|object| !local.contains_key(object))
                .copied()
                .collect()
        };
        pending.sort_unstable();

        for object in &pending {
            // Task failures are kept as the local entry.
            let _entry = self.materialize_object(*object).await?;
        }
        if !pending.is_empty() {
            debug!(store = %self.id, count = pending.len(), "materialized outstanding handles");
        }
        Ok(pending.len())
    }

    async fn materialize_object(&self, object: ObjectId) -> FanoutResult<LocalEntry> {
        if let Some(entry) = self.local_entry(object) {
            return Ok(entry);
        }
        self.ensure_open(object)?;
        let entry = match self.runtime.get(object).await? {
            Ok(view) => Ok(Arc::from(view.to_vec()?)),
            Err(err) => Err(err),
        };
        self.local.lock().insert(object, entry.clone());
        crate::telemetry::record_materialized(1);
        Ok(entry)
    }

    /// Forget an object and free its shared segment.
    pub fn release(&self, object: ObjectId) {
        self.issued.lock().remove(&object);
        self.local.lock().remove(&object);
        if !self.is_closed() {
            self.runtime.free(object);
        }
    }

    /// Whether `object` has a process-local copy.
    pub fn is_materialized(&self, object: ObjectId) -> bool {
        self.local.lock().contains_key(&object)
    }

    /// Issued handles that still depend on shared memory.
    pub fn outstanding(&self) -> usize {
        let issued = self.issued.lock();
        let local = self.local.lock();
        issued.iter().filter(|object| !local.contains_key(object)).count()
    }

    /// Whether the owning session has shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn local_entry(&self, object: ObjectId) -> Option<LocalEntry> {
        self.local.lock().get(&object).cloned()
    }

    fn check<T>(&self, handle: &ResultHandle<T>) -> FanoutResult<()> {
        if handle.store_id() != self.id {
            return Err(FanoutError::stale(
                handle.object_id(),
                "handle was issued by another session",
            ));
        }
        Ok(())
    }

    fn ensure_open(&self, object: ObjectId) -> FanoutResult<()> {
        if self.is_closed() {
            return Err(FanoutError::stale(
                object,
                "session shut down before the handle was materialized",
            ));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(entry: LocalEntry) -> FanoutResult<T> {
    let bytes = entry.map_err(FanoutError::task_failure)?;
    Ok(serde_json::from_slice(&bytes)?)
}
