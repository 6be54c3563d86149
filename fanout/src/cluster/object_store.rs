use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{FanoutError, FanoutResult, TaskError};
use crate::object::ObjectId;

/// Completed object as seen by a reader: a view of the value, or the error
/// the producing task raised.
pub type TaskOutcome = Result<SharedBytes, TaskError>;

struct Segment {
    object: ObjectId,
    len: usize,
    data: RwLock<Option<Box<[u8]>>>,
}

/// Zero-copy view of an object held in the shared object store.
///
/// The view stays cheap to clone and read while the segment is alive. Once
/// the store reclaims the segment (object freed or cluster shut down),
/// every read fails with [`FanoutError::StaleHandle`]; copy the bytes out
/// first to keep them.
#[derive(Clone)]
pub struct SharedBytes {
    segment: Arc<Segment>,
}

impl SharedBytes {
    /// Place `bytes` in a fresh segment for `object`.
    pub fn new(object: ObjectId, bytes: Vec<u8>) -> Self {
        Self {
            segment: Arc::new(Segment {
                object,
                len: bytes.len(),
                data: RwLock::new(Some(bytes.into_boxed_slice())),
            }),
        }
    }

    /// Object this view belongs to.
    pub fn object_id(&self) -> ObjectId {
        self.segment.object
    }

    /// Size of the segment in bytes.
    pub fn len(&self) -> usize {
        self.segment.len
    }

    /// Whether the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.segment.len == 0
    }

    /// Whether the segment has been reclaimed.
    pub fn is_reclaimed(&self) -> bool {
        self.segment.data.read().is_none()
    }

    /// Read the segment in place.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> FanoutResult<R> {
        let guard = self.segment.data.read();
        match guard.as_deref() {
            Some(bytes) => Ok(f(bytes)),
            None => Err(FanoutError::stale(
                self.segment.object,
                "shared segment was reclaimed",
            )),
        }
    }

    /// Copy the segment into process memory.
    pub fn to_vec(&self) -> FanoutResult<Vec<u8>> {
        self.read(<[u8]>::to_vec)
    }

    /// Release the segment's memory. Readers observe a stale handle.
    pub fn reclaim(&self) {
        self.segment.data.write().take();
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes")
            .field("object", &self.segment.object)
            .field("len", &self.segment.len)
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

#[derive(Clone, Debug)]
enum SlotState {
    Pending,
    Ready(SharedBytes),
    Failed(TaskError),
}

/// Object store shared by every execution unit of a cluster.
///
/// Each slot starts pending and is completed exactly once by the task or
/// actor call that owns it. Readers wait on the slot's watch channel.
/// Freeing a slot or reclaiming the whole store drops the sender, which
/// wakes any waiter with a stale-handle error.
pub struct SharedObjectStore {
    next_id: AtomicU64,
    slots: Mutex<HashMap<ObjectId, watch::Sender<SlotState>>>,
    reclaimed: AtomicBool,
    bytes_in_use: AtomicUsize,
}

impl fmt::Debug for SharedObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SharedObjectStore");
        match self.slots.try_lock() {
            Some(slots) => {
                debug.field("slots", &slots.len());
            }
            None => {
                debug.field("slots", &"<locked>");
            }
        }
        debug
            .field("bytes_in_use", &self.bytes_in_use())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

impl Default for SharedObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedObjectStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            reclaimed: AtomicBool::new(false),
            bytes_in_use: AtomicUsize::new(0),
        }
    }

    /// Reserve a pending slot.
    pub fn allocate(&self) -> FanoutResult<ObjectId> {
        let mut slots = self.slots.lock();
        if self.is_reclaimed() {
            return Err(FanoutError::SessionClosed);
        }
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, _rx) = watch::channel(SlotState::Pending);
        slots.insert(id, tx);
        Ok(id)
    }

    /// Record the result of the work owning `object`.
    ///
    /// Completing a slot that was freed in the meantime drops the value.
    pub fn complete(&self, object: ObjectId, outcome: Result<Vec<u8>, TaskError>) {
        let slots = self.slots.lock();
        let Some(tx) = slots.get(&object) else {
            tracing::debug!(%object, "dropping result for released object");
            return;
        };
        let state = match outcome {
            Ok(bytes) => {
                self.bytes_in_use.fetch_add(bytes.len(), Ordering::Relaxed);
                SlotState::Ready(SharedBytes::new(object, bytes))
            }
            Err(err) => SlotState::Failed(err),
        };
        tx.send_replace(state);
    }

    /// Store an already-available value.
    pub fn put(&self, bytes: Vec<u8>) -> FanoutResult<ObjectId> {
        let object = self.allocate()?;
        self.complete(object, Ok(bytes));
        Ok(object)
    }

    /// Wait until `object` completes.
    pub async fn get(&self, object: ObjectId) -> FanoutResult<TaskOutcome> {
        let mut rx = {
            let slots = self.slots.lock();
            match slots.get(&object) {
                Some(tx) => tx.subscribe(),
                None if self.is_reclaimed() => {
                    return Err(FanoutError::stale(
                        object,
                        "object store was reclaimed at shutdown",
                    ));
                }
                None => {
                    return Err(FanoutError::stale(
                        object,
                        "object was released or never existed",
                    ));
                }
            }
        };

        let state = rx
            .wait_for(|state| !matches!(state, SlotState::Pending))
            .await
            .map_err(|_| {
                FanoutError::stale(object, "object was released while pending")
            })?
            .clone();

        match state {
            SlotState::Ready(bytes) => Ok(Ok(bytes)),
            SlotState::Failed(err) => Ok(Err(err)),
            SlotState::Pending => Err(FanoutError::stale(
                object,
                "object was released while pending",
            )),
        }
    }

    /// Whether `object` has completed.
    pub fn is_ready(&self, object: ObjectId) -> bool {
        self.slots
            .lock()
            .get(&object)
            .is_some_and(|tx| !matches!(*tx.borrow(), SlotState::Pending))
    }

    /// Release `object`, reclaiming its segment.
    pub fn free(&self, object: ObjectId) -> bool {
        let removed = self.slots.lock().remove(&object);
        match removed {
            Some(tx) => {
                self.reclaim_slot(&tx);
                true
            }
            None => false,
        }
    }

    /// Reclaim every segment and refuse further allocations.
    pub fn reclaim_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock();
            self.reclaimed.store(true, Ordering::SeqCst);
            slots.drain().map(|(_, tx)| tx).collect()
        };
        for tx in &drained {
            self.reclaim_slot(tx);
        }
        drained.len()
    }

    fn reclaim_slot(&self, tx: &watch::Sender<SlotState>) {
        if let SlotState::Ready(bytes) = &*tx.borrow() {
            bytes.reclaim();
            self.bytes_in_use.fetch_sub(bytes.len(), Ordering::Relaxed);
        }
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slots are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by live, completed segments.
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// Whether the store has been reclaimed.
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorKind;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_get_waits_for_completion() {
        let store = Arc::new(SharedObjectStore::new());
        let object = store.allocate().unwrap();
        assert!(!store.is_ready(object));

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.complete(object, Ok(b"hello".to_vec()));
        });

        let outcome = timeout(Duration::from_secs(5), store.get(object))
            .await
            .expect("get did not complete")
            .unwrap();
        let view = outcome.unwrap();
        assert_eq!(view.to_vec().unwrap(), b"hello");
        assert!(store.is_ready(object));
        assert_eq!(store.bytes_in_use(), 5);
    }

    #[tokio::test]
    async fn test_failed_slot_returns_task_error() {
        let store = SharedObjectStore::new();
        let object = store.allocate().unwrap();
        let err = TaskError::new(TaskErrorKind::Raised, "t", "boom");
        store.complete(object, Err(err.clone()));

        let outcome = store.get(object).await.unwrap();
        assert_eq!(outcome.unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_views_go_stale_after_reclaim() {
        let store = SharedObjectStore::new();
        let object = store.put(vec![1, 2, 3]).unwrap();
        let view = store.get(object).await.unwrap().unwrap();
        assert_eq!(view.read(|b| b.len()).unwrap(), 3);

        assert_eq!(store.reclaim_all(), 1);
        assert!(view.is_reclaimed());
        assert!(view.to_vec().unwrap_err().is_stale());
        assert!(store.get(object).await.unwrap_err().is_stale());
        assert!(matches!(
            store.allocate(),
            Err(FanoutError::SessionClosed)
        ));
        assert_eq!(store.bytes_in_use(), 0);
    }

    #[tokio::test]
    async fn test_free_wakes_pending_waiters() {
        let store = Arc::new(SharedObjectStore::new());
        let object = store.allocate().unwrap();

        let reader = Arc::clone(&store);
        let waiter = tokio::spawn(async move { reader.get(object).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.free(object));
        let result = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert!(result.unwrap_err().is_stale());
        assert!(!store.free(object));
    }

    #[tokio::test]
    async fn test_complete_after_free_is_dropped() {
        let store = SharedObjectStore::new();
        let object = store.allocate().unwrap();
        store.free(object);
        store.complete(object, Ok(vec![0; 16]));
        assert_eq!(store.bytes_in_use(), 0);
        assert!(store.is_empty());
    }
}
