use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the result store of one cluster session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StoreId(pub Uuid);

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot of an object in the cluster's shared object store.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64);

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Identifies an actor hosted by the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// Opaque, typed reference to a value in a session's result store.
///
/// A handle is a `{store, slot}` pair; it carries no data and can only be
/// resolved through the [`ResultStore`](crate::store::ResultStore) that
/// issued it. Once the owning session shuts down, resolving a handle that
/// was never materialized fails with
/// [`FanoutError::StaleHandle`](crate::FanoutError::StaleHandle).
pub struct ResultHandle<T> {
    store: StoreId,
    object: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResultHandle<T> {
    pub(crate) fn new(store: StoreId, object: ObjectId) -> Self {
        Self {
            store,
            object,
            _marker: PhantomData,
        }
    }

    /// Store that issued this handle.
    pub fn store_id(&self) -> StoreId {
        self.store
    }

    /// Slot in the shared object store.
    pub fn object_id(&self) -> ObjectId {
        self.object
    }
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResultHandle<T> {}

impl<T> PartialEq for ResultHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.store == other.store && self.object == other.object
    }
}

impl<T> Eq for ResultHandle<T> {}

impl<T> Hash for ResultHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.store.hash(state);
        self.object.hash(state);
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("store", &self.store)
            .field("object", &self.object)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Display for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.object)
    }
}

/// Typed reference to an actor whose state is an `S`.
pub struct ActorRef<S> {
    id: ActorId,
    store: StoreId,
    name: Arc<str>,
    _marker: PhantomData<fn() -> S>,
}

impl<S> ActorRef<S> {
    pub(crate) fn new(id: ActorId, store: StoreId, name: Arc<str>) -> Self {
        Self {
            id,
            store,
            name,
            _marker: PhantomData,
        }
    }

    /// Actor identifier assigned by the cluster.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// Session store the actor belongs to.
    pub fn store_id(&self) -> StoreId {
        self.store
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S> Clone for ActorRef<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: self.store,
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<S> fmt::Debug for ActorRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state_type", &std::any::type_name::<S>())
            .finish()
    }
}
