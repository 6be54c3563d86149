//! Cluster runtime interface.
//!
//! [`ClusterRuntime`] is the boundary between this crate and whatever
//! actually executes work: it accepts stateless tasks and actor calls,
//! keeps their results in a shared object store, and tears everything
//! down on shutdown. Values cross the boundary as bytes; the typed layers
//! in [`session`](crate::session) encode and decode them.
//!
//! [`LocalCluster`] is the in-process implementation used by default.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

use crate::error::{FanoutResult, TaskError};
use crate::object::{ActorId, ObjectId};

/// In-process cluster backed by tokio.
pub mod local;
/// Shared object store and zero-copy segment views.
pub mod object_store;

pub use local::{LocalCluster, ShutdownToken};
pub use object_store::{SharedBytes, SharedObjectStore, TaskOutcome};

/// Type-erased actor state owned by an actor host.
pub type ActorState = Box<dyn Any + Send>;

type TaskBody = Box<dyn FnOnce() -> Result<Vec<u8>, TaskError> + Send>;
type ActorCtor = Box<dyn FnOnce() -> Result<ActorState, TaskError> + Send>;
type ActorInvoke =
    Box<dyn FnOnce(&mut (dyn Any + Send)) -> Result<Vec<u8>, TaskError> + Send>;

/// A stateless unit of work: runs once and produces an encoded value.
pub struct RemoteTask {
    name: String,
    body: TaskBody,
}

impl RemoteTask {
    /// Wrap a task body.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Result<Vec<u8>, TaskError> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    /// Task name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into name and body for execution.
    pub fn into_parts(
        self,
    ) -> (String, impl FnOnce() -> Result<Vec<u8>, TaskError> + Send + 'static)
    {
        (self.name, self.body)
    }
}

impl fmt::Debug for RemoteTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Instructions for constructing an actor's state.
pub struct ActorSpec {
    name: String,
    ctor: ActorCtor,
}

impl ActorSpec {
    /// Wrap an actor constructor.
    pub fn new<F>(name: impl Into<String>, ctor: F) -> Self
    where
        F: FnOnce() -> Result<ActorState, TaskError> + Send + 'static,
    {
        Self {
            name: name.into(),
            ctor: Box::new(ctor),
        }
    }

    /// Actor name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the constructor.
    pub fn construct(self) -> Result<ActorState, TaskError> {
        (self.ctor)()
    }
}

impl fmt::Debug for ActorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A method invocation queued on an actor.
pub struct ActorCall {
    method: String,
    invoke: ActorInvoke,
}

impl ActorCall {
    /// Wrap a method body operating on the actor's state.
    pub fn new<F>(method: impl Into<String>, invoke: F) -> Self
    where
        F: FnOnce(&mut (dyn Any + Send)) -> Result<Vec<u8>, TaskError>
            + Send
            + 'static,
    {
        Self {
            method: method.into(),
            invoke: Box::new(invoke),
        }
    }

    /// Method name used in logs and errors.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Run the method against `state`.
    pub fn invoke(
        self,
        state: &mut (dyn Any + Send),
    ) -> Result<Vec<u8>, TaskError> {
        (self.invoke)(state)
    }
}

impl fmt::Debug for ActorCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCall")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Trait for cluster backends.
///
/// Submission methods never block: they enqueue work and return the id of
/// the object that will hold the result. Failures inside the work are not
/// reported here; they are recorded in the object and surface from
/// [`get`](ClusterRuntime::get).
#[async_trait]
pub trait ClusterRuntime: Send + Sync + 'static {
    /// Address this runtime is connected to.
    fn address(&self) -> &str;

    /// Enqueue a stateless task.
    fn submit(&self, task: RemoteTask) -> FanoutResult<ObjectId>;

    /// Start an actor. Construction happens on the actor's own host.
    fn spawn_actor(&self, spec: ActorSpec) -> FanoutResult<ActorId>;

    /// Queue a method call on an actor. Calls on one actor run in order.
    fn call_actor(
        &self,
        actor: ActorId,
        call: ActorCall,
    ) -> FanoutResult<ObjectId>;

    /// Terminate an actor; calls still queued fail with `ActorKilled`.
    fn kill_actor(&self, actor: ActorId) -> FanoutResult<()>;

    /// Store a caller-produced object.
    fn put(&self, bytes: Vec<u8>) -> FanoutResult<ObjectId>;

    /// Wait for an object and return a zero-copy view of it, or the task
    /// error recorded for it.
    async fn get(&self, object: ObjectId) -> FanoutResult<TaskOutcome>;

    /// Release an object. Its segment is reclaimed.
    fn free(&self, object: ObjectId);

    /// Tear the cluster down. Every segment is reclaimed and every actor
    /// terminated; the runtime accepts no further work.
    async fn shutdown(&self) -> FanoutResult<()>;
}
