//! Cluster session: the owned handle every map call runs against.

use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::cluster::{
    ActorCall, ActorSpec, ActorState, ClusterRuntime, LocalCluster, RemoteTask,
};
use crate::config::ClusterConfig;
use crate::error::{FanoutError, FanoutResult, TaskError, TaskErrorKind};
use crate::object::{ActorId, ActorRef, ResultHandle, StoreId};
use crate::results::{MapResults, Materialize};
use crate::store::ResultStore;

mod builder;

pub use builder::ClusterSessionBuilder;

/// Handle to a running cluster.
///
/// A session owns the [`ResultStore`] for everything submitted through it
/// and tracks the map results and actors it handed out, so that
/// [`before_shutdown`](crate::shutdown::before_shutdown) can drain them.
/// Submission never blocks; failures inside submitted work surface when
/// the handle is fetched.
///
/// [`shutdown`](Self::shutdown) is terminal. Call
/// [`ShutdownCoordinator::shutdown`](crate::shutdown::ShutdownCoordinator::shutdown)
/// instead unless every result has already been materialized.
pub struct ClusterSession {
    config: ClusterConfig,
    runtime: Arc<dyn ClusterRuntime>,
    store: Arc<ResultStore>,
    live_results: Mutex<Vec<Weak<dyn Materialize>>>,
    actors: Mutex<HashSet<ActorId>>,
    started_at: DateTime<Utc>,
    shut_down: AtomicBool,
}

impl fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSession")
            .field("id", &self.id())
            .field("address", &self.runtime.address())
            .field("started_at", &self.started_at)
            .field("store", &self.store)
            .field("actors", &self.actors.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ClusterSession {
    /// Connect to the cluster named by `config.address`.
    ///
    /// Fails with `ClusterUnavailable` when the runtime cannot be reached.
    pub async fn start(config: ClusterConfig) -> FanoutResult<Self> {
        let runtime = LocalCluster::connect(config.clone())?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Wrap an already-connected runtime.
    pub fn with_runtime(config: ClusterConfig, runtime: Arc<dyn ClusterRuntime>) -> Self {
        let store = Arc::new(ResultStore::new(Arc::clone(&runtime)));
        info!(
            session = %store.id(),
            address = %runtime.address(),
            namespace = %config.namespace,
            "cluster session started"
        );
        Self {
            config,
            runtime,
            store,
            live_results: Mutex::new(Vec::new()),
            actors: Mutex::new(HashSet::new()),
            started_at: Utc::now(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start building a session.
    pub fn builder() -> ClusterSessionBuilder {
        ClusterSessionBuilder::new()
    }

    /// Session identifier, shared with its result store.
    pub fn id(&self) -> StoreId {
        self.store.id()
    }

    /// Configuration the session was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Underlying cluster runtime.
    pub fn runtime(&self) -> &Arc<dyn ClusterRuntime> {
        &self.runtime
    }

    /// Result store backing this session's handles.
    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// When the session was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `f(arg)` as a stateless task.
    pub fn submit<A, R, F>(
        &self,
        name: &str,
        f: F,
        arg: A,
    ) -> FanoutResult<ResultHandle<R>>
    where
        A: Send + 'static,
        R: Serialize + 'static,
        F: FnOnce(A) -> anyhow::Result<R> + Send + 'static,
    {
        let task_name = name.to_string();
        self.submit_task(RemoteTask::new(name, move || {
            let value = f(arg).map_err(|err| TaskError::raised(task_name.as_str(), &err))?;
            encode(&task_name, &value)
        }))
    }

    pub(crate) fn submit_task<R>(&self, task: RemoteTask) -> FanoutResult<ResultHandle<R>> {
        self.ensure_open()?;
        let object = self.runtime.submit(task)?;
        Ok(self.store.track(object))
    }

    /// Start an actor whose state is built by `ctor(args)` on the actor's
    /// own host.
    pub fn spawn_actor<S, A, F>(&self, name: &str, ctor: F, args: A) -> FanoutResult<ActorRef<S>>
    where
        S: Send + 'static,
        A: Send + 'static,
        F: FnOnce(A) -> anyhow::Result<S> + Send + 'static,
    {
        self.ensure_open()?;
        let ctor_name = name.to_string();
        let spec = ActorSpec::new(name, move || {
            ctor(args)
                .map(|state| Box::new(state) as ActorState)
                .map_err(|err| TaskError::raised(ctor_name, &err))
        });
        let id = self.runtime.spawn_actor(spec)?;
        self.actors.lock().insert(id);
        crate::telemetry::record_actor_spawned(name);
        Ok(ActorRef::new(id, self.id(), Arc::from(name)))
    }

    /// Queue `f(state, args)` on an actor.
    pub fn call_actor<S, A, R, F>(
        &self,
        actor: &ActorRef<S>,
        method: &str,
        f: F,
        args: A,
    ) -> FanoutResult<ResultHandle<R>>
    where
        S: Send + 'static,
        A: Send + 'static,
        R: Serialize + 'static,
        F: FnOnce(&mut S, A) -> anyhow::Result<R> + Send + 'static,
    {
        let call = ActorCall::new(method, invoke_on(method, f, args));
        let object = self.call_actor_raw(actor, call)?;
        Ok(self.store.track(object))
    }

    pub(crate) fn call_actor_raw<S>(
        &self,
        actor: &ActorRef<S>,
        call: ActorCall,
    ) -> FanoutResult<crate::object::ObjectId> {
        self.ensure_open()?;
        if actor.store_id() != self.id() {
            return Err(FanoutError::UnknownActor(actor.id()));
        }
        self.runtime.call_actor(actor.id(), call)
    }

    /// Terminate an actor. Calls still queued on it fail.
    pub fn kill_actor<S>(&self, actor: &ActorRef<S>) -> FanoutResult<()> {
        if actor.store_id() != self.id() {
            return Err(FanoutError::UnknownActor(actor.id()));
        }
        self.actors.lock().remove(&actor.id());
        if self.is_shut_down() {
            return Ok(());
        }
        self.runtime.kill_actor(actor.id())
    }

    /// Store a caller-produced value in the cluster.
    pub fn put<T: Serialize>(&self, value: &T) -> FanoutResult<ResultHandle<T>> {
        self.ensure_open()?;
        self.store.put(value)
    }

    /// Wait for a handle's value.
    pub async fn fetch<T: DeserializeOwned>(&self, handle: ResultHandle<T>) -> FanoutResult<T> {
        self.store.get(handle).await
    }

    pub(crate) fn register_results<T>(&self, results: &MapResults<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let inner: Arc<dyn Materialize> = results.inner().clone();
        let mut live = self.live_results.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(&inner));
    }

    /// Result sets still reachable by callers.
    pub(crate) fn live_results(&self) -> Vec<Arc<dyn Materialize>> {
        let mut live = self.live_results.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.iter().filter_map(Weak::upgrade).collect()
    }

    /// Actors spawned directly through the session and not yet killed.
    pub(crate) fn live_actors(&self) -> Vec<ActorId> {
        let mut actors: Vec<_> = self.actors.lock().iter().copied().collect();
        actors.sort_by_key(|id| id.0);
        actors
    }

    pub(crate) fn forget_actor(&self, actor: ActorId) {
        self.actors.lock().remove(&actor);
    }

    /// Tear the cluster down.
    ///
    /// Every handle not yet materialized becomes stale. Idempotent.
    pub async fn shutdown(&self) -> FanoutResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let unmaterialized_results = self
            .live_results()
            .iter()
            .filter(|results| !results.is_materialized())
            .count();
        let outstanding = self.store.outstanding();
        if unmaterialized_results > 0 || outstanding > 0 {
            warn!(
                session = %self.id(),
                unmaterialized_results,
                outstanding_handles = outstanding,
                "shutting down with results still in shared memory"
            );
        }

        self.store.close();
        self.actors.lock().clear();
        self.runtime.shutdown().await?;

        info!(
            session = %self.id(),
            uptime_secs = (Utc::now() - self.started_at).num_seconds(),
            "cluster session shut down"
        );
        Ok(())
    }

    fn ensure_open(&self) -> FanoutResult<()> {
        if self.is_shut_down() {
            return Err(FanoutError::SessionClosed);
        }
        Ok(())
    }
}

pub(crate) fn encode<R: Serialize>(task: &str, value: &R) -> Result<Vec<u8>, TaskError> {
    serde_json::to_vec(value).map_err(|err| {
        TaskError::new(TaskErrorKind::Raised, task, format!("failed to encode result: {err}"))
    })
}

/// Wrap a typed actor method as a call on type-erased state.
pub(crate) fn invoke_on<S, A, R, F>(
    method: &str,
    f: F,
    args: A,
) -> impl FnOnce(&mut (dyn std::any::Any + Send)) -> Result<Vec<u8>, TaskError> + Send + 'static
where
    S: Send + 'static,
    A: Send + 'static,
    R: Serialize + 'static,
    F: FnOnce(&mut S, A) -> anyhow::Result<R> + Send + 'static,
{
    let method = method.to_string();
    move |state: &mut (dyn std::any::Any + Send)| {
        let state = state.downcast_mut::<S>().ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::Raised,
                method.as_str(),
                format!("actor state is not a {}", type_name::<S>()),
            )
        })?;
        let value = f(state, args).map_err(|err| TaskError::raised(method.as_str(), &err))?;
        encode(&method, &value)
    }
}
