use async_trait::async_trait;
use fanout::cluster::{ActorCall, ActorSpec, ClusterRuntime, LocalCluster, RemoteTask, TaskOutcome};
use fanout::{ActorId, ClusterConfig, FanoutResult, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Counters for the calls a [`RecordingRuntime`] has seen.
#[derive(Clone, Debug, Default)]
pub struct RuntimeCalls {
    pub submits: usize,
    pub puts: usize,
    pub gets: usize,
    pub frees: usize,
    pub kills: usize,
    pub shutdowns: usize,
    /// Spawned actors in spawn order, with their names.
    pub spawned: Vec<(ActorId, String)>,
    /// Method calls queued per actor.
    pub actor_calls: HashMap<ActorId, usize>,
}

impl RuntimeCalls {
    /// Every operation that reached the runtime.
    pub fn total(&self) -> usize {
        self.submits
            + self.puts
            + self.gets
            + self.frees
            + self.kills
            + self.shutdowns
            + self.spawned.len()
            + self.actor_calls.values().sum::<usize>()
    }
}

/// Cluster runtime that forwards to another runtime and records each call.
pub struct RecordingRuntime {
    inner: Arc<dyn ClusterRuntime>,
    calls: Mutex<RuntimeCalls>,
}

impl RecordingRuntime {
    pub fn new(inner: Arc<dyn ClusterRuntime>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(RuntimeCalls::default()),
        })
    }

    /// Record calls made against a fresh [`LocalCluster`].
    pub fn local(config: ClusterConfig) -> FanoutResult<Arc<Self>> {
        let cluster: Arc<dyn ClusterRuntime> = LocalCluster::connect(config)?;
        Ok(Self::new(cluster))
    }

    pub fn calls(&self) -> RuntimeCalls {
        self.calls.lock().clone()
    }

    /// Calls queued per actor, keyed by actor name.
    pub fn calls_by_actor(&self) -> Vec<(String, usize)> {
        let calls = self.calls.lock();
        calls
            .spawned
            .iter()
            .map(|(id, name)| (name.clone(), calls.actor_calls.get(id).copied().unwrap_or(0)))
            .collect()
    }

    pub fn assert_untouched(&self) {
        let calls = self.calls();
        assert_eq!(
            calls.total(),
            0,
            "Expected no runtime calls, got {calls:?}"
        );
    }

    pub fn clear(&self) {
        *self.calls.lock() = RuntimeCalls::default();
    }
}

#[async_trait]
impl ClusterRuntime for RecordingRuntime {
    fn address(&self) -> &str {
        self.inner.address()
    }

    fn submit(&self, task: RemoteTask) -> FanoutResult<ObjectId> {
        trace!(task = task.name(), "recorded submit");
        self.calls.lock().submits += 1;
        self.inner.submit(task)
    }

    fn spawn_actor(&self, spec: ActorSpec) -> FanoutResult<ActorId> {
        let name = spec.name().to_string();
        let id = self.inner.spawn_actor(spec)?;
        self.calls.lock().spawned.push((id, name));
        Ok(id)
    }

    fn call_actor(&self, actor: ActorId, call: ActorCall) -> FanoutResult<ObjectId> {
        *self.calls.lock().actor_calls.entry(actor).or_default() += 1;
        self.inner.call_actor(actor, call)
    }

    fn kill_actor(&self, actor: ActorId) -> FanoutResult<()> {
        self.calls.lock().kills += 1;
        self.inner.kill_actor(actor)
    }

    fn put(&self, bytes: Vec<u8>) -> FanoutResult<ObjectId> {
        self.calls.lock().puts += 1;
        self.inner.put(bytes)
    }

    async fn get(&self, object: ObjectId) -> FanoutResult<TaskOutcome> {
        self.calls.lock().gets += 1;
        self.inner.get(object).await
    }

    fn free(&self, object: ObjectId) {
        self.calls.lock().frees += 1;
        self.inner.free(object);
    }

    async fn shutdown(&self) -> FanoutResult<()> {
        self.calls.lock().shutdowns += 1;
        self.inner.shutdown().await
    }
}
