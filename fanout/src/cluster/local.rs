use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, info, warn};

use super::object_store::{SharedObjectStore, TaskOutcome};
use super::{ActorCall, ActorSpec, ClusterRuntime, RemoteTask};
use crate::config::{ClusterConfig, LOCAL_ADDRESS};
use crate::error::{FanoutError, FanoutResult, TaskError, TaskErrorKind};
use crate::object::{ActorId, ObjectId};

const LOCAL_SCHEME: &str = "local://";

/// Token for signaling cluster shutdown to pending tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

struct ActorMessage {
    object: ObjectId,
    call: ActorCall,
}

struct ActorHost {
    name: String,
    mailbox: mpsc::UnboundedSender<ActorMessage>,
    killed: Arc<AtomicBool>,
}

/// In-process cluster runtime.
///
/// Stateless tasks run on tokio's blocking pool, at most `num_workers` at
/// a time. Each actor gets a dedicated OS thread that owns its state and
/// drains its mailbox in order. Results live in a [`SharedObjectStore`]
/// whose segments are all reclaimed by [`shutdown`](ClusterRuntime::shutdown).
pub struct LocalCluster {
    address: String,
    name: String,
    config: ClusterConfig,
    handle: Handle,
    objects: Arc<SharedObjectStore>,
    workers: Arc<Semaphore>,
    actors: Mutex<HashMap<ActorId, ActorHost>>,
    shutdown: ShutdownToken,
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actor_count = self
            .actors
            .try_lock()
            .map(|actors| actors.len())
            .unwrap_or_default();

        f.debug_struct("LocalCluster")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("num_workers", &self.config.effective_workers())
            .field("objects", &self.objects)
            .field("actor_count", &actor_count)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl LocalCluster {
    /// Start an in-process cluster on the current tokio runtime.
    ///
    /// Fails with `ClusterUnavailable` when the address does not name an
    /// in-process cluster or no tokio runtime is running.
    pub fn connect(config: ClusterConfig) -> FanoutResult<Arc<Self>> {
        let name = parse_address(&config.address)?;
        let handle = Handle::try_current().map_err(|err| {
            FanoutError::unavailable(
                config.address.clone(),
                format!("no tokio runtime: {err}"),
            )
        })?;
        let workers = config.effective_workers();

        info!(
            address = %config.address,
            cluster = %name,
            namespace = %config.namespace,
            workers,
            "local cluster started"
        );

        Ok(Arc::new(Self {
            address: config.address.clone(),
            name,
            config,
            handle,
            objects: Arc::new(SharedObjectStore::new()),
            workers: Arc::new(Semaphore::new(workers)),
            actors: Mutex::new(HashMap::new()),
            shutdown: ShutdownToken::new(),
        }))
    }

    /// Cluster name parsed from the address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object store backing this cluster.
    pub fn objects(&self) -> &Arc<SharedObjectStore> {
        &self.objects
    }

    /// Number of live actors.
    pub fn actor_count(&self) -> usize {
        self.actors.lock().len()
    }

    /// Whether shutdown has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> FanoutResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(FanoutError::SessionClosed);
        }
        Ok(())
    }
}

fn parse_address(address: &str) -> FanoutResult<String> {
    if address == LOCAL_ADDRESS {
        return Ok(LOCAL_ADDRESS.to_string());
    }
    match address.strip_prefix(LOCAL_SCHEME) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        Some(_) => Err(FanoutError::unavailable(address, "missing cluster name")),
        None => Err(FanoutError::unavailable(
            address,
            "only in-process clusters are supported",
        )),
    }
}

fn run_actor_host(
    id: ActorId,
    spec: ActorSpec,
    mut mailbox: mpsc::UnboundedReceiver<ActorMessage>,
    objects: Arc<SharedObjectStore>,
    killed: Arc<AtomicBool>,
) {
    let name = spec.name().to_string();
    let constructed = match panic::catch_unwind(AssertUnwindSafe(|| spec.construct())) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::panicked(name.as_str(), payload.as_ref())),
    };

    let mut state = match constructed {
        Ok(state) => state,
        Err(err) => {
            warn!(actor = %id, %name, error = %err, "actor failed to start");
            while let Some(message) = mailbox.blocking_recv() {
                objects.complete(
                    message.object,
                    Err(TaskError::new(
                        TaskErrorKind::ActorDied,
                        message.call.method(),
                        format!("actor {name} failed to start: {}", err.message),
                    )),
                );
            }
            return;
        }
    };
    debug!(actor = %id, %name, "actor started");

    while let Some(ActorMessage { object, call }) = mailbox.blocking_recv() {
        if killed.load(Ordering::SeqCst) {
            objects.complete(
                object,
                Err(TaskError::new(
                    TaskErrorKind::ActorKilled,
                    call.method(),
                    format!("actor {name} was terminated"),
                )),
            );
            continue;
        }

        let method = call.method().to_string();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| call.invoke(&mut *state))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::panicked(method, payload.as_ref())),
        };
        objects.complete(object, outcome);
    }

    debug!(actor = %id, %name, "actor stopped");
}

#[async_trait]
impl ClusterRuntime for LocalCluster {
    fn address(&self) -> &str {
        &self.address
    }

    fn submit(&self, task: RemoteTask) -> FanoutResult<ObjectId> {
        self.ensure_running()?;
        let object = self.objects.allocate()?;
        let (name, body) = task.into_parts();
        let objects = Arc::clone(&self.objects);
        let workers = Arc::clone(&self.workers);
        let shutdown = self.shutdown.clone();

        self.handle.spawn(async move {
            let permit = tokio::select! {
                permit = workers.acquire_owned() => permit.ok(),
                _ = shutdown.cancelled() => None,
            };
            let Some(permit) = permit else {
                objects.complete(
                    object,
                    Err(TaskError::new(
                        TaskErrorKind::Cancelled,
                        name,
                        "cluster shut down before the task ran",
                    )),
                );
                return;
            };

            let outcome = match tokio::task::spawn_blocking(body).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(TaskError::panicked(name, err.into_panic().as_ref()))
                }
                Err(_) => Err(TaskError::new(
                    TaskErrorKind::Cancelled,
                    name,
                    "task was aborted",
                )),
            };
            drop(permit);
            objects.complete(object, outcome);
        });

        Ok(object)
    }

    fn spawn_actor(&self, spec: ActorSpec) -> FanoutResult<ActorId> {
        self.ensure_running()?;
        let id = ActorId::new();
        let name = spec.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let killed = Arc::new(AtomicBool::new(false));

        let objects = Arc::clone(&self.objects);
        let host_killed = Arc::clone(&killed);
        std::thread::Builder::new()
            .name(format!("fanout-actor-{name}"))
            .spawn(move || run_actor_host(id, spec, rx, objects, host_killed))
            .map_err(|err| {
                FanoutError::unavailable(
                    self.address.clone(),
                    format!("failed to start actor host: {err}"),
                )
            })?;

        self.actors.lock().insert(
            id,
            ActorHost {
                name,
                mailbox: tx,
                killed,
            },
        );
        Ok(id)
    }

    fn call_actor(&self, actor: ActorId, call: ActorCall) -> FanoutResult<ObjectId> {
        self.ensure_running()?;
        let actors = self.actors.lock();
        let host = actors.get(&actor).ok_or(FanoutError::UnknownActor(actor))?;
        let object = self.objects.allocate()?;

        if let Err(mpsc::error::SendError(message)) =
            host.mailbox.send(ActorMessage { object, call })
        {
            self.objects.complete(
                message.object,
                Err(TaskError::new(
                    TaskErrorKind::ActorDied,
                    message.call.method(),
                    format!("actor {} exited", host.name),
                )),
            );
        }
        Ok(object)
    }

    fn kill_actor(&self, actor: ActorId) -> FanoutResult<()> {
        let host = self
            .actors
            .lock()
            .remove(&actor)
            .ok_or(FanoutError::UnknownActor(actor))?;
        host.killed.store(true, Ordering::SeqCst);
        debug!(actor = %actor, name = %host.name, "actor killed");
        Ok(())
    }

    fn put(&self, bytes: Vec<u8>) -> FanoutResult<ObjectId> {
        self.ensure_running()?;
        self.objects.put(bytes)
    }

    async fn get(&self, object: ObjectId) -> FanoutResult<TaskOutcome> {
        self.objects.get(object).await
    }

    fn free(&self, object: ObjectId) {
        self.objects.free(object);
    }

    async fn shutdown(&self) -> FanoutResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let hosts: Vec<ActorHost> =
            self.actors.lock().drain().map(|(_, host)| host).collect();
        for host in &hosts {
            host.killed.store(true, Ordering::SeqCst);
        }
        let actors = hosts.len();
        drop(hosts);

        self.workers.close();
        let reclaimed = self.objects.reclaim_all();

        info!(
            address = %self.address,
            actors,
            reclaimed_objects = reclaimed,
            "local cluster shut down"
        );
        Ok(())
    }
}
