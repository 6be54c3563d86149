use std::any::{Any, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, warn};

use crate::cluster::{ActorCall, ClusterRuntime, TaskOutcome};
use crate::config::ActorPoolOptions;
use crate::error::{FanoutError, FanoutResult, TaskError};
use crate::object::{ActorRef, ObjectId};
use crate::results::{MapResults, SharedChunk};
use crate::session::{ClusterSession, invoke_on};
use crate::store::ResultStore;
use crate::telemetry::{self, ACTOR_POOL, MapTimer};

use super::balance::ActorLoadBalancer;

type Completion = (usize, usize, FanoutResult<TaskOutcome>);

/// Applies an actor method to every item using a pool of stateful actors.
///
/// Each map call spawns its own pool, constructing every actor once from
/// the same arguments, and routes items to actors with an
/// [`ActorLoadBalancer`]. Results come back in input order. Actors are
/// terminated before the call returns, whether it succeeded or not, and
/// also when the map future is dropped early.
pub struct ActorPoolMap<'s> {
    session: &'s ClusterSession,
    options: ActorPoolOptions,
}

impl fmt::Debug for ActorPoolMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorPoolMap")
            .field("session", &self.session.id())
            .field("options", &self.options)
            .finish()
    }
}

/// Per-call bookkeeping while items are in flight.
struct Collector {
    balancer: ActorLoadBalancer,
    outcomes: Vec<Option<FanoutResult<TaskOutcome>>>,
    completed: usize,
    failed: bool,
}

impl Collector {
    fn absorb(&mut self, (index, actor, outcome): Completion) {
        self.balancer.complete(actor);
        if !matches!(outcome, Ok(Ok(_))) {
            self.failed = true;
        }
        self.outcomes[index] = Some(outcome);
        self.completed += 1;
        telemetry::record_progress(ACTOR_POOL, self.completed, self.outcomes.len());
    }
}

impl<'s> ActorPoolMap<'s> {
    pub fn new(session: &'s ClusterSession) -> Self {
        Self {
            session,
            options: ActorPoolOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ActorPoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.options.pool_size = pool_size;
        self
    }

    /// Construct `pool_size` actors with `ctor(ctor_args)` and apply
    /// `method` to every item.
    pub async fn map<S, A, I, O, C, M>(
        &self,
        ctor: C,
        ctor_args: A,
        method: M,
        items: impl IntoIterator<Item = I>,
    ) -> FanoutResult<MapResults<O>>
    where
        S: Send + 'static,
        A: Clone + Send + 'static,
        I: Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        C: Fn(A) -> anyhow::Result<S> + Send + Sync + 'static,
        M: Fn(&mut S, I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        self.map_with(
            ctor,
            ctor_args,
            move |state: &mut S, item, _: &()| method(state, item),
            items,
            (),
        )
        .await
    }

    /// Like [`map`](Self::map), passing every call a reference to the same
    /// `broadcast` value.
    pub async fn map_with<S, A, I, B, O, C, M>(
        &self,
        ctor: C,
        ctor_args: A,
        method: M,
        items: impl IntoIterator<Item = I>,
        broadcast: B,
    ) -> FanoutResult<MapResults<O>>
    where
        S: Send + 'static,
        A: Clone + Send + 'static,
        I: Send + 'static,
        B: Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        C: Fn(A) -> anyhow::Result<S> + Send + Sync + 'static,
        M: Fn(&mut S, I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let items: Vec<I> = items.into_iter().collect();
        let name = self
            .options
            .name
            .clone()
            .unwrap_or_else(|| type_name::<S>().to_string());
        if items.is_empty() {
            debug!(actor = %name, "empty input, no actors spawned");
            return Ok(MapResults::local(Vec::new()));
        }
        if self.options.pool_size == 0 {
            return Err(FanoutError::invalid_argument("pool_size must be at least 1"));
        }
        let pool_size = self.options.pool_size.min(items.len());

        let span = telemetry::actor_map_span(&name, items.len(), pool_size);
        let timer = MapTimer::start(ACTOR_POOL, name.as_str());
        let result = async {
            let pool = self.spawn_pool(&name, pool_size, ctor, ctor_args)?;
            self.dispatch(&name, &pool.actors, Arc::new(method), Arc::new(broadcast), items)
                .await
        }
        .instrument(span)
        .await;
        timer.finish(if result.is_ok() { "success" } else { "failure" });
        result
    }

    fn spawn_pool<S, A, C>(
        &self,
        name: &str,
        pool_size: usize,
        ctor: C,
        ctor_args: A,
    ) -> FanoutResult<ActorPool<'s, S>>
    where
        S: Send + 'static,
        A: Clone + Send + 'static,
        C: Fn(A) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let ctor = Arc::new(ctor);
        let mut pool = ActorPool {
            session: self.session,
            actors: Vec::with_capacity(pool_size),
        };
        for index in 0..pool_size {
            let ctor = Arc::clone(&ctor);
            let actor = self.session.spawn_actor(
                &format!("{name}-{index}"),
                move |args| ctor(args),
                ctor_args.clone(),
            )?;
            pool.actors.push(actor);
        }
        debug!(actor = %name, pool_size, "actor pool started");
        Ok(pool)
    }

    async fn dispatch<S, I, B, O, M>(
        &self,
        name: &str,
        actors: &[ActorRef<S>],
        method: Arc<M>,
        broadcast: Arc<B>,
        items: Vec<I>,
    ) -> FanoutResult<MapResults<O>>
    where
        S: Send + 'static,
        I: Send + 'static,
        B: Send + Sync + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        M: Fn(&mut S, I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let total = items.len();
        let runtime = Arc::clone(self.session.runtime());
        let mut collector = Collector {
            balancer: ActorLoadBalancer::new(
                actors.len(),
                self.options.balancing,
                self.options.effective_max_in_flight(),
            ),
            outcomes: (0..total).map(|_| None).collect(),
            completed: 0,
            failed: false,
        };
        let mut dispatched = Dispatched {
            store: self.session.store(),
            objects: Vec::with_capacity(total),
        };
        let mut pending = FuturesUnordered::new();
        let mut dispatch_error = None;

        let mut queue = items.into_iter().enumerate();
        let mut next = queue.next();
        while let Some((index, item)) = next.take() {
            while let Some(Some(done)) = pending.next().now_or_never() {
                collector.absorb(done);
            }
            if collector.failed {
                break;
            }

            let Some(actor) = collector.balancer.assign() else {
                next = Some((index, item));
                if let Some(done) = pending.next().await {
                    collector.absorb(done);
                }
                continue;
            };

            let call = item_call(name, index, Arc::clone(&method), Arc::clone(&broadcast), item);
            match self.session.call_actor_raw(&actors[actor], call) {
                Ok(object) => {
                    dispatched.store.track::<O>(object);
                    dispatched.objects.push(object);
                    pending.push(wait_for(Arc::clone(&runtime), index, actor, object));
                }
                Err(err) => {
                    dispatch_error = Some(err);
                    break;
                }
            }
            next = queue.next();
        }
        telemetry::record_tasks_submitted(ACTOR_POOL, dispatched.objects.len());

        while let Some(done) = pending.next().await {
            collector.absorb(done);
        }

        if let Some(err) = dispatch_error {
            return Err(err);
        }

        let mut chunks = Vec::with_capacity(total);
        for (index, outcome) in collector.outcomes.into_iter().enumerate() {
            let err = match outcome {
                Some(Ok(Ok(view))) => {
                    chunks.push(SharedChunk::single(view));
                    continue;
                }
                Some(Ok(Err(task_err))) if task_err.item.is_none() => {
                    FanoutError::task_failure(task_err.at_item(index))
                }
                Some(Ok(Err(task_err))) => FanoutError::task_failure(task_err),
                Some(Err(err)) => err,
                None => FanoutError::invalid_argument(format!(
                    "item {index} was not dispatched"
                )),
            };
            let err = err.in_chunk(index);
            telemetry::record_task_failed(ACTOR_POOL, name, err.failed_item(), &err);
            return Err(err);
        }

        debug!(
            actor = %name,
            assigned = ?collector.balancer.assigned(),
            "actor pool map collected"
        );
        let results = MapResults::shared(Arc::clone(dispatched.keep()), chunks);
        self.session.register_results(&results);
        Ok(results)
    }
}

/// Actors spawned for one map call.
///
/// Dropping the pool terminates every actor, so a map that fails, or whose
/// future is dropped before it finishes, does not leave actors running.
struct ActorPool<'s, S> {
    session: &'s ClusterSession,
    actors: Vec<ActorRef<S>>,
}

impl<S> Drop for ActorPool<'_, S> {
    fn drop(&mut self) {
        for actor in self.actors.drain(..) {
            if let Err(err) = self.session.kill_actor(&actor) {
                warn!(actor = %actor.id(), error = %err, "failed to terminate pool actor");
            }
        }
    }
}

/// Objects issued by a map call that no result set owns yet. Released on
/// drop unless handed over with [`keep`](Self::keep).
struct Dispatched<'s> {
    store: &'s Arc<ResultStore>,
    objects: Vec<ObjectId>,
}

impl<'s> Dispatched<'s> {
    fn keep(mut self) -> &'s Arc<ResultStore> {
        self.objects.clear();
        self.store
    }
}

impl Drop for Dispatched<'_> {
    fn drop(&mut self) {
        for object in self.objects.drain(..) {
            self.store.release(object);
        }
    }
}

fn item_call<S, I, B, O, M>(
    name: &str,
    index: usize,
    method: Arc<M>,
    broadcast: Arc<B>,
    item: I,
) -> ActorCall
where
    S: Send + 'static,
    I: Send + 'static,
    B: Send + Sync + 'static,
    O: Serialize + 'static,
    M: Fn(&mut S, I, &B) -> anyhow::Result<O> + Send + Sync + 'static,
{
    let invoke = invoke_on(
        name,
        move |state: &mut S, item: I| method(state, item, &*broadcast),
        item,
    );
    let method_name = name.to_string();
    ActorCall::new(name, move |state: &mut (dyn Any + Send)| {
        match panic::catch_unwind(AssertUnwindSafe(|| invoke(state))) {
            Ok(outcome) => outcome.map_err(|err| err.at_item(index)),
            Err(payload) => Err(TaskError::panicked(method_name, payload.as_ref()).at_item(index)),
        }
    })
}

async fn wait_for(
    runtime: Arc<dyn ClusterRuntime>,
    index: usize,
    actor: usize,
    object: ObjectId,
) -> Completion {
    (index, actor, runtime.get(object).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::config::{Balancing, ClusterConfig};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn session() -> ClusterSession {
        ClusterSession::start(ClusterConfig::local()).await.unwrap()
    }

    struct Model {
        scale: u64,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_actor_map_preserves_order() {
        let session = session().await;
        let results = ActorPoolMap::new(&session)
            .with_pool_size(3)
            .map(
                |scale: u64| Ok(Model { scale }),
                10,
                |model: &mut Model, x: u64| Ok(x * model.scale),
                0..25u64,
            )
            .await
            .unwrap();

        let expected: Vec<u64> = (0..25).map(|x| x * 10).collect();
        assert_eq!(results.to_vec().unwrap(), expected);
        assert!(session.live_actors().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_constructor_runs_once_per_actor() {
        let session = session().await;
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);

        ActorPoolMap::new(&session)
            .with_options(ActorPoolOptions::new(4).with_balancing(Balancing::RoundRobin))
            .map(
                move |_: ()| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                (),
                |_: &mut (), x: u8| Ok(x),
                0..40u8,
            )
            .await
            .unwrap();

        assert_eq!(constructed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_size_is_capped_by_items() {
        let session = session().await;
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);

        let results = ActorPoolMap::new(&session)
            .with_pool_size(8)
            .map(
                move |_: ()| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                (),
                |_: &mut (), x: u8| Ok(x),
                vec![1, 2],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(constructed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_item_fails_map_and_tears_down() {
        let session = session().await;
        let err = ActorPoolMap::new(&session)
            .with_pool_size(2)
            .map(
                |_: ()| Ok(()),
                (),
                |_: &mut (), x: usize| {
                    if x == 5 {
                        bail!("bad row {x}");
                    }
                    Ok(x)
                },
                0..12usize,
            )
            .await
            .unwrap_err();

        assert_eq!(err.failed_item(), Some(5));
        assert!(matches!(err, FanoutError::TaskFailure { chunk: Some(5), .. }));
        assert!(session.live_actors().is_empty());
        assert_eq!(session.store().outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_constructor_failure_fails_map() {
        let session = session().await;
        let err = ActorPoolMap::new(&session)
            .with_pool_size(2)
            .map(
                |_: ()| -> anyhow::Result<()> { bail!("model file missing") },
                (),
                |_: &mut (), x: u8| Ok(x),
                vec![1, 2, 3],
            )
            .await
            .unwrap_err();

        match err {
            FanoutError::TaskFailure { source, .. } => {
                assert!(source.message.contains("model file missing"));
            }
            other => panic!("expected task failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_pool_size_is_rejected() {
        let session = session().await;
        let err = ActorPoolMap::new(&session)
            .with_pool_size(0)
            .map(|_: ()| Ok(()), (), |_: &mut (), x: u8| Ok(x), vec![1])
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcast_reaches_every_call() {
        let session = session().await;
        let results = ActorPoolMap::new(&session)
            .with_pool_size(2)
            .map_with(
                |_: ()| Ok(()),
                (),
                |_: &mut (), word: &'static str, suffix: &String| Ok(format!("{word}{suffix}")),
                ["a", "b", "c"],
                "!".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(results.to_vec().unwrap(), vec!["a!", "b!", "c!"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_map_terminates_pool() {
        let config = ClusterConfig::local();
        let cluster = LocalCluster::connect(config.clone()).unwrap();
        let runtime: Arc<dyn ClusterRuntime> = cluster.clone();
        let session = ClusterSession::with_runtime(config, runtime);

        let pool = ActorPoolMap::new(&session).with_pool_size(3);
        let map = pool.map(
            |_: ()| Ok(()),
            (),
            |_: &mut (), x: u32| {
                thread::sleep(Duration::from_millis(50));
                Ok(x)
            },
            0..30u32,
        );
        assert!(timeout(Duration::from_millis(60), map).await.is_err());

        assert_eq!(cluster.actor_count(), 0);
        assert!(session.live_actors().is_empty());
        assert_eq!(session.store().outstanding(), 0);

        // Calls that were running finish into released slots.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cluster.objects().is_empty());
    }
}
