//! Map integration tests for fanout.
//!
//! Tests ordering under out-of-order completion, fail-fast error
//! reporting, empty input handling, and actor pool load balancing.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use fanout::cluster::ClusterRuntime;
use fanout::{
    ActorPoolMap, ActorPoolOptions, Balancing, ClusterConfig, ClusterSession,
    DEFAULT_MAX_IN_FLIGHT, FanoutError, MapOptions, WorkerPoolMap,
};
use fanout_testkit::{
    Handled, HeadHeavy, RecordingRuntime, Tally, fail_at, jittered_square, per_actor, square,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn recorded_session(workers: usize) -> (ClusterSession, Arc<RecordingRuntime>) {
    let config = ClusterConfig::local().with_num_workers(workers);
    let recording = RecordingRuntime::local(config.clone()).expect("local cluster should start");
    let runtime: Arc<dyn ClusterRuntime> = recording.clone();
    (ClusterSession::with_runtime(config, runtime), recording)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_map_preserves_order_under_random_delays() {
    let session = ClusterSession::start(ClusterConfig::local().with_num_workers(8))
        .await
        .unwrap();

    for chunk_size in [1, 4, 9] {
        let results = timeout(
            TEST_TIMEOUT,
            WorkerPoolMap::new(&session)
                .with_chunk_size(chunk_size)
                .map(jittered_square(10), 0..60u64),
        )
        .await
        .expect("map timed out")
        .unwrap();

        let expected: Vec<u64> = (0..60).map(|x| x * x).collect();
        assert_eq!(results.to_vec().unwrap(), expected, "chunk_size {chunk_size}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actor_map_preserves_order_under_random_delays() {
    let session = ClusterSession::start(ClusterConfig::local()).await.unwrap();
    let ids = Arc::new(AtomicUsize::new(0));

    let results = timeout(
        TEST_TIMEOUT,
        ActorPoolMap::new(&session).with_pool_size(4).map_with(
            Tally::spawn,
            ids,
            Tally::handle_jittered,
            0..50u64,
            10u64,
        ),
    )
    .await
    .expect("actor map timed out")
    .unwrap();

    let values: Vec<u64> = results
        .to_vec()
        .unwrap()
        .into_iter()
        .map(|handled| handled.value)
        .collect();
    assert_eq!(values, (0..50).map(|x| x * x).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_empty_input_never_touches_runtime() {
    let (session, recording) = recorded_session(2);

    let squares = WorkerPoolMap::new(&session)
        .map(square, Vec::<u64>::new())
        .await
        .unwrap();
    assert!(squares.is_empty());
    assert_eq!(squares.to_vec().unwrap(), Vec::<u64>::new());

    let handled = ActorPoolMap::new(&session)
        .with_pool_size(4)
        .map(
            Tally::spawn,
            Arc::new(AtomicUsize::new(0)),
            Tally::handle,
            Vec::<u64>::new(),
        )
        .await
        .unwrap();
    assert!(handled.is_empty());

    recording.assert_untouched();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_failure_references_failing_item() {
    let session = ClusterSession::start(ClusterConfig::local().with_num_workers(4))
        .await
        .unwrap();

    for chunk_size in [1, 8] {
        let err = WorkerPoolMap::new(&session)
            .with_options(MapOptions::default().with_name("validate").with_chunk_size(chunk_size))
            .map(fail_at(17), 0..40usize)
            .await
            .unwrap_err();

        match &err {
            FanoutError::TaskFailure {
                chunk,
                item,
                source,
            } => {
                assert_eq!(*item, Some(17));
                assert_eq!(*chunk, Some(17 / chunk_size));
                assert_eq!(source.task, "validate");
                assert!(source.message.contains("item 17 rejected"));
            }
            other => panic!("expected task failure, got {other:?}"),
        }
        assert!(err.to_string().contains("item 17"));
    }

    assert_eq!(session.store().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actor_failure_references_failing_item() {
    let (session, recording) = recorded_session(2);

    let err = ActorPoolMap::new(&session)
        .with_pool_size(3)
        .map(|_: ()| Ok(()), (), |_: &mut (), x: usize| fail_at(23)(x), 0..30usize)
        .await
        .unwrap_err();

    assert_eq!(err.failed_item(), Some(23));
    assert!(err.to_string().contains("item 23"));

    // Pool actors are torn down even when the map fails.
    let calls = recording.calls();
    assert_eq!(calls.spawned.len(), 3);
    assert_eq!(calls.kills, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_least_outstanding_spreads_uneven_load() {
    let (session, recording) = recorded_session(2);
    let pool_size = 4;
    let items = 40u64;
    let k = 4;
    let cost = HeadHeavy {
        head_ms: 60,
        rest_ms: 3,
    };

    let results = timeout(
        TEST_TIMEOUT,
        ActorPoolMap::new(&session)
            .with_options(ActorPoolOptions::new(pool_size).with_name("tally"))
            .map_with(
                Tally::spawn,
                Arc::new(AtomicUsize::new(0)),
                Tally::handle_costed,
                0..items,
                cost,
            ),
    )
    .await
    .expect("actor map timed out")
    .unwrap();

    let handled: Vec<Handled> = results.to_vec().unwrap();
    assert_eq!(handled.len(), items as usize);

    let bound = (items as usize).div_ceil(pool_size) + k;
    let counts = per_actor(&handled, pool_size);
    assert_eq!(counts.iter().sum::<usize>(), items as usize);
    assert!(
        counts.iter().all(|&count| count <= bound),
        "per-actor counts {counts:?} exceed {bound}"
    );
    // The actor stuck on item 0 only holds what it was given before it
    // stopped completing calls.
    let stuck = counts[handled[0].actor];
    assert!(
        stuck <= DEFAULT_MAX_IN_FLIGHT + 1,
        "actor holding item 0 handled {stuck} items, counts {counts:?}"
    );

    let by_name = recording.calls_by_actor();
    assert_eq!(by_name.len(), pool_size);
    for (name, calls) in by_name {
        assert!(name.starts_with("tally-"), "unexpected actor name {name}");
        assert!(calls <= bound, "{name} received {calls} calls");
    }
    assert_eq!(recording.calls().kills, pool_size);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_item_does_not_pin_half_the_input() {
    let session = ClusterSession::start(ClusterConfig::local()).await.unwrap();
    let cost = HeadHeavy {
        head_ms: 400,
        rest_ms: 2,
    };

    let results = timeout(
        TEST_TIMEOUT,
        ActorPoolMap::new(&session).with_pool_size(2).map_with(
            Tally::spawn,
            Arc::new(AtomicUsize::new(0)),
            Tally::handle_costed,
            0..20u64,
            cost,
        ),
    )
    .await
    .expect("actor map timed out")
    .unwrap();

    let handled = results.to_vec().unwrap();
    let counts = per_actor(&handled, 2);
    assert_eq!(counts.iter().sum::<usize>(), 20);
    // Queued up front, the slow actor would hold 10 of 20 items.
    assert!(
        counts[handled[0].actor] <= 3,
        "actor holding item 0 handled {counts:?}"
    );
    let values: Vec<u64> = handled.iter().map(|h| h.value).collect();
    assert_eq!(values, (0..20).map(|x| x * x).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_assigns_evenly() {
    let session = ClusterSession::start(ClusterConfig::local()).await.unwrap();

    let results = ActorPoolMap::new(&session)
        .with_options(ActorPoolOptions::new(4).with_balancing(Balancing::RoundRobin))
        .map(Tally::spawn, Arc::new(AtomicUsize::new(0)), Tally::handle, 0..40u64)
        .await
        .unwrap();

    let counts = per_actor(&results.to_vec().unwrap(), 4);
    assert_eq!(counts, vec![10, 10, 10, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capped_in_flight_still_completes_in_order() {
    let session = ClusterSession::start(ClusterConfig::local()).await.unwrap();

    let results = ActorPoolMap::new(&session)
        .with_options(ActorPoolOptions::new(3).with_max_in_flight(1))
        .map(Tally::spawn, Arc::new(AtomicUsize::new(0)), Tally::handle, 0..20u64)
        .await
        .unwrap();

    let values: Vec<u64> = results.to_vec().unwrap().iter().map(|h| h.value).collect();
    assert_eq!(values, (0..20).map(|x| x * x).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_unknown_address_is_unavailable() {
    let err = ClusterSession::start(ClusterConfig::new("tcp://10.0.0.1:6379"))
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::ClusterUnavailable { .. }));
}
