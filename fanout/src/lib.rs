//! Fanout - distributed map execution over a compute cluster.
//!
//! Applies a function to every item of a collection using either stateless
//! tasks or a pool of stateful actors, and returns results in input order.
//! Results live in the cluster's shared object store until they are
//! materialized, so a session must be drained before it is shut down.
//!
//! # Core Concepts
//!
//! - **Session**: [`ClusterSession`] owns the connection to a cluster and
//!   the [`ResultStore`] that tracks every object it has handed out.
//!
//! - **Worker pool**: [`WorkerPoolMap`] chunks the input and submits one
//!   stateless task per chunk.
//!
//! - **Actor pool**: [`ActorPoolMap`] spawns a fixed pool of actors, sends
//!   each item to the least busy one, and tears the pool down afterwards.
//!
//! - **Results**: [`MapResults`] keeps map output lazily in shared memory
//!   until it is materialized into process memory.
//!
//! - **Shutdown**: [`ShutdownCoordinator`] (or [`before_shutdown`])
//!   materializes everything still backed by shared memory. Reading an
//!   object after shutdown without doing so fails with
//!   [`FanoutError::StaleHandle`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use fanout::*;
//!
//! let session = ClusterSession::start(ClusterConfig::local()).await?;
//! let squares = WorkerPoolMap::new(&session)
//!     .map(|x: u64| Ok(x * x), 0..100u64)
//!     .await?;
//!
//! before_shutdown(&session).await?;
//! session.shutdown().await?;
//! assert_eq!(squares.get(3)?, Some(9));
//! ```

/// Cluster runtime abstraction and the in-process implementation.
///
/// The `cluster` module defines the [`ClusterRuntime`] trait sessions talk
/// to, along with:
/// - [`LocalCluster`] - thread-backed cluster running in this process
/// - [`SharedObjectStore`] - object slots backed by reclaimable segments
/// - [`SharedBytes`] - zero-copy view into a segment
/// - [`RemoteTask`], [`ActorSpec`] and [`ActorCall`] - units of work
pub mod cluster;

/// Configuration for sessions and map calls.
///
/// The `config` module defines [`ClusterConfig`], [`MapOptions`] and
/// [`ActorPoolOptions`].
pub mod config;

/// Error types.
pub mod error;

/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Identifiers and typed handles.
///
/// The `object` module provides [`ResultHandle`] for objects in the store,
/// [`ActorRef`] for spawned actors, and the [`ObjectId`], [`ActorId`] and
/// [`StoreId`] identifiers.
pub mod object;

/// Worker and actor pool map operations.
pub mod pool;

/// Ordered map output.
pub mod results;

/// Cluster sessions.
///
/// The `session` module provides [`ClusterSession`] and its
/// [`ClusterSessionBuilder`].
pub mod session;

/// Pre-shutdown draining.
///
/// The `shutdown` module provides [`ShutdownCoordinator`], the free
/// function [`before_shutdown`], and the [`ShutdownReport`] they return.
pub mod shutdown;

/// Tracking and materialization of shared-memory objects.
pub mod store;

/// Tracing spans and instrumentation helpers.
pub mod telemetry;

pub use cluster::{
    ActorCall, ActorSpec, ClusterRuntime, LocalCluster, RemoteTask, SharedBytes,
    SharedObjectStore, ShutdownToken, TaskOutcome,
};
pub use config::*;
pub use error::*;
pub use object::*;
pub use pool::{ActorLoadBalancer, ActorPoolMap, WorkerPoolMap};
pub use results::MapResults;
pub use session::{ClusterSession, ClusterSessionBuilder};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, before_shutdown};
pub use store::ResultStore;
