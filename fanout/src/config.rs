use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Address understood by the in-process cluster.
pub const LOCAL_ADDRESS: &str = "local";

/// Configuration for connecting a cluster session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster address ("local" or "local://<name>" for the in-process cluster).
    pub address: String,
    /// Maximum number of stateless tasks executing at once.
    /// `None` uses the machine's available parallelism.
    pub num_workers: Option<usize>,
    /// Namespace used to label tasks and actors in logs.
    pub namespace: String,
}

impl ClusterConfig {
    /// Create a configuration for the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Configuration for the in-process cluster.
    pub fn local() -> Self {
        Self::default()
    }

    /// Set the worker count.
    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = Some(workers);
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Worker count after applying the default.
    pub fn effective_workers(&self) -> usize {
        self.num_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(4)
            })
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            address: LOCAL_ADDRESS.to_string(),
            num_workers: None,
            namespace: "default".to_string(),
        }
    }
}

/// Options for [`WorkerPoolMap`](crate::pool::WorkerPoolMap).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapOptions {
    /// Name used for submitted tasks; defaults to the function's type name.
    pub name: Option<String>,
    /// Items per submitted task. `None` submits one task per item.
    pub chunk_size: Option<usize>,
    /// Run sequentially in the calling task instead of on the cluster.
    pub inline: bool,
}

impl MapOptions {
    /// Set the task name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Toggle inline execution.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }
}

/// Calls queued per actor under [`Balancing::LeastOutstanding`] unless
/// [`ActorPoolOptions::with_max_in_flight`] says otherwise.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// How an actor pool routes items to actors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Balancing {
    /// Route to the actor with the fewest outstanding calls.
    #[default]
    LeastOutstanding,
    /// Route to actors in turn.
    RoundRobin,
}

/// Options for [`ActorPoolMap`](crate::pool::ActorPoolMap).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorPoolOptions {
    /// Name used for actors and their calls; defaults to the state type name.
    pub name: Option<String>,
    /// Number of actors spawned for the map call.
    pub pool_size: usize,
    /// Routing strategy.
    pub balancing: Balancing,
    /// Upper bound on queued calls per actor. `None` uses the default for
    /// the routing strategy; see [`effective_max_in_flight`](Self::effective_max_in_flight).
    pub max_in_flight_per_actor: Option<usize>,
}

impl ActorPoolOptions {
    /// Options for a pool of `pool_size` actors.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    /// Set the actor name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the routing strategy.
    pub fn with_balancing(mut self, balancing: Balancing) -> Self {
        self.balancing = balancing;
        self
    }

    /// Cap queued calls per actor.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight_per_actor = Some(max);
        self
    }

    /// The per-actor cap the pool dispatches with.
    ///
    /// Least-outstanding routing only sees load while calls are held back,
    /// so it defaults to [`DEFAULT_MAX_IN_FLIGHT`]. Round robin defaults to
    /// no cap and queues everything up front.
    pub fn effective_max_in_flight(&self) -> Option<usize> {
        self.max_in_flight_per_actor.or(match self.balancing {
            Balancing::LeastOutstanding => Some(DEFAULT_MAX_IN_FLIGHT),
            Balancing::RoundRobin => None,
        })
    }
}

impl Default for ActorPoolOptions {
    fn default() -> Self {
        Self {
            name: None,
            pool_size: 4,
            balancing: Balancing::default(),
            max_in_flight_per_actor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.address, LOCAL_ADDRESS);
        assert_eq!(config.num_workers, None);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_zero_workers_falls_back_to_default() {
        let config = ClusterConfig::local().with_num_workers(0);
        assert!(config.effective_workers() >= 1);

        let config = ClusterConfig::local().with_num_workers(3);
        assert_eq!(config.effective_workers(), 3);
    }

    #[test]
    fn test_actor_pool_options_serialization() {
        let options = ActorPoolOptions::new(8)
            .with_balancing(Balancing::RoundRobin)
            .with_max_in_flight(2);
        let json = serde_json::to_string(&options).unwrap();
        let back: ActorPoolOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(back.pool_size, 8);
        assert_eq!(back.balancing, Balancing::RoundRobin);
        assert_eq!(back.max_in_flight_per_actor, Some(2));
    }

    #[test]
    fn test_in_flight_cap_defaults_by_balancing() {
        let options = ActorPoolOptions::default();
        assert_eq!(options.max_in_flight_per_actor, None);
        assert_eq!(options.effective_max_in_flight(), Some(DEFAULT_MAX_IN_FLIGHT));

        let options = ActorPoolOptions::new(4).with_balancing(Balancing::RoundRobin);
        assert_eq!(options.effective_max_in_flight(), None);

        let options = ActorPoolOptions::new(4).with_max_in_flight(8);
        assert_eq!(options.effective_max_in_flight(), Some(8));
    }

    #[test]
    fn test_map_options_builders() {
        let options = MapOptions::default()
            .with_name("square")
            .with_chunk_size(16)
            .inline(true);
        assert_eq!(options.name.as_deref(), Some("square"));
        assert_eq!(options.chunk_size, Some(16));
        assert!(options.inline);
    }
}
