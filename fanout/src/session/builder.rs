use std::fmt;
use std::sync::Arc;

use crate::cluster::{ClusterRuntime, LocalCluster};
use crate::config::ClusterConfig;
use crate::error::{FanoutError, FanoutResult};

use super::ClusterSession;

/// Builder for a [`ClusterSession`].
///
/// Without a custom runtime the session connects a [`LocalCluster`] to
/// the configured address.
///
/// # Example
///
/// ```ignore
/// use fanout::*;
///
/// let session = ClusterSession::builder()
///     .with_address("local://etl")
///     .with_num_workers(8)
///     .start()
///     .await?;
/// ```
#[derive(Default)]
pub struct ClusterSessionBuilder {
    config: ClusterConfig,
    runtime: Option<Arc<dyn ClusterRuntime>>,
}

impl fmt::Debug for ClusterSessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ClusterSessionBuilder");
        debug.field("config", &self.config);
        debug.field("runtime_set", &self.runtime.is_some());
        if let Some(runtime) = &self.runtime {
            debug.field("runtime_address", &runtime.address());
        }
        debug.finish()
    }
}

impl ClusterSessionBuilder {
    /// Create a builder with the default local configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cluster address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set the number of concurrently executing tasks.
    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = Some(workers);
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Use an already-connected runtime instead of a local cluster.
    pub fn with_runtime(mut self, runtime: Arc<dyn ClusterRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration and start the session.
    pub async fn start(self) -> FanoutResult<ClusterSession> {
        if self.config.namespace.trim().is_empty() {
            return Err(FanoutError::invalid_argument("namespace must not be empty"));
        }
        let runtime: Arc<dyn ClusterRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None => LocalCluster::connect(self.config.clone())?,
        };
        Ok(ClusterSession::with_runtime(self.config, runtime))
    }
}
