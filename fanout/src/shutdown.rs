//! Draining results out of shared memory before the cluster goes away.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, warn};

use crate::error::{FanoutError, FanoutResult};
use crate::object::StoreId;
use crate::session::ClusterSession;
use crate::telemetry;

/// What [`ShutdownCoordinator::before_shutdown`] did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Session that was drained.
    pub session: StoreId,
    /// Map result sets copied into process memory.
    pub result_sets: usize,
    /// Loose handles copied into process memory.
    pub handles: usize,
    /// Directly spawned actors that were terminated.
    pub actors_killed: usize,
    /// When draining finished.
    pub completed_at: DateTime<Utc>,
}

/// Makes a session safe to shut down.
///
/// [`before_shutdown`](Self::before_shutdown) materializes every map
/// result and handle the session has issued and that is still backed by
/// shared memory, then terminates actors spawned directly through the
/// session. If anything cannot be materialized it fails with
/// `ShutdownAborted` and leaves the session running.
pub struct ShutdownCoordinator<'s> {
    session: &'s ClusterSession,
}

impl fmt::Debug for ShutdownCoordinator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("session", &self.session.id())
            .finish()
    }
}

impl<'s> ShutdownCoordinator<'s> {
    pub fn new(session: &'s ClusterSession) -> Self {
        Self { session }
    }

    /// Materialize everything still in shared memory. Idempotent.
    pub async fn before_shutdown(&self) -> FanoutResult<ShutdownReport> {
        let span = telemetry::materialize_span(self.session.id().to_string());
        self.drain().instrument(span).await
    }

    /// Drain, then shut the session down.
    ///
    /// The session is left running if draining fails.
    pub async fn shutdown(&self) -> FanoutResult<ShutdownReport> {
        let report = self.before_shutdown().await?;
        let span = telemetry::shutdown_span(self.session.id().to_string());
        self.session.shutdown().instrument(span).await?;
        Ok(report)
    }

    async fn drain(&self) -> FanoutResult<ShutdownReport> {
        let session = self.session;
        let store = session.store();

        let mut result_sets = 0;
        let mut failed = 0;
        let mut first_error = None;
        for results in session.live_results() {
            match results.materialize() {
                Ok(true) => result_sets += 1,
                Ok(false) => {}
                Err(err) => {
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }

        let handles = match store.materialize_outstanding().await {
            Ok(count) => count,
            Err(err) => {
                first_error.get_or_insert(err);
                0
            }
        };

        if let Some(source) = first_error {
            let unmaterialized = failed + store.outstanding();
            error!(
                session = %session.id(),
                unmaterialized,
                error = %source,
                "results could not be materialized, refusing to shut down"
            );
            return Err(FanoutError::ShutdownAborted {
                unmaterialized,
                source: Box::new(source),
            });
        }

        let mut actors_killed = 0;
        if !session.is_shut_down() {
            for actor in session.live_actors() {
                match session.runtime().kill_actor(actor) {
                    Ok(()) => actors_killed += 1,
                    Err(err) => warn!(actor = %actor, error = %err, "failed to terminate actor"),
                }
                session.forget_actor(actor);
            }
        }

        let report = ShutdownReport {
            session: session.id(),
            result_sets,
            handles,
            actors_killed,
            completed_at: Utc::now(),
        };
        info!(
            session = %report.session,
            result_sets,
            handles,
            actors_killed,
            "results materialized"
        );
        Ok(report)
    }
}

/// Materialize everything `session` still holds in shared memory.
///
/// Must complete before `session.shutdown()` is called.
pub async fn before_shutdown(session: &ClusterSession) -> FanoutResult<ShutdownReport> {
    ShutdownCoordinator::new(session).before_shutdown().await
}
