//! Error types for map execution.
//!
//! Two layers of failure exist. [`TaskError`] is produced *inside* the
//! cluster when a task or actor call raises; it is a plain serializable
//! value so it can travel back through the object store. [`FanoutError`]
//! is what callers of this crate see, and wraps a task error with the
//! chunk/item context of the map call that observed it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::{ActorId, ObjectId};

/// Result type alias using [`FanoutError`].
pub type FanoutResult<T> = std::result::Result<T, FanoutError>;

/// How a remote unit of work failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// The task body returned an error.
    Raised,
    /// The task body panicked.
    Panicked,
    /// The actor could not be constructed, or its host exited.
    ActorDied,
    /// The actor was terminated while the call was still queued.
    ActorKilled,
    /// The cluster shut down before the task ran.
    Cancelled,
}

impl TaskErrorKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::Raised => "raised",
            TaskErrorKind::Panicked => "panicked",
            TaskErrorKind::ActorDied => "actor_died",
            TaskErrorKind::ActorKilled => "actor_killed",
            TaskErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Failure recorded by the cluster for a single task or actor call.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
#[error("{task} {}: {message}", .kind.as_str())]
pub struct TaskError {
    /// Failure category.
    pub kind: TaskErrorKind,
    /// Name of the task or actor method that failed.
    pub task: String,
    /// Rendered error, including the full context chain.
    pub message: String,
    /// Index of the input item being processed, when known.
    pub item: Option<usize>,
}

impl TaskError {
    /// Build a task error of the given kind.
    pub fn new(
        kind: TaskErrorKind,
        task: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task: task.into(),
            message: message.into(),
            item: None,
        }
    }

    /// The task body returned `err`.
    pub fn raised(task: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(TaskErrorKind::Raised, task, format!("{err:#}"))
    }

    /// The task body panicked with `payload`.
    pub fn panicked(
        task: impl Into<String>,
        payload: &(dyn std::any::Any + Send),
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(TaskErrorKind::Panicked, task, message)
    }

    /// Attach the index of the failing input item.
    pub fn at_item(mut self, item: usize) -> Self {
        self.item = Some(item);
        self
    }
}

/// Core error type for map execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FanoutError {
    /// The cluster runtime could not be reached or started.
    #[error("ClusterUnavailable: {address}: {reason}")]
    ClusterUnavailable {
        /// Address the session tried to connect to.
        address: String,
        /// Why the connection failed.
        reason: String,
    },

    /// A submitted unit of work raised during remote execution.
    #[error(
        "TaskFailure: chunk {} item {}: {source}",
        display_index(.chunk),
        display_index(.item)
    )]
    TaskFailure {
        /// Index of the first failing chunk in submission order.
        chunk: Option<usize>,
        /// Index of the failing input item.
        item: Option<usize>,
        /// The error recorded by the cluster.
        #[source]
        source: TaskError,
    },

    /// A handle was resolved after its backing storage went away.
    #[error("StaleHandle: object {object}: {reason}")]
    StaleHandle {
        /// Object the handle pointed at.
        object: ObjectId,
        /// Why the object is no longer readable.
        reason: &'static str,
    },

    /// Work was submitted to a session that has already shut down.
    #[error("SessionClosed: cluster session has shut down")]
    SessionClosed,

    /// An actor reference did not resolve to a live actor.
    #[error("UnknownActor: {0}")]
    UnknownActor(ActorId),

    /// Invalid parameter provided.
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// Shutdown refused because results could not be materialized.
    #[error(
        "ShutdownAborted: {unmaterialized} result set(s) still backed by shared memory: {source}"
    )]
    ShutdownAborted {
        /// Result sets and handles left unmaterialized.
        unmaterialized: usize,
        /// The materialization failure.
        #[source]
        source: Box<FanoutError>,
    },

    /// Value encoding or decoding failed.
    #[error("Codec: {0}")]
    Codec(#[from] serde_json::Error),
}

fn display_index(index: &Option<usize>) -> String {
    index.map_or_else(|| "?".to_string(), |i| i.to_string())
}

impl FanoutError {
    /// Create a `ClusterUnavailable` error.
    pub fn unavailable(
        address: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ClusterUnavailable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a task error, taking the item index it already carries.
    pub fn task_failure(source: TaskError) -> Self {
        Self::TaskFailure {
            chunk: None,
            item: source.item,
            source,
        }
    }

    /// Create a `StaleHandle` error.
    pub fn stale(object: ObjectId, reason: &'static str) -> Self {
        Self::StaleHandle { object, reason }
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Record which chunk a task failure belongs to.
    ///
    /// Other variants pass through untouched.
    pub fn in_chunk(self, index: usize) -> Self {
        match self {
            Self::TaskFailure { item, source, .. } => Self::TaskFailure {
                chunk: Some(index),
                item,
                source,
            },
            other => other,
        }
    }

    /// Index of the failing input item, for task failures.
    pub fn failed_item(&self) -> Option<usize> {
        match self {
            Self::TaskFailure { item, .. } => *item,
            _ => None,
        }
    }

    /// Whether this is a stale-handle error.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleHandle { .. })
    }
}
