//! Test support for fanout.
//!
//! - [`RecordingRuntime`] wraps a cluster runtime and counts every call made
//!   through it.
//! - [`fixtures`] holds the task functions and actors the integration
//!   tests and benches map over.

pub mod fixtures;
mod recording;

pub use fixtures::*;
pub use recording::{RecordingRuntime, RuntimeCalls};
