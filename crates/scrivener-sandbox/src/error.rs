//! Error types for the Scrivener sandbox.
//!
//! Expected render failures never surface here. They are reported as a
//! [`RunOutcome`](crate::RunOutcome) with `ok == false`. [`SandboxError`] is
//! reserved for host-side faults: the isolation thread or worker process could
//! not be started, or the run task disappeared.

use thiserror::Error;

/// Host-side errors raised by the sandbox runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// Generic host-side failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// A value could not be converted to or from JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure while talking to a worker process.
    #[error("sandbox I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The worker binary could not be located or is unsafe to run.
    #[error("sandbox worker unavailable: {reason}")]
    WorkerUnavailable {
        /// Why the worker cannot be used.
        reason: String,
    },

    /// Invalid runner configuration.
    #[error("invalid sandbox configuration: {0}")]
    Config(String),
}
