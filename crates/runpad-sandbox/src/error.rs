//! Error types for the runpad sandbox.
//!
//! None of these cross the control/sandbox boundary as errors: the supervisor
//! converts every one of them into an `error` output event followed by `done`.

use thiserror::Error;

/// Errors that can occur while preparing or driving a sandboxed run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The run did not reach `done` before the deadline.
    #[error("Execution timed out ({timeout_ms}ms limit)")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The run was stopped as V8 neared its heap limit.
    #[error("Execution stopped: heap limit exceeded")]
    HeapLimitExceeded,

    /// The execution unit went away without finishing the run.
    #[error("Execution context terminated unexpectedly")]
    ContextLost,

    /// The worker binary for child-process mode could not be used.
    #[error("sandbox worker unavailable: {reason}")]
    WorkerUnavailable {
        /// What went wrong.
        reason: String,
    },

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Event payload serialization failed.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
