#![warn(missing_docs)]

//! # runpad-sandbox
//!
//! V8 execution sandbox for runpad.
//!
//! Runs untrusted JavaScript snippets in a deno_core isolate and streams their
//! console output, completion value and thrown errors back as [`OutputEvent`]s.
//!
//! ## Execution model
//!
//! - **Fresh context per request**: every request gets a new isolate with its
//!   own [`ContextId`]; nothing survives from one snippet to the next
//! - **Replaceable execution unit**: a sandbox thread (or worker process) hosts
//!   contexts one at a time and is replaced when a run is killed
//! - **Wall-clock deadline**: the [`Supervisor`] destroys a context that has not
//!   finished in time and emits a synthetic timeout error
//! - **No late events**: delivery and destruction share one lock, so nothing
//!   from a destroyed context reaches the output stream
//!
//! - **Heap guard**: a run that nears the V8 heap limit is terminated and
//!   reported instead of aborting the process
//!
//! CPU time is not accounted for beyond the wall-clock deadline.

pub mod control;
pub mod error;
pub mod event;
pub mod format;
pub mod host;
pub mod ipc;
pub mod ops;
pub mod runtime;
pub mod sandbox;
pub mod supervisor;
pub mod unit;
pub mod validator;

pub use error::SandboxError;
pub use event::{ContextId, CorrelationId, EventKind, ExecutionRequest, OutputEvent};
pub use format::{format, RuntimeValue};
pub use runtime::{run_request, ExecutionMode, RunLimits, SandboxConfig};
pub use sandbox::{BoundRun, Sandbox};
pub use supervisor::{RunOutcome, Supervisor};
