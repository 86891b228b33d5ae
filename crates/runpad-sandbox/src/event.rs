//! Request and event types exchanged across the control/sandbox boundary.
//!
//! The serde representation of [`ExecutionRequest`] and [`OutputEvent`] is the
//! wire schema used between the host and a child-process worker:
//!
//! ```json
//! { "correlationId": "…", "sourceCode": "console.log(1)" }
//! { "correlationId": "…", "kind": "log", "content": "1" }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque token tying an output event back to the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh, globally unique correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one execution context.
///
/// Allocated from a process-wide counter, so two contexts never share an id
/// even when their correlation ids collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    /// Allocate the next unused context id.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A request to run one snippet of executable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Correlation id every response for this request carries.
    pub correlation_id: CorrelationId,
    /// JavaScript source to execute.
    pub source_code: String,
}

impl ExecutionRequest {
    /// Build a request with a freshly generated correlation id.
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            correlation_id: CorrelationId::generate(),
            source_code: source_code.into(),
        }
    }
}

/// The kind of an [`OutputEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Console output (`log`, `info`, and tagged `warn`).
    Log,
    /// Console errors, thrown exceptions, timeouts and compile diagnostics.
    Error,
    /// The formatted completion value of the snippet.
    Result,
    /// Terminal marker; nothing follows it for the same correlation id.
    Done,
}

impl EventKind {
    /// Lowercase name used on the wire and in CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Error => "error",
            Self::Result => "result",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of output produced while running a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    /// The request this event belongs to.
    pub correlation_id: CorrelationId,
    /// What kind of output this is.
    pub kind: EventKind,
    /// Display text. Always `None` for [`EventKind::Done`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl OutputEvent {
    /// A `log` event.
    pub fn log(correlation_id: CorrelationId, content: impl Into<String>) -> Self {
        Self::with_content(correlation_id, EventKind::Log, content)
    }

    /// An `error` event.
    pub fn error(correlation_id: CorrelationId, content: impl Into<String>) -> Self {
        Self::with_content(correlation_id, EventKind::Error, content)
    }

    /// A `result` event.
    pub fn result(correlation_id: CorrelationId, content: impl Into<String>) -> Self {
        Self::with_content(correlation_id, EventKind::Result, content)
    }

    /// The terminal `done` event.
    pub fn done(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            kind: EventKind::Done,
            content: None,
        }
    }

    fn with_content(
        correlation_id: CorrelationId,
        kind: EventKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            kind,
            content: Some(content.into()),
        }
    }

    /// Whether this is the terminal `done` event.
    pub fn is_done(&self) -> bool {
        self.kind == EventKind::Done
    }

    /// The content, or an empty string when there is none.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// An event tagged with the identity of the context that emitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The emitting context.
    pub context: ContextId,
    /// The event itself.
    pub event: OutputEvent,
}
