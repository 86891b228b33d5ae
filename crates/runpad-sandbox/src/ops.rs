//! deno_core op definitions for the runpad sandbox.
//!
//! The bootstrap script hands every console call, completion value and thrown
//! value to these ops as a JSON snapshot. The ops decode the snapshot, format it
//! and deliver an [`OutputEvent`] through the [`ContextSink`] stored in OpState.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the functions and types below are documented.
#![allow(missing_docs)]

use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::control::ContextControl;
use crate::event::{CorrelationId, Envelope, EventKind, OutputEvent};
use crate::format::{format, format_args, RuntimeValue, ThrownValue};

/// Per-run delivery state, stored in OpState.
pub struct ContextSink {
    control: Arc<ContextControl>,
    correlation_id: CorrelationId,
    events: UnboundedSender<Envelope>,
    max_console_events: usize,
    console_events: usize,
    suppressed: bool,
}

impl ContextSink {
    /// Create a sink delivering events for `correlation_id` through `control`.
    pub fn new(
        control: Arc<ContextControl>,
        correlation_id: CorrelationId,
        events: UnboundedSender<Envelope>,
        max_console_events: usize,
    ) -> Self {
        Self {
            control,
            correlation_id,
            events,
            max_console_events,
            console_events: 0,
            suppressed: false,
        }
    }

    /// Deliver an event with content. Returns `false` if it was dropped.
    pub fn emit(&self, kind: EventKind, content: String) -> bool {
        let event = OutputEvent {
            correlation_id: self.correlation_id.clone(),
            kind,
            content: Some(content),
        };
        self.control.deliver(&self.events, event)
    }

    /// Deliver the terminal `done` event.
    pub fn done(&self) -> bool {
        self.control
            .deliver(&self.events, OutputEvent::done(self.correlation_id.clone()))
    }

    /// Deliver console output, applying the per-run console event cap.
    pub fn console(&mut self, kind: EventKind, content: String) {
        if self.suppressed {
            return;
        }
        if self.console_events >= self.max_console_events {
            self.suppressed = true;
            tracing::debug!(
                correlation_id = %self.correlation_id,
                limit = self.max_console_events,
                "console output limit reached"
            );
            self.emit(
                EventKind::Error,
                format!(
                    "Output limit exceeded ({} events); further console output suppressed",
                    self.max_console_events
                ),
            );
            return;
        }
        self.console_events += 1;
        self.emit(kind, content);
    }
}

/// Wire form of a value snapshot taken by the bootstrap script.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ValueSnapshot {
    Null,
    Undefined,
    String { value: String },
    Number { value: NumberSnapshot },
    Boolean { value: bool },
    Function { name: Option<String> },
    Array { text: Option<String> },
    Object { text: Option<String> },
    Other { text: String },
}

/// Finite numbers travel as JSON numbers, the rest as their names.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberSnapshot {
    Finite(f64),
    Special(String),
}

impl From<NumberSnapshot> for f64 {
    fn from(value: NumberSnapshot) -> Self {
        match value {
            NumberSnapshot::Finite(n) => n,
            NumberSnapshot::Special(name) => match name.as_str() {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                _ => f64::NAN,
            },
        }
    }
}

impl From<ValueSnapshot> for RuntimeValue {
    fn from(value: ValueSnapshot) -> Self {
        match value {
            ValueSnapshot::Null => Self::Null,
            ValueSnapshot::Undefined => Self::Undefined,
            ValueSnapshot::String { value } => Self::String(value),
            ValueSnapshot::Number { value } => Self::Number(value.into()),
            ValueSnapshot::Boolean { value } => Self::Boolean(value),
            ValueSnapshot::Function { name } => Self::Function { name },
            ValueSnapshot::Array { text } => Self::Array(text),
            ValueSnapshot::Object { text } => Self::Object(text),
            ValueSnapshot::Other { text } => Self::Other(text),
        }
    }
}

/// Wire form of a thrown value.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ThrownSnapshot {
    Error { name: String, message: String },
    Value { text: String },
}

impl From<ThrownSnapshot> for ThrownValue {
    fn from(value: ThrownSnapshot) -> Self {
        match value {
            ThrownSnapshot::Error { name, message } => Self::Error { name, message },
            ThrownSnapshot::Value { text } => Self::Value(text),
        }
    }
}

/// Decode a JSON array of value snapshots.
pub fn decode_values(json: &str) -> Result<Vec<RuntimeValue>, serde_json::Error> {
    let snapshots: Vec<ValueSnapshot> = serde_json::from_str(json)?;
    Ok(snapshots.into_iter().map(RuntimeValue::from).collect())
}

/// Decode a single value snapshot.
pub fn decode_value(json: &str) -> Result<RuntimeValue, serde_json::Error> {
    serde_json::from_str::<ValueSnapshot>(json).map(RuntimeValue::from)
}

/// Decode a thrown-value snapshot.
pub fn decode_thrown(json: &str) -> Result<ThrownValue, serde_json::Error> {
    serde_json::from_str::<ThrownSnapshot>(json).map(ThrownValue::from)
}

/// Map a console method to its event kind and content.
pub fn console_event(level: &str, text: String) -> (EventKind, String) {
    match level {
        "error" => (EventKind::Error, text),
        "warn" => (EventKind::Log, format!("[warn] {text}")),
        _ => (EventKind::Log, text),
    }
}

/// Forward a console call (`log`, `error`, `warn`, `info`).
#[op2(fast)]
pub fn op_runpad_console(state: &mut OpState, #[string] level: &str, #[string] args_json: &str) {
    let text = match decode_values(args_json) {
        Ok(values) => format_args(&values),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable console payload");
            args_json.to_string()
        }
    };
    let (kind, content) = console_event(level, text);
    if let Some(sink) = state.try_borrow_mut::<ContextSink>() {
        sink.console(kind, content);
    }
}

/// Forward the snippet's defined completion value.
#[op2(fast)]
pub fn op_runpad_result(state: &mut OpState, #[string] value_json: &str) {
    let content = match decode_value(value_json) {
        Ok(value) => format(&value),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable result payload");
            "[Object]".to_string()
        }
    };
    if let Some(sink) = state.try_borrow::<ContextSink>() {
        sink.emit(EventKind::Result, content);
    }
}

/// Forward the value thrown out of the snippet.
#[op2(fast)]
pub fn op_runpad_thrown(state: &mut OpState, #[string] thrown_json: &str) {
    let content = match decode_thrown(thrown_json) {
        Ok(thrown) => thrown.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable thrown payload");
            "Error: unknown error".to_string()
        }
    };
    if let Some(sink) = state.try_borrow::<ContextSink>() {
        sink.emit(EventKind::Error, content);
    }
}

deno_core::extension!(
    runpad_ext,
    ops = [op_runpad_console, op_runpad_result, op_runpad_thrown],
);
