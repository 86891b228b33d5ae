//! Runs one request inside a fresh V8 isolate.
//!
//! Every request gets a brand new `JsRuntime`: no globals, prototypes or
//! pending jobs survive from one snippet to the next.
//!
//! V8 isolates are `!Send`, so [`run_request`] must be driven on the thread
//! that owns the isolate, inside a single-threaded tokio runtime. See
//! [`crate::unit`] for the thread that does this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::mpsc::UnboundedSender;

use crate::control::ContextControl;
use crate::error::SandboxError;
use crate::event::{Envelope, EventKind, ExecutionRequest};
use crate::ops::{runpad_ext, ContextSink};

/// Default console event cap per run.
pub const DEFAULT_MAX_OUTPUT_EVENTS: usize = 10_000;

/// Default V8 heap limit per run: 64 MB.
pub const DEFAULT_MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Per-run limits enforced inside the isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Maximum console events delivered per run.
    pub max_output_events: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_output_events: DEFAULT_MAX_OUTPUT_EVENTS,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
        }
    }
}

/// How the sandbox hosts its execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run V8 in-process on a dedicated thread (default).
    #[default]
    InProcess,
    /// Run V8 in a separate `runpad-sandbox-worker` process.
    ChildProcess,
}

/// Configuration for the sandbox and its supervisor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock deadline for one run.
    pub timeout: Duration,
    /// Maximum size of executable code in bytes.
    pub max_code_size: usize,
    /// Maximum console events delivered per run.
    pub max_output_events: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Where the execution context lives.
    pub execution_mode: ExecutionMode,
    /// Maximum IPC message size in bytes (child-process mode).
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE,
            max_output_events: DEFAULT_MAX_OUTPUT_EVENTS,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            execution_mode: ExecutionMode::default(),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl SandboxConfig {
    /// The limits each run is started with.
    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            max_output_events: self.max_output_events,
            max_heap_size: self.max_heap_size,
        }
    }
}

/// Installs the console proxy and the hidden runner, then removes `Deno`.
///
/// Values are snapshotted here and formatted on the Rust side. Composite
/// values are rendered here with `JSON.stringify(value, null, 2)`, which
/// fails on cycles.
const BOOTSTRAP: &str = r#"
((ops) => {
    const indirectEval = globalThis.eval;

    const snapshot = (value) => {
        if (value === null) return { type: "null" };
        switch (typeof value) {
            case "undefined":
                return { type: "undefined" };
            case "string":
                return { type: "string", value };
            case "boolean":
                return { type: "boolean", value };
            case "number":
                return { type: "number", value: Number.isFinite(value) ? value : String(value) };
            case "function":
                return { type: "function", name: value.name || null };
            case "object": {
                let text = null;
                try {
                    text = JSON.stringify(value, null, 2) ?? null;
                } catch (_) {
                    text = null;
                }
                return { type: Array.isArray(value) ? "array" : "object", text };
            }
            default: {
                let text;
                try {
                    text = String(value);
                } catch (_) {
                    text = Object.prototype.toString.call(value);
                }
                return { type: "other", text };
            }
        }
    };

    const describeThrown = (error) => {
        try {
            if (error instanceof Error) {
                return { type: "error", name: String(error.name), message: String(error.message) };
            }
            return { type: "value", text: String(error) };
        } catch (_) {
            return { type: "value", text: Object.prototype.toString.call(error) };
        }
    };

    const forward = (level) => (...args) => {
        ops.op_runpad_console(level, JSON.stringify(args.map(snapshot)));
    };

    globalThis.console = Object.freeze({
        log: forward("log"),
        error: forward("error"),
        warn: forward("warn"),
        info: forward("info"),
    });

    const evaluate = (source) => {
        try {
            return indirectEval(source);
        } catch (e) {
            // Snippets written as a function body may `return` their result.
            if (e instanceof SyntaxError && e.message === "Illegal return statement") {
                return indirectEval("(function () {\n" + source + "\n})")();
            }
            throw e;
        }
    };

    Object.defineProperty(globalThis, "__runpadRun", {
        value: (source) => {
            try {
                const value = evaluate(source);
                if (value !== undefined) {
                    ops.op_runpad_result(JSON.stringify(snapshot(value)));
                }
            } catch (e) {
                ops.op_runpad_thrown(JSON.stringify(describeThrown(e)));
            }
        },
        enumerable: false,
        writable: false,
        configurable: false,
    });

    delete globalThis.Deno;
})(Deno.core.ops);
"#;

/// Create a fresh runtime with the runpad extension loaded and V8 heap limits set.
pub(crate) fn create_runtime(max_heap_size: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    JsRuntime::new(RuntimeOptions {
        extensions: vec![runpad_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    })
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates the run as V8 nears its heap limit, then grants 1 MB of grace
/// so the termination can unwind instead of aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `run_request`,
    // which outlives every script execution on the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run one request in a fresh isolate bound to `control`.
///
/// Emits every output event through `events`, ending with `done`, unless the
/// context is destroyed first; a destroyed context emits nothing further.
pub async fn run_request(
    request: ExecutionRequest,
    control: Arc<ContextControl>,
    events: UnboundedSender<Envelope>,
    limits: RunLimits,
) {
    let started = Instant::now();
    let correlation_id = request.correlation_id.clone();
    tracing::debug!(
        context = %control.id(),
        correlation_id = %correlation_id,
        code_len = request.source_code.len(),
        "run_request: starting"
    );

    let mut runtime = create_runtime(limits.max_heap_size);
    if !control.attach_isolate(runtime.v8_isolate().thread_safe_handle()) {
        tracing::debug!(context = %control.id(), "context destroyed before isolate attached");
        return;
    }

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let sink = ContextSink::new(
        control.clone(),
        correlation_id.clone(),
        events,
        limits.max_output_events,
    );
    runtime.op_state().borrow_mut().put(sink);

    let outcome = drive(&mut runtime, &request.source_code).await;

    control.detach_isolate();
    if control.is_destroyed() {
        tracing::debug!(context = %control.id(), "run_request: abandoned after destruction");
        return;
    }

    let state = runtime.op_state();
    let state = state.borrow();
    let Some(sink) = state.try_borrow::<ContextSink>() else {
        return;
    };
    if heap_state.triggered.load(Ordering::SeqCst) {
        tracing::warn!(
            context = %control.id(),
            correlation_id = %correlation_id,
            max_heap_size = limits.max_heap_size,
            "run_request: heap limit reached"
        );
        sink.emit(EventKind::Error, SandboxError::HeapLimitExceeded.to_string());
    } else if let Err(message) = outcome {
        sink.emit(EventKind::Error, message);
    }
    sink.done();

    tracing::debug!(
        context = %control.id(),
        correlation_id = %correlation_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run_request: complete"
    );
}

/// Bootstrap the isolate, run the snippet and drain pending promise jobs.
///
/// Errors raised by the snippet itself are reported by the runner script;
/// an `Err` here means the runtime failed outside of the snippet's control.
async fn drive(runtime: &mut JsRuntime, source: &str) -> Result<(), String> {
    runtime
        .execute_script("[runpad:bootstrap]", BOOTSTRAP)
        .map_err(|e| e.to_string())?;

    // JSON string literals are valid script string literals.
    let literal = serde_json::to_string(source).map_err(|e| e.to_string())?;
    let driver = format!("globalThis.__runpadRun({literal});");
    runtime
        .execute_script("[runpad:run]", driver)
        .map_err(|e| e.to_string())?;

    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OutputEvent;
    use tokio::sync::mpsc;

    fn collect(request: ExecutionRequest) -> Vec<OutputEvent> {
        collect_with(request, RunLimits::default())
    }

    fn collect_with(request: ExecutionRequest, limits: RunLimits) -> Vec<OutputEvent> {
        let control = ContextControl::new();
        control.bind(request.correlation_id.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Isolates must stay on the thread that created them.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run_request(request, control, tx, limits));

        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    fn summary(events: &[OutputEvent]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.content_str().to_string()))
            .collect()
    }

    #[test]
    fn config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.max_code_size, 64 * 1024);
        assert_eq!(config.max_output_events, 10_000);
        assert_eq!(config.execution_mode, ExecutionMode::InProcess);
    }

    #[test]
    fn logs_then_result_then_done() {
        let events = collect(ExecutionRequest::new(
            r#"console.log("a"); console.log(1+1); 42"#,
        ));
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Log, "a".into()),
                (EventKind::Log, "2".into()),
                (EventKind::Result, "42".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn undefined_completion_produces_no_result() {
        let events = collect(ExecutionRequest::new("let x = 1;"));
        assert_eq!(summary(&events), vec![(EventKind::Done, String::new())]);
    }

    #[test]
    fn thrown_error_becomes_single_error_event() {
        let events = collect(ExecutionRequest::new(r#"throw new TypeError("nope")"#));
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Error, "TypeError: nope".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn thrown_non_error_uses_string_form() {
        let events = collect(ExecutionRequest::new(r#"throw "plain""#));
        assert_eq!(events[0].content_str(), "plain");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn syntax_errors_are_reported_as_thrown() {
        let events = collect(ExecutionRequest::new("let = ;"));
        assert_eq!(events[0].kind, EventKind::Error);
        assert!(events[0].content_str().starts_with("SyntaxError: "));
        assert!(events[1].is_done());
    }

    #[test]
    fn warn_and_error_console_methods() {
        let events = collect(ExecutionRequest::new(
            r#"console.warn("w"); console.error("e"); console.info("i", 3)"#,
        ));
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Log, "[warn] w".into()),
                (EventKind::Error, "e".into()),
                (EventKind::Log, "i 3".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn function_body_return_is_supported() {
        let events = collect(ExecutionRequest::new("const a = 2;\nreturn a * 21;"));
        assert_eq!(events[0].content_str(), "42");
        assert!(events[1].is_done());
    }

    #[test]
    fn composite_results_are_pretty_printed() {
        let events = collect(ExecutionRequest::new(r#"({ name: "x", tags: [1, 2] })"#));
        assert_eq!(
            events[0].content_str(),
            "{\n  \"name\": \"x\",\n  \"tags\": [\n    1,\n    2\n  ]\n}"
        );
    }

    #[test]
    fn composite_numbers_print_as_the_script_does() {
        let events = collect(ExecutionRequest::new("console.log({ a: 1e21 }); [2 ** 64]"));
        assert_eq!(events[0].content_str(), "{\n  \"a\": 1e+21\n}");
        assert_eq!(events[1].content_str(), "[\n  18446744073709552000\n]");
    }

    #[test]
    fn deeply_nested_composites_are_not_truncated() {
        let events = collect(ExecutionRequest::new(
            "let v = 0; for (let i = 0; i < 200; i++) v = [v]; v",
        ));
        let text = events[0].content_str();
        assert!(text.starts_with("[\n  [\n"), "{text}");
        assert_eq!(text.matches('[').count(), 200);
        assert!(text.contains(&format!("{}0\n", " ".repeat(400))));
    }

    #[test]
    fn returned_promise_is_not_awaited() {
        let events = collect(ExecutionRequest::new(
            r#"return Promise.resolve(1).then(v => console.log("settled", v));"#,
        ));
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Result, "{}".into()),
                (EventKind::Log, "settled 1".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn heap_exhaustion_is_reported_then_done() {
        let limits = RunLimits {
            max_heap_size: 10 * 1024 * 1024,
            ..RunLimits::default()
        };
        let events = collect_with(
            ExecutionRequest::new(
                r#"console.log("filling"); const arr = []; while (true) arr.push(new Array(100000).fill("x"));"#,
            ),
            limits,
        );
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Log, "filling".into()),
                (EventKind::Error, "Execution stopped: heap limit exceeded".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn circular_values_fall_back_to_tags() {
        let events = collect(ExecutionRequest::new(
            "const o = {}; o.self = o; const a = [o]; console.log(a); o",
        ));
        assert_eq!(events[0].content_str(), "[Array]");
        assert_eq!(events[1].content_str(), "[Object]");
    }

    #[test]
    fn functions_format_with_their_name() {
        let events = collect(ExecutionRequest::new(
            "function add(a, b) { return a + b; }\nconsole.log(add); (() => 1)",
        ));
        assert_eq!(events[0].content_str(), "[Function: add]");
        assert_eq!(events[1].content_str(), "[Function: anonymous]");
    }

    #[test]
    fn promise_jobs_run_before_done() {
        let events = collect(ExecutionRequest::new(
            r#"Promise.resolve(5).then(v => console.log("later", v)); console.log("now");"#,
        ));
        assert_eq!(
            summary(&events),
            vec![
                (EventKind::Log, "now".into()),
                (EventKind::Log, "later 5".into()),
                (EventKind::Done, String::new()),
            ]
        );
    }

    #[test]
    fn each_request_gets_fresh_globals() {
        let first = collect(ExecutionRequest::new("globalThis.leak = 1; leak"));
        assert_eq!(first[0].content_str(), "1");
        let second = collect(ExecutionRequest::new("typeof leak"));
        assert_eq!(second[0].content_str(), "undefined");
    }

    #[test]
    fn destroyed_context_emits_nothing() {
        let request = ExecutionRequest::new("console.log(1); 2");
        let control = ContextControl::new();
        control.bind(request.correlation_id.clone());
        control.destroy();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run_request(request, control, tx, RunLimits::default()));
        assert!(rx.try_recv().is_err());
    }
}
