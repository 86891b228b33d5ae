#![warn(missing_docs)]

//! # runpad-coordinator
//!
//! The single entry point for running a snippet.
//!
//! [`RunCoordinator::run_once`] takes `(source, language)`, compiles the
//! source if the language needs it, runs the result in the supervised
//! sandbox and returns a [`RunStream`] of output events. A `running` flag,
//! observable through [`RunCoordinator::running`], is `true` from the moment
//! a run is accepted until its stream is finished.
//!
//! Only one run is in flight at a time; a second `run_once` while one is
//! running is refused with [`RunError::Busy`].

use std::sync::Arc;
use std::time::Duration;

use runpad_compiler::{CompileOutcome, Compiler, CompilerOptions, SourceLanguage};
use runpad_config::RunpadConfig;
use runpad_sandbox::{
    CorrelationId, ExecutionMode, ExecutionRequest, OutputEvent, SandboxConfig, Supervisor,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

/// Errors returned by the coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// A run is already in flight.
    #[error("a run is already in progress")]
    Busy,

    /// The configuration could not be turned into coordinator settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Settings for a [`RunCoordinator`].
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Sandbox and deadline settings.
    pub sandbox: SandboxConfig,
    /// Compiler settings.
    pub compiler: CompilerOptions,
    /// Language assumed by front ends that do not specify one.
    pub default_language: SourceLanguage,
}

impl CoordinatorConfig {
    /// Build coordinator settings from a loaded config file.
    pub fn from_config(config: &RunpadConfig) -> Result<Self, RunError> {
        let mut sandbox = SandboxConfig::default();
        if let Some(ms) = config.sandbox.timeout_ms {
            sandbox.timeout = Duration::from_millis(ms);
        }
        if let Some(kb) = config.sandbox.max_code_size_kb {
            sandbox.max_code_size = kb * 1024;
        }
        if let Some(max) = config.sandbox.max_output_events {
            sandbox.max_output_events = max;
        }
        if let Some(mb) = config.sandbox.max_heap_mb {
            sandbox.max_heap_size = mb * 1024 * 1024;
        }
        if let Some(mode) = &config.sandbox.execution_mode {
            sandbox.execution_mode = match mode.as_str() {
                "in_process" => ExecutionMode::InProcess,
                "child_process" => ExecutionMode::ChildProcess,
                other => {
                    return Err(RunError::InvalidConfig(format!(
                        "unknown execution mode '{other}'"
                    )))
                }
            };
        }

        let default_language = match &config.compiler.default_language {
            Some(name) => name
                .parse()
                .map_err(|e: runpad_compiler::CompileError| RunError::InvalidConfig(e.to_string()))?,
            None => SourceLanguage::default(),
        };

        Ok(Self {
            sandbox,
            compiler: CompilerOptions {
                checker_enabled: config.compiler.checker_enabled(),
            },
            default_language,
        })
    }
}

/// The ordered output of one run.
///
/// Ends after `done`, or, when compilation failed, after the last compile
/// error (no `done` in that case).
#[derive(Debug)]
pub struct RunStream {
    correlation_id: CorrelationId,
    events: mpsc::UnboundedReceiver<OutputEvent>,
}

impl RunStream {
    /// Correlation id shared by every event of this run.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Wait for the stream to end and return every event.
    pub async fn collect(mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Clears the running flag when a run task ends, however it ends.
struct RunningGuard(Arc<watch::Sender<bool>>);

impl RunningGuard {
    fn clear(&self) {
        self.0.send_if_modified(|running| std::mem::replace(running, false));
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Compiles and runs snippets, one at a time.
pub struct RunCoordinator {
    compiler: Arc<Compiler>,
    supervisor: Arc<Mutex<Supervisor>>,
    running: Arc<watch::Sender<bool>>,
    default_language: SourceLanguage,
}

impl RunCoordinator {
    /// Create a coordinator. The sandbox starts lazily on the first run.
    pub fn new(config: CoordinatorConfig) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            compiler: Arc::new(Compiler::new(config.compiler)),
            supervisor: Arc::new(Mutex::new(Supervisor::new(config.sandbox))),
            running: Arc::new(running),
            default_language: config.default_language,
        }
    }

    /// Observe the running flag.
    pub fn running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Language assumed when the caller has none.
    pub fn default_language(&self) -> SourceLanguage {
        self.default_language
    }

    /// Start running `source`. Must be called from within a tokio runtime.
    ///
    /// Returns immediately; events arrive on the returned stream as they are
    /// produced.
    pub fn run_once(&self, source: &str, language: SourceLanguage) -> Result<RunStream, RunError> {
        let accepted = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !accepted {
            tracing::debug!("run refused: another run is in progress");
            return Err(RunError::Busy);
        }

        let correlation_id = CorrelationId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            correlation_id = %correlation_id,
            language = %language,
            code_len = source.len(),
            "run accepted"
        );

        tokio::spawn(drive(
            source.to_string(),
            language,
            correlation_id.clone(),
            tx,
            self.compiler.clone(),
            self.supervisor.clone(),
            RunningGuard(self.running.clone()),
        ));

        Ok(RunStream {
            correlation_id,
            events: rx,
        })
    }
}

/// Compile (if needed), run under supervision and forward the events.
async fn drive(
    source: String,
    language: SourceLanguage,
    correlation_id: CorrelationId,
    out: mpsc::UnboundedSender<OutputEvent>,
    compiler: Arc<Compiler>,
    supervisor: Arc<Mutex<Supervisor>>,
    running: RunningGuard,
) {
    let code = if language.needs_compilation() {
        let compiled =
            tokio::task::spawn_blocking(move || compiler.compile(&source, language)).await;
        let errors = match compiled {
            Ok(CompileOutcome::Compiled { code, .. }) => Ok(code),
            Ok(CompileOutcome::Failed { errors }) => Err(errors),
            Err(e) => Err(vec![format!("Failed to compile TypeScript: {e}")]),
        };
        match errors {
            Ok(code) => code,
            Err(errors) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    count = errors.len(),
                    "compile failed; not executing"
                );
                running.clear();
                for line in errors {
                    let _ = out.send(OutputEvent::error(correlation_id.clone(), line));
                }
                return;
            }
        }
    } else {
        source
    };

    let request = ExecutionRequest {
        correlation_id: correlation_id.clone(),
        source_code: code,
    };

    let (sandbox_tx, mut sandbox_rx) = mpsc::unbounded_channel();
    let mut supervisor = supervisor.lock().await;
    let run = async {
        let outcome = supervisor.run(request, &sandbox_tx).await;
        drop(sandbox_tx);
        outcome
    };
    let forward = async {
        while let Some(event) = sandbox_rx.recv().await {
            if event.correlation_id != correlation_id {
                tracing::trace!(correlation_id = %event.correlation_id, "ignoring foreign event");
                continue;
            }
            let done = event.is_done();
            if done {
                running.clear();
            }
            let _ = out.send(event);
            if done {
                break;
            }
        }
    };

    let (outcome, ()) = tokio::join!(run, forward);
    tracing::info!(correlation_id = %correlation_id, outcome = ?outcome, "run finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_conversion_applies_overrides() {
        let file = RunpadConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 1500
            max_code_size_kb = 4
            max_output_events = 20
            max_heap_mb = 32
            execution_mode = "child_process"

            [compiler]
            checker = "disabled"
            default_language = "typescript"
            "#,
        )
        .unwrap();

        let config = CoordinatorConfig::from_config(&file).unwrap();
        assert_eq!(config.sandbox.timeout, Duration::from_millis(1500));
        assert_eq!(config.sandbox.max_code_size, 4096);
        assert_eq!(config.sandbox.max_output_events, 20);
        assert_eq!(config.sandbox.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(config.sandbox.execution_mode, ExecutionMode::ChildProcess);
        assert!(!config.compiler.checker_enabled);
        assert_eq!(config.default_language, SourceLanguage::TypeScript);
    }

    #[test]
    fn config_conversion_defaults() {
        let config = CoordinatorConfig::from_config(&RunpadConfig::default()).unwrap();
        assert_eq!(config.sandbox.timeout, Duration::from_millis(5000));
        assert_eq!(config.sandbox.execution_mode, ExecutionMode::InProcess);
        assert!(config.compiler.checker_enabled);
        assert_eq!(config.default_language, SourceLanguage::JavaScript);
    }

    #[test]
    fn new_coordinator_is_idle() {
        let coordinator = RunCoordinator::new(CoordinatorConfig::default());
        assert!(!coordinator.is_running());
        assert!(!*coordinator.running().borrow());
    }
}
