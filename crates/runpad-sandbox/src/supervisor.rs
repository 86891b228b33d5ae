//! Wall-clock supervision of a single run.
//!
//! The supervisor races the bound context's event stream against a deadline.
//! Whichever finishes first decides the run: `done` cancels the timer; the
//! deadline destroys the context, replaces its execution unit and emits a
//! synthetic timeout error. Every path ends with exactly one `done`.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::SandboxError;
use crate::event::{ContextId, CorrelationId, Envelope, ExecutionRequest, OutputEvent};
use crate::runtime::SandboxConfig;
use crate::sandbox::{BoundRun, Sandbox};

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunOutcome {
    /// The context emitted `done` before the deadline.
    Completed,
    /// The deadline expired; the context was destroyed and replaced.
    TimedOut,
    /// The execution unit went away without finishing the run.
    ContextLost,
    /// The run could not be started.
    Rejected,
}

/// Runs requests in a [`Sandbox`] under a deadline.
pub struct Supervisor {
    sandbox: Sandbox,
    timeout: Duration,
}

impl Supervisor {
    /// Create a supervisor owning a sandbox built from `config`.
    pub fn new(config: SandboxConfig) -> Self {
        let timeout = config.timeout;
        Self {
            sandbox: Sandbox::new(config),
            timeout,
        }
    }

    /// The per-run deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `request` to completion, forwarding its events to `out`.
    ///
    /// Exactly one `done` for the request's correlation id is sent to `out`
    /// on every path, and it is the last event sent.
    pub async fn run(
        &mut self,
        request: ExecutionRequest,
        out: &UnboundedSender<OutputEvent>,
    ) -> RunOutcome {
        let correlation_id = request.correlation_id.clone();
        let started = Instant::now();

        let mut run = match self.sandbox.bind(request).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(correlation_id = %correlation_id, error = %e, "run rejected");
                finish_with_error(out, &correlation_id, &e);
                return RunOutcome::Rejected;
            }
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                envelope = run.recv() => match envelope {
                    Some(envelope) => {
                        if forward(&run, envelope, out) {
                            break RunOutcome::Completed;
                        }
                    }
                    None => {
                        self.sandbox.destroy(&run);
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            context_id = %run.context_id(),
                            "execution context lost"
                        );
                        finish_with_error(out, &correlation_id, &SandboxError::ContextLost);
                        break RunOutcome::ContextLost;
                    }
                },
                () = &mut deadline => {
                    if self.sandbox.destroy(&run) {
                        let timeout_ms = self.timeout.as_millis() as u64;
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            context_id = %run.context_id(),
                            timeout_ms,
                            "execution timed out"
                        );
                        finish_with_error(out, &correlation_id, &SandboxError::Timeout { timeout_ms });
                        break RunOutcome::TimedOut;
                    }
                    // `done` was delivered just before the deadline.
                    break drain_completed(&mut run, out).await;
                }
            }
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            context_id = %run.context_id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "supervised run finished"
        );
        outcome
    }
}

/// Forward an event from the run's context. Returns `true` on `done`.
fn forward(run: &BoundRun, envelope: Envelope, out: &UnboundedSender<OutputEvent>) -> bool {
    if !is_current(&envelope, run.context_id(), run.correlation_id()) {
        tracing::trace!(
            from = %envelope.context,
            correlation_id = %envelope.event.correlation_id,
            "dropping stale event"
        );
        return false;
    }
    let done = envelope.event.is_done();
    if out.send(envelope.event).is_err() {
        tracing::trace!("run output receiver dropped");
    }
    done
}

/// Whether an envelope belongs to the context and request being awaited.
pub fn is_current(envelope: &Envelope, context: ContextId, correlation_id: &CorrelationId) -> bool {
    envelope.context == context && &envelope.event.correlation_id == correlation_id
}

/// Forward what a completed context left in its channel, up to `done`.
async fn drain_completed(run: &mut BoundRun, out: &UnboundedSender<OutputEvent>) -> RunOutcome {
    while let Some(envelope) = run.recv().await {
        if forward(run, envelope, out) {
            return RunOutcome::Completed;
        }
    }
    let correlation_id = run.correlation_id().clone();
    finish_with_error(out, &correlation_id, &SandboxError::ContextLost);
    RunOutcome::ContextLost
}

fn finish_with_error(
    out: &UnboundedSender<OutputEvent>,
    correlation_id: &CorrelationId,
    error: &SandboxError,
) {
    let _ = out.send(OutputEvent::error(correlation_id.clone(), error.to_string()));
    let _ = out.send(OutputEvent::done(correlation_id.clone()));
}
