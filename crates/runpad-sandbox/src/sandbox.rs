//! The execution sandbox: a single context slot backed by a replaceable unit.
//!
//! [`Sandbox::bind`] creates a fresh context for a request and hands it to the
//! current execution unit. The returned [`BoundRun`] is the only way to observe
//! that context's events. [`Sandbox::destroy`] tears the context down together
//! with its unit and brings up a replacement.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::control::ContextControl;
use crate::error::SandboxError;
use crate::event::{ContextId, CorrelationId, Envelope, ExecutionRequest};
use crate::host::ProcessUnit;
use crate::runtime::{ExecutionMode, SandboxConfig};
use crate::unit::{ExecutionUnit, Job, ThreadUnit};
use crate::validator::validate_code;

/// A request bound to a fresh execution context.
pub struct BoundRun {
    control: Arc<ContextControl>,
    correlation_id: CorrelationId,
    events: mpsc::UnboundedReceiver<Envelope>,
}

impl BoundRun {
    /// Identity of the context running this request.
    pub fn context_id(&self) -> ContextId {
        self.control.id()
    }

    /// Correlation id of the request.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Shared control state of the context.
    pub fn control(&self) -> &Arc<ContextControl> {
        &self.control
    }

    /// Next event from the context.
    ///
    /// `None` means the context can produce nothing more: the unit went away,
    /// or the context was destroyed and its unit released the channel.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }
}

/// Owns the execution unit and binds requests to fresh contexts.
pub struct Sandbox {
    config: SandboxConfig,
    unit: Option<Box<dyn ExecutionUnit>>,
}

impl Sandbox {
    /// Create a sandbox. The execution unit is started on first use.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config, unit: None }
    }

    /// The sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Bind `request` to a fresh context and start running it.
    pub async fn bind(&mut self, request: ExecutionRequest) -> Result<BoundRun, SandboxError> {
        validate_code(&request.source_code, Some(self.config.max_code_size))?;

        if !self.unit.as_ref().is_some_and(|unit| unit.is_alive()) {
            self.replace_unit()?;
        }
        let Some(unit) = self.unit.as_mut() else {
            return Err(SandboxError::WorkerUnavailable {
                reason: "no execution unit available".into(),
            });
        };

        let control = ContextControl::new();
        control.bind(request.correlation_id.clone());
        let correlation_id = request.correlation_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::debug!(
            context_id = %control.id(),
            correlation_id = %correlation_id,
            code_len = request.source_code.len(),
            "binding request to new context"
        );

        let job = Job {
            request,
            control: control.clone(),
            events: tx,
        };
        if let Err(e) = unit.submit(job).await {
            control.destroy();
            if let Some(mut dead) = self.unit.take() {
                dead.terminate();
            }
            return Err(e);
        }

        Ok(BoundRun {
            control,
            correlation_id,
            events: rx,
        })
    }

    /// Destroy the run's context, then replace the unit that hosted it.
    ///
    /// Returns `false` if the context had already completed; nothing is
    /// torn down in that case.
    pub fn destroy(&mut self, run: &BoundRun) -> bool {
        if !run.control.destroy() {
            return false;
        }
        if let Err(e) = self.replace_unit() {
            // The next bind retries.
            tracing::warn!(error = %e, "failed to replace execution unit");
        }
        true
    }

    /// Drop the current unit and start a fresh idle one.
    fn replace_unit(&mut self) -> Result<(), SandboxError> {
        if let Some(mut old) = self.unit.take() {
            old.terminate();
        }
        let unit: Box<dyn ExecutionUnit> = match self.config.execution_mode {
            ExecutionMode::InProcess => Box::new(ThreadUnit::spawn(self.config.run_limits())?),
            ExecutionMode::ChildProcess => Box::new(ProcessUnit::spawn(&self.config)?),
        };
        tracing::debug!(mode = ?self.config.execution_mode, "execution unit ready");
        self.unit = Some(unit);
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(mut unit) = self.unit.take() {
            unit.terminate();
        }
    }
}
