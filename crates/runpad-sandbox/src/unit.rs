//! Execution units: the long-lived thing that hosts one context at a time.
//!
//! A unit outlives the contexts it runs. After a normal completion the next
//! request goes to the same unit (with a fresh isolate); after a timeout or a
//! crash the sandbox terminates the unit and spawns a new one.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::control::ContextControl;
use crate::error::SandboxError;
use crate::event::{Envelope, ExecutionRequest};
use crate::runtime::{run_request, RunLimits};

/// One request, bound to its context, ready for a unit to run.
pub struct Job {
    /// The request to run.
    pub request: ExecutionRequest,
    /// Control state of the context the request is bound to.
    pub control: Arc<ContextControl>,
    /// Where the context delivers its events.
    pub events: mpsc::UnboundedSender<Envelope>,
}

/// Hosts execution contexts, one at a time.
#[async_trait::async_trait]
pub trait ExecutionUnit: Send {
    /// Start running a job. Returns once the job is handed over, not when it
    /// finishes; its events arrive on the job's channel.
    async fn submit(&mut self, job: Job) -> Result<(), SandboxError>;

    /// Whether the unit can still accept jobs.
    fn is_alive(&self) -> bool;

    /// Tear the unit down. Any job still running is abandoned.
    fn terminate(&mut self);
}

/// A dedicated OS thread running a single-threaded tokio runtime.
///
/// V8 isolates are `!Send`, so each job's isolate is created and dropped on
/// this thread.
pub struct ThreadUnit {
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl ThreadUnit {
    /// Spawn the thread and its runtime.
    pub fn spawn(limits: RunLimits) -> Result<Self, SandboxError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("runpad-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build sandbox runtime");
                        return;
                    }
                };
                rt.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        run_request(job.request, job.control, job.events, limits).await;
                    }
                });
                tracing::debug!("sandbox thread exiting");
            })
            .map_err(|e| SandboxError::WorkerUnavailable {
                reason: format!("failed to spawn sandbox thread: {e}"),
            })?;

        Ok(Self { jobs: Some(tx) })
    }
}

#[async_trait::async_trait]
impl ExecutionUnit for ThreadUnit {
    async fn submit(&mut self, job: Job) -> Result<(), SandboxError> {
        let Some(jobs) = &self.jobs else {
            return Err(SandboxError::WorkerUnavailable {
                reason: "sandbox thread was terminated".into(),
            });
        };
        jobs.send(job).map_err(|_| SandboxError::WorkerUnavailable {
            reason: "sandbox thread has exited".into(),
        })
    }

    fn is_alive(&self) -> bool {
        self.jobs.as_ref().is_some_and(|jobs| !jobs.is_closed())
    }

    fn terminate(&mut self) {
        // The thread exits once its current (already terminated) run returns.
        self.jobs = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    
    fn job(code: &str) -> (Job, mpsc::UnboundedReceiver<Envelope>) {
        let request = ExecutionRequest::new(code);
        let control = ContextControl::new();
        control.bind(request.correlation_id.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Job {
                request,
                control,
                events: tx,
            },
            rx,
        )
    }

    async fn kinds(mut rx: mpsc::UnboundedReceiver<Envelope>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Some(envelope) = rx.recv().await {
            kinds.push(envelope.event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn thread_unit_runs_consecutive_jobs() {
        let mut unit = ThreadUnit::spawn(RunLimits::default()).unwrap();

        let (first, rx1) = job("console.log(1); 2");
        unit.submit(first).await.unwrap();
        assert_eq!(
            kinds(rx1).await,
            vec![EventKind::Log, EventKind::Result, EventKind::Done]
        );

        let (second, rx2) = job("3");
        unit.submit(second).await.unwrap();
        assert_eq!(kinds(rx2).await, vec![EventKind::Result, EventKind::Done]);
        assert!(unit.is_alive());
    }

    #[tokio::test]
    async fn terminated_thread_unit_refuses_jobs() {
        let mut unit = ThreadUnit::spawn(RunLimits::default()).unwrap();
        unit.terminate();
        assert!(!unit.is_alive());

        let (next, _rx) = job("1");
        let err = unit.submit(next).await.unwrap_err();
        assert!(matches!(err, SandboxError::WorkerUnavailable { .. }));
    }

    #[tokio::test]
    async fn destroyed_job_closes_its_channel_silently() {
        let mut unit = ThreadUnit::spawn(RunLimits::default()).unwrap();
        let (spin, rx) = job("while (true) {}");
        let control = spin.control.clone();
        unit.submit(spin).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(control.destroy());
        assert!(kinds(rx).await.is_empty());
    }
}
