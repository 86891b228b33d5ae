//! runpad sandbox worker: isolated child process for V8 execution.
//!
//! This binary is spawned by [`runpad_sandbox::host::ProcessUnit`] in the parent
//! process. It reads `Execute` messages from stdin, runs each request in a
//! fresh V8 isolate and writes every output event back over stdout. Requests
//! run one at a time; the parent kills the process to stop a run.
//!
//! Isolates run on a [`ThreadUnit`] so this task keeps writing events to the
//! parent while a snippet is still running.
//!
//! The process runs with a clean environment.

use anyhow::{Context, Result};
use runpad_sandbox::control::ContextControl;
use runpad_sandbox::event::{Envelope, OutputEvent};
use runpad_sandbox::ipc::{ChildMessage, FrameCodec, IpcError, ParentMessage};
use runpad_sandbox::runtime::RunLimits;
use runpad_sandbox::unit::{ExecutionUnit, Job, ThreadUnit};
use tokio::io::{self, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Minimal logging to stderr; the parent discards it unless RUNPAD_DEBUG is set.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let mut codec = FrameCodec::default();
    let mut next: Option<ParentMessage> = codec
        .recv(&mut stdin)
        .await
        .context("failed to read first message from parent")?;

    let mut unit: Option<(ThreadUnit, RunLimits)> = None;

    while let Some(ParentMessage::Execute { request, config }) = next {
        let correlation_id = request.correlation_id.clone();
        let control = ContextControl::new();
        control.bind(correlation_id.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::debug!(
            correlation_id = %correlation_id,
            code_len = request.source_code.len(),
            "worker: executing request"
        );

        let limits = config.run_limits();
        let runner = match unit.take() {
            Some((runner, current)) if current == limits && runner.is_alive() => runner,
            _ => match ThreadUnit::spawn(limits) {
                Ok(runner) => runner,
                Err(e) => return fail(&mut stdout, codec, e.to_string()).await,
            },
        };
        let runner = unit.insert((runner, limits));
        let job = Job {
            request,
            control,
            events: tx,
        };
        if let Err(e) = runner.0.submit(job).await {
            return fail(&mut stdout, codec, e.to_string()).await;
        }

        forward_events(rx, &mut stdout, codec)
            .await
            .context("failed to write events to parent")?;

        codec = FrameCodec::with_limit(config.max_ipc_message_size);
        next = match codec.recv(&mut stdin).await {
            Ok(msg) => msg,
            Err(e) => {
                return fail(&mut stdout, codec, format!("worker could not read request: {e}"))
                    .await
            }
        };
    }

    tracing::debug!("parent closed stdin; worker exiting");
    Ok(())
}

/// Tell the parent why the worker cannot go on, then exit with that error.
async fn fail<W: AsyncWrite + Unpin>(out: &mut W, codec: FrameCodec, message: String) -> Result<()> {
    tracing::error!(%message, "worker fault");
    let fault = ChildMessage::Fault {
        message: message.clone(),
    };
    codec.send(out, &fault).await.ok();
    Err(anyhow::anyhow!(message))
}

/// Write every event of the current run to the parent until the run's
/// channel closes.
///
/// An event too large for one frame is replaced by an `error` event saying so.
async fn forward_events<W: AsyncWrite + Unpin>(
    mut events: mpsc::UnboundedReceiver<Envelope>,
    out: &mut W,
    codec: FrameCodec,
) -> Result<(), IpcError> {
    while let Some(envelope) = events.recv().await {
        let id = envelope.event.correlation_id.clone();
        match codec.send(out, &ChildMessage::Event(envelope.event)).await {
            Err(IpcError::Oversized { len, limit }) => {
                tracing::warn!(correlation_id = %id, len, limit, "dropping oversized event");
                let notice = OutputEvent::error(
                    id,
                    format!("Output too large to deliver ({len} bytes, limit {limit} bytes)"),
                );
                codec.send(out, &ChildMessage::Event(notice)).await?;
            }
            other => other?,
        }
    }
    Ok(())
}
