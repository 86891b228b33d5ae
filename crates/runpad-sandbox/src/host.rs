//! Parent-side management of the `runpad-sandbox-worker` child process.
//!
//! Spawns the worker with a clean environment and talks to it over
//! length-delimited JSON IPC (stdin/stdout). A background reader task routes
//! the worker's events to the context currently bound to it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::control::ContextControl;
use crate::error::SandboxError;
use crate::event::{CorrelationId, Envelope, OutputEvent};
use crate::ipc::{ChildMessage, FrameCodec, ParentMessage, WorkerConfig};
use crate::unit::{ExecutionUnit, Job};

/// Name of the worker executable.
pub const WORKER_BIN_NAME: &str = "runpad-sandbox-worker";

/// Where the reader task sends events for the run in flight.
struct Route {
    correlation_id: CorrelationId,
    control: Arc<ContextControl>,
    events: UnboundedSender<Envelope>,
}

type RouteSlot = Arc<Mutex<Option<Route>>>;

fn lock(slot: &RouteSlot) -> MutexGuard<'_, Option<Route>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An execution unit backed by a worker child process.
pub struct ProcessUnit {
    child: Child,
    stdin: ChildStdin,
    route: RouteSlot,
    reader: JoinHandle<()>,
    codec: FrameCodec,
    config: WorkerConfig,
}

impl ProcessUnit {
    /// Spawn a worker process. Must be called from within a tokio runtime.
    pub fn spawn(config: &crate::SandboxConfig) -> Result<Self, SandboxError> {
        let worker_bin = find_worker_binary()?;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var("RUNPAD_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::WorkerUnavailable {
                reason: format!("failed to spawn worker at {}: {}", worker_bin.display(), e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::WorkerUnavailable {
            reason: "no stdin on child".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::WorkerUnavailable {
            reason: "no stdout on child".into(),
        })?;

        let route: RouteSlot = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_loop(
            BufReader::new(stdout),
            route.clone(),
            FrameCodec::with_limit(config.max_ipc_message_size),
        ));

        tracing::debug!(pid = ?child.id(), "spawned sandbox worker");

        Ok(Self {
            child,
            stdin,
            route,
            reader,
            codec: FrameCodec::with_limit(config.max_ipc_message_size),
            config: WorkerConfig::from(config),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn submit(&mut self, job: Job) -> Result<(), SandboxError> {
        let Job {
            request,
            control,
            events,
        } = job;

        *lock(&self.route) = Some(Route {
            correlation_id: request.correlation_id.clone(),
            control,
            events,
        });

        let msg = ParentMessage::Execute {
            request,
            config: self.config.clone(),
        };
        if let Err(e) = self.codec.send(&mut self.stdin, &msg).await {
            lock(&self.route).take();
            return Err(SandboxError::WorkerUnavailable {
                reason: format!("failed to send request to worker: {e}"),
            });
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    fn terminate(&mut self) {
        self.reader.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "sandbox worker already gone");
        }
        lock(&self.route).take();
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read worker messages until the worker goes away.
///
/// Events are delivered through the bound context's control, so nothing gets
/// through once that context has been destroyed. When the worker exits with a
/// run still routed, the route is dropped, which closes that run's channel.
async fn read_loop(mut stdout: BufReader<ChildStdout>, route: RouteSlot, codec: FrameCodec) {
    loop {
        let msg: ChildMessage = match codec.recv(&mut stdout).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::debug!("sandbox worker closed its output");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sandbox worker IPC read failed");
                break;
            }
        };

        match msg {
            ChildMessage::Event(event) => {
                let mut slot = lock(&route);
                let Some(current) = slot.as_ref() else {
                    tracing::trace!(correlation_id = %event.correlation_id, "worker event with no run in flight");
                    continue;
                };
                if current.correlation_id != event.correlation_id {
                    tracing::trace!(correlation_id = %event.correlation_id, "dropping stale worker event");
                    continue;
                }
                let done = event.is_done();
                current.control.deliver(&current.events, event);
                if done {
                    *slot = None;
                }
            }
            ChildMessage::Fault { message } => {
                tracing::warn!(%message, "sandbox worker reported a fault");
                if let Some(current) = lock(&route).take() {
                    let id = current.correlation_id;
                    current
                        .control
                        .deliver(&current.events, OutputEvent::error(id.clone(), message));
                    current.control.deliver(&current.events, OutputEvent::done(id));
                }
            }
        }
    }
    lock(&route).take();
}

/// Find the `runpad-sandbox-worker` binary.
///
/// Search order:
/// 1. `RUNPAD_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var("RUNPAD_WORKER_BIN") {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::WorkerUnavailable {
                reason: format!("RUNPAD_WORKER_BIN must be an absolute path, got: {path}"),
            });
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let worker = dir.join(WORKER_BIN_NAME);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
            // Test binaries live in target/<profile>/deps/.
            if let Some(parent) = dir.parent() {
                let worker = parent.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::WorkerUnavailable {
        reason: format!(
            "{WORKER_BIN_NAME} binary not found. Set RUNPAD_WORKER_BIN or install it alongside runpad"
        ),
    })
}

/// Reject world-writable worker binaries (Unix only).
fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| SandboxError::WorkerUnavailable {
            reason: format!("cannot read metadata for {}: {}", _path.display(), e),
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::WorkerUnavailable {
                reason: format!(
                    "insecure permissions on worker binary {}: mode {:o} is world-writable",
                    _path.display(),
                    mode,
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rejects_relative_env_var() {
        std::env::set_var("RUNPAD_WORKER_BIN", "./relative/path");
        let result = find_worker_binary();
        std::env::remove_var("RUNPAD_WORKER_BIN");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    #[serial]
    fn missing_binary_error_names_the_env_var() {
        std::env::remove_var("RUNPAD_WORKER_BIN");
        if let Err(e) = find_worker_binary() {
            let msg = e.to_string();
            assert!(msg.contains("RUNPAD_WORKER_BIN"), "error should guide user: {msg}");
        }
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn rejects_world_writable_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var("RUNPAD_WORKER_BIN", bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var("RUNPAD_WORKER_BIN");

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn accepts_secure_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var("RUNPAD_WORKER_BIN", bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var("RUNPAD_WORKER_BIN");

        assert_eq!(result.unwrap(), bin);
    }
}
