//! Host ↔ worker wire protocol.
//!
//! Every message is one frame: a big-endian `u32` byte count followed by that
//! many bytes of JSON. [`ParentMessage`] flows to the worker, [`ChildMessage`]
//! flows back. Request and event payloads keep the camelCase wire names of
//! [`ExecutionRequest`] and [`OutputEvent`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::event::{ExecutionRequest, OutputEvent};

/// Default frame size limit: 8 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Host to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Run this request in a fresh context.
    Execute {
        /// The request to run.
        request: ExecutionRequest,
        /// Per-run limits.
        config: WorkerConfig,
    },
}

/// Worker to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// An output event for the request currently running.
    Event(OutputEvent),
    /// The worker cannot go on (it could not read or start a run).
    Fault {
        /// What went wrong.
        message: String,
    },
}

/// Limits sent along with each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum console events delivered per run.
    pub max_output_events: usize,
    /// V8 heap limit in bytes.
    #[serde(default = "WorkerConfig::default_heap_limit")]
    pub max_heap_size: usize,
    /// Frame size limit in bytes for the worker's next read.
    #[serde(default = "WorkerConfig::default_frame_limit")]
    pub max_ipc_message_size: usize,
}

impl WorkerConfig {
    fn default_frame_limit() -> usize {
        DEFAULT_MAX_IPC_MESSAGE_SIZE
    }

    fn default_heap_limit() -> usize {
        crate::runtime::DEFAULT_MAX_HEAP_SIZE
    }

    /// The limits the worker runs each request with.
    pub fn run_limits(&self) -> crate::runtime::RunLimits {
        crate::runtime::RunLimits {
            max_output_events: self.max_output_events,
            max_heap_size: self.max_heap_size,
        }
    }
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        Self {
            max_output_events: config.max_output_events,
            max_heap_size: config.max_heap_size,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

/// Framing failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    /// The pipe itself failed.
    #[error("IPC pipe error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame's JSON did not match the expected message type, or a message
    /// could not be encoded.
    #[error("malformed IPC message: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame is larger than the configured limit.
    #[error("IPC message too large: {len} bytes (limit: {limit} bytes)")]
    Oversized {
        /// Frame length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The stream ended part-way through a frame.
    #[error("IPC stream ended mid-frame")]
    Truncated,
}

/// Reads and writes length-prefixed JSON frames under a size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    limit: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_IPC_MESSAGE_SIZE)
    }
}

impl FrameCodec {
    /// A codec rejecting frames larger than `limit` bytes (capped at `u32::MAX`).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.min(u32::MAX as usize),
        }
    }

    /// The frame size limit in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Encode `msg` as one frame and flush it.
    pub async fn send<T, W>(&self, writer: &mut W, msg: &T) -> Result<(), IpcError>
    where
        T: Serialize,
        W: AsyncWrite + Unpin,
    {
        let payload = serde_json::to_vec(msg)?;
        let len = self.check(payload.len())?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Decode the next frame. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn recv<T, R>(&self, reader: &mut R) -> Result<Option<T>, IpcError>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LEN_PREFIX];
        let mut filled = 0;
        while filled < LEN_PREFIX {
            match reader.read(&mut prefix[filled..]).await? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(IpcError::Truncated),
                n => filled += n,
            }
        }

        let len = self.check(u32::from_be_bytes(prefix) as usize)? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IpcError::Truncated
            } else {
                IpcError::Io(e)
            }
        })?;

        Ok(Some(serde_json::from_slice(&payload)?))
    }

    fn check(&self, len: usize) -> Result<u32, IpcError> {
        if len > self.limit {
            return Err(IpcError::Oversized {
                len,
                limit: self.limit,
            });
        }
        u32::try_from(len).map_err(|_| IpcError::Oversized {
            len,
            limit: self.limit,
        })
    }
}
