//! Private control channel between a parent generation and its child.
//!
//! A Unix socket pair is created per upgrade attempt. The child end is placed
//! at fd 3 in the child; the child writes exactly one newline-terminated JSON
//! message (`ready` or `failed`) and closes its end. The parent treats EOF
//! without a message as the child going away.

use std::io::{self, Write};
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::warn;

use crate::error::{Result, UpgradeError};

const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Messages sent from child to parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The child finished initialization and is serving.
    Ready { pid: u32 },
    /// The child could not start.
    Failed { pid: u32, reason: String },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| UpgradeError::handoff(format!("failed to encode control message: {e}")))
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| UpgradeError::handoff(format!("malformed control message {line:?}: {e}")))
    }
}

/// Create a fresh channel: the parent end and the descriptor for the child.
pub(crate) fn channel() -> io::Result<(StdUnixStream, OwnedFd)> {
    let (parent, child) = StdUnixStream::pair()?;
    Ok((parent, OwnedFd::from(child)))
}

/// Child side. Sending consumes the endpoint, closing the channel.
#[derive(Debug)]
pub(crate) struct ChildControl {
    stream: StdUnixStream,
}

impl ChildControl {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        let stream = StdUnixStream::from(fd);
        stream.set_nonblocking(false)?;
        Ok(Self { stream })
    }

    pub(crate) fn send(mut self, message: &ControlMessage) -> io::Result<()> {
        let line = message
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    /// Tell the parent this child cannot start. Delivery failures are logged.
    pub(crate) fn report_failure(self, err: &UpgradeError) {
        let message = ControlMessage::Failed {
            pid: std::process::id(),
            reason: err.to_string(),
        };
        if let Err(send_err) = self.send(&message) {
            warn!(error = %send_err, "Failed to report startup failure to parent");
        }
    }
}

/// Parent side.
pub(crate) struct ParentControl {
    lines: FramedRead<UnixStream, LinesCodec>,
}

impl ParentControl {
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(stream: StdUnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(Self {
            lines: FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LEN)),
        })
    }

    /// Next message, or `None` once the child end is closed.
    pub(crate) async fn recv(&mut self) -> Option<Result<ControlMessage>> {
        match self.lines.next().await? {
            Ok(line) => Some(ControlMessage::decode(&line)),
            Err(err) => Some(Err(UpgradeError::handoff(format!(
                "control channel read failed: {err}"
            )))),
        }
    }
}
