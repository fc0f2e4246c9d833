//! Error types for the upgrade coordinator.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UpgradeError>;

/// Everything that can go wrong while acquiring listeners, signaling
/// readiness or handing off to a new generation.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Invalid configuration (bad PID file path and similar).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The PID file or its lock could not be opened or written.
    #[error("PID file error at {}: {source}", .path.display())]
    PidFile {
        /// Path of the PID file that failed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Another live generation holds the PID file lock.
    #[error("Another instance is already running{}", pid_suffix(.pid))]
    AlreadyRunning {
        /// PID recorded in the PID file, if it could be read.
        pid: Option<u32>,
    },

    /// A new listener could not be bound.
    #[error("Failed to bind {name}: {source}")]
    Bind {
        /// Logical listener name, e.g. `tcp:127.0.0.1:8080`.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The requested protocol is not one of `tcp`, `tcp4`, `tcp6` or `unix`.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Another upgrade is currently in flight.
    #[error("An upgrade is already in progress")]
    UpgradeInProgress,

    /// This generation already handed off to a child.
    #[error("This generation has already been upgraded")]
    AlreadyUpgraded,

    /// A child generation may not upgrade while its own parent still runs.
    #[error("Parent generation (pid {pid}) has not exited yet")]
    ParentNotExited {
        /// PID of the still running parent.
        pid: u32,
    },

    /// The child process exited before it signaled readiness.
    #[error("Child (pid {pid}) exited before becoming ready: {status}")]
    ChildExitedEarly {
        /// PID of the child.
        pid: u32,
        /// Human readable exit status.
        status: String,
    },

    /// The child did not become ready within the configured bound.
    #[error("Child (pid {pid}) did not become ready within {timeout:?}")]
    ChildTimeout {
        /// PID of the child, which is left running.
        pid: u32,
        /// The configured upgrade timeout.
        timeout: Duration,
    },

    /// The child reported a startup failure over the control channel.
    #[error("Child (pid {pid}) failed to start: {reason}")]
    ChildFailed {
        /// PID of the child.
        pid: u32,
        /// Reason sent by the child.
        reason: String,
    },

    /// The control channel closed without a readiness message and the child
    /// did not exit either.
    #[error("Control channel to child (pid {pid}) closed before readiness")]
    ControlClosed {
        /// PID of the child.
        pid: u32,
    },

    /// A new listener was requested after the descriptor set was frozen.
    #[error("Too late to add {name}: descriptors are frozen for an upgrade")]
    TooLate {
        /// Name of the rejected listener.
        name: String,
    },

    /// The upgrader has been stopped.
    #[error("Upgrader has been stopped")]
    Stopped,

    /// The inherited environment marker or descriptor table is malformed.
    #[error("Invalid handoff state: {0}")]
    Handoff(String),

    /// The child process could not be spawned.
    #[error("Failed to spawn child: {0}")]
    Spawn(#[source] io::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn pid_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

impl UpgradeError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new handoff error.
    pub fn handoff(msg: impl Into<String>) -> Self {
        Self::Handoff(msg.into())
    }

    /// Whether this error only means an upgrade attempt did not happen or did
    /// not succeed. The generation that reported it stays fully operational.
    pub fn is_upgrade_failure(&self) -> bool {
        matches!(
            self,
            Self::UpgradeInProgress
                | Self::AlreadyUpgraded
                | Self::ParentNotExited { .. }
                | Self::ChildExitedEarly { .. }
                | Self::ChildTimeout { .. }
                | Self::ChildFailed { .. }
                | Self::ControlClosed { .. }
                | Self::Spawn(_)
        )
    }
}
