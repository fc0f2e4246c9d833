//! The parent side of an upgrade, as a finite-state machine.
//!
//! ```text
//! Idle ──Requested──▶ Upgrading ──Spawned──▶ AwaitingChildReady ──ChildReady──▶ Completed
//!  ▲                      │                         │
//!  │                  SpawnFailed        ChildExited / ChildFailed / TimedOut
//!  │                      ▼                         ▼
//!  └────────Reset────── Failed ◀────────────────────┘
//! ```
//!
//! Transitions are a pure function of the current state and a typed event so
//! every race (early exit, timeout, duplicate request) can be exercised without
//! spawning processes. [`await_readiness`] turns what a child does into exactly
//! one terminal outcome.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::control::{ControlMessage, ParentControl};
use crate::error::{Result, UpgradeError};
use crate::spawn::{ChildExit, SpawnedChild};

/// How long to wait for the missing half of a race between the child's
/// readiness message and its exit status.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Upgrade state of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    Upgrading,
    AwaitingChildReady { child_pid: u32 },
    Completed { child_pid: u32 },
    Failed,
}

/// Events driving [`UpgradeState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEvent {
    Requested,
    Spawned { child_pid: u32 },
    SpawnFailed,
    ChildReady,
    ChildExited,
    ChildFailed,
    TimedOut,
    Reset,
}

impl UpgradeState {
    /// Apply `event`, returning the next state.
    ///
    /// A request while an upgrade is in flight is rejected with
    /// `UpgradeInProgress`; one after completion with `AlreadyUpgraded`.
    pub fn on(self, event: UpgradeEvent) -> Result<UpgradeState> {
        use UpgradeEvent as E;
        use UpgradeState as S;

        match (self, event) {
            (S::Idle, E::Requested) => Ok(S::Upgrading),
            (S::Upgrading | S::AwaitingChildReady { .. } | S::Failed, E::Requested) => {
                Err(UpgradeError::UpgradeInProgress)
            }
            (S::Completed { .. }, E::Requested) => Err(UpgradeError::AlreadyUpgraded),

            (S::Upgrading, E::Spawned { child_pid }) => Ok(S::AwaitingChildReady { child_pid }),
            (S::Upgrading, E::SpawnFailed) => Ok(S::Failed),

            (S::AwaitingChildReady { child_pid }, E::ChildReady) => Ok(S::Completed { child_pid }),
            (
                S::AwaitingChildReady { .. },
                E::ChildExited | E::ChildFailed | E::TimedOut | E::SpawnFailed,
            ) => Ok(S::Failed),

            (S::Failed, E::Reset) => Ok(S::Idle),

            (state, event) => Err(UpgradeError::handoff(format!(
                "invalid upgrade transition from {state} on {event:?}"
            ))),
        }
    }

    /// Whether an upgrade is currently between request and outcome.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpgradeState::Upgrading | UpgradeState::AwaitingChildReady { .. }
        )
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Idle => write!(f, "Idle"),
            UpgradeState::Upgrading => write!(f, "Upgrading"),
            UpgradeState::AwaitingChildReady { child_pid } => {
                write!(f, "AwaitingChildReady(pid {child_pid})")
            }
            UpgradeState::Completed { child_pid } => write!(f, "Completed(pid {child_pid})"),
            UpgradeState::Failed => write!(f, "Failed"),
        }
    }
}

/// The event that ends an attempt which failed with `err`.
pub(crate) fn failure_event(err: &UpgradeError) -> UpgradeEvent {
    match err {
        UpgradeError::ChildTimeout { .. } => UpgradeEvent::TimedOut,
        UpgradeError::ChildFailed { .. } => UpgradeEvent::ChildFailed,
        _ => UpgradeEvent::ChildExited,
    }
}

enum First {
    Message(Option<Result<ControlMessage>>),
    Exited(ChildExit),
    Deadline,
}

/// Wait until the child signals readiness, exits, reports a failure, or the
/// optional timeout elapses. Returns the child's PID once it is ready.
///
/// The child is never killed here; on timeout it is left running.
pub(crate) async fn await_readiness(
    mut control: ParentControl,
    child: SpawnedChild,
    timeout: Option<Duration>,
) -> Result<u32> {
    let pid = child.pid;
    let mut exited = child.exited;

    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let first = tokio::select! {
        message = control.recv() => First::Message(message),
        exit = wait_exit(&mut exited) => First::Exited(exit),
        _ = deadline => First::Deadline,
    };

    match first {
        First::Message(Some(Ok(message))) => from_message(pid, message),
        First::Message(Some(Err(err))) => {
            warn!(child_pid = pid, error = %err, "Unreadable message from child");
            Err(err)
        }
        First::Message(None) => {
            debug!(child_pid = pid, "Control channel closed before readiness");
            match tokio::time::timeout(EXIT_GRACE, wait_exit(&mut exited)).await {
                Ok(exit) => Err(UpgradeError::ChildExitedEarly {
                    pid,
                    status: exit.to_string(),
                }),
                Err(_) => Err(UpgradeError::ControlClosed { pid }),
            }
        }
        First::Exited(exit) => {
            // A child may report readiness and exit right after.
            match tokio::time::timeout(EXIT_GRACE, control.recv()).await {
                Ok(Some(Ok(message))) => from_message(pid, message),
                _ => Err(UpgradeError::ChildExitedEarly {
                    pid,
                    status: exit.to_string(),
                }),
            }
        }
        First::Deadline => Err(UpgradeError::ChildTimeout {
            pid,
            timeout: timeout.unwrap_or_default(),
        }),
    }
}

fn from_message(pid: u32, message: ControlMessage) -> Result<u32> {
    match message {
        ControlMessage::Ready { pid: reported } => {
            if reported != pid {
                debug!(child_pid = pid, reported, "Child reported a different PID");
            }
            Ok(pid)
        }
        ControlMessage::Failed { reason, .. } => Err(UpgradeError::ChildFailed { pid, reason }),
    }
}

async fn wait_exit(exited: &mut oneshot::Receiver<ChildExit>) -> ChildExit {
    match exited.await {
        Ok(exit) => exit,
        // Nobody will ever report an exit.
        Err(_) => std::future::pending().await,
    }
}
