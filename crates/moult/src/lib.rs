//! # moult
//!
//! Zero-downtime upgrades for long-running network servers, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! A running generation replaces itself with a fresh copy of its executable by:
//! 1. Handing every open listener to a child process via fd inheritance
//! 2. Waiting for the child to signal readiness over a private control channel
//! 3. Releasing the parent's exit signal so it can stop accepting and drain
//!
//! Listening sockets are never closed during the switch: both generations hold
//! the same sockets until the parent exits, so no connection is refused.
//!
//! ```ignore
//! let upgrader = moult::Upgrader::new(moult::Options::from_env()?)?;
//! moult::signal::upgrade_on_signal(upgrader.clone(), SignalKind::hangup())?;
//!
//! let listener = upgrader.listen_tcp("127.0.0.1:8080")?;
//! // ... start serving on `listener` ...
//! upgrader.ready()?;
//! upgrader.exit().await;
//! // ... stop accepting, drain, return from main ...
//! ```
//!
//! ## Environment Variables
//!
//! - `MOULT_HANDOFF`: set by the parent on its child only; describes inherited fds
//! - `MOULT_PID_FILE`: path of the PID file (default: none)
//! - `MOULT_UPGRADE_TIMEOUT_SECS`: bound on waiting for a child (default: unbounded)
//! - `MOULT_DRAIN_TIMEOUT_SECS`: drain reminder after exit (default: 30)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("moult requires a Unix platform (Linux or macOS)");

pub mod control;
mod error;
pub mod fds;
pub mod fdset;
pub mod handoff;
pub mod pidfile;
pub mod signal;
pub mod spawn;
mod sys;
#[cfg(test)]
mod testing;
mod upgrader;

pub use error::{Result, UpgradeError};
pub use fds::{Fds, Listener};
pub use fdset::{FileDescriptorSet, HandoffEnv, InheritedFds, PassedFd};
pub use handoff::{UpgradeEvent, UpgradeState};
pub use pidfile::PidFile;
pub use spawn::{ChildExit, ProcessSpawner, SpawnRequest, SpawnedChild, Spawner};
pub use upgrader::{Generation, Options, ParentLink, Upgrader};
