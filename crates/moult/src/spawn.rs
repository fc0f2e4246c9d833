//! Starting the next generation.
//!
//! [`ProcessSpawner`] re-executes a binary (by default the running one) with
//! the control channel at fd 3 and the named descriptors at fd 4 onward. The
//! [`Spawner`] trait is the seam the upgrader spawns through, so tests can
//! substitute an in-process child.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::fdset::{HandoffEnv, CONTROL_SLOT, HANDOFF_ENV};
use crate::sys;

/// Everything a child generation receives.
#[derive(Debug)]
pub struct SpawnRequest {
    /// Marker for the child's environment.
    pub env: HandoffEnv,
    /// Child end of the control channel, destined for fd 3.
    pub control: OwnedFd,
    /// Named descriptors in slot order, destined for fd 4 onward.
    pub files: Vec<OwnedFd>,
}

/// A started child.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    /// Resolves once the child exits.
    pub exited: oneshot::Receiver<ChildExit>,
}

/// Starts child generations.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild>;
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    /// A normal exit with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Termination by `signal`.
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Spawns a real process.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    /// Re-execute the running binary with its original arguments.
    pub fn current() -> io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
            envs: Vec::new(),
        })
    }

    /// Execute `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Replace the argument list.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Set an extra environment variable for every child.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild> {
        let marker = request
            .env
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let generation = request.env.generation;

        // Stage every source above the slot range so the dup2 calls in the
        // child cannot overwrite a source that already sits in it.
        let floor = CONTROL_SLOT + 1 + request.files.len() as RawFd;
        let staged = std::iter::once(&request.control)
            .chain(request.files.iter())
            .map(|fd| sys::dup_above(fd.as_fd(), floor))
            .collect::<io::Result<Vec<OwnedFd>>>()?;
        let sources: Vec<RawFd> = staged.iter().map(|fd| fd.as_raw_fd()).collect();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().cloned())
            .env(HANDOFF_ENV, &marker);

        // SAFETY: the closure runs between fork and exec and only calls the
        // async-signal-safe dup2. dup2 clears CLOEXEC on the target, so the
        // slots survive exec while the staged copies do not.
        unsafe {
            command.pre_exec(move || {
                for (i, source) in sources.iter().enumerate() {
                    if libc::dup2(*source, CONTROL_SLOT + i as RawFd) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was known"))?;

        // Our copies of the child's descriptors are no longer needed; holding
        // the control end open would hide the child's exit from the parent.
        drop(staged);
        drop(request);

        info!(
            pid,
            program = %self.program.display(),
            generation,
            "Spawned child generation"
        );

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ChildExit::from(status),
                Err(err) => {
                    warn!(pid, error = %err, "Failed to wait for child");
                    ChildExit::unknown()
                }
            };
            debug!(pid, status = %exit, "Child exited");
            let _ = tx.send(exit);
        });

        Ok(SpawnedChild { pid, exited: rx })
    }
}
