//! Fake spawners simulating child generations inside the test process.

use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::control::{ChildControl, ControlMessage};
use crate::fdset::InheritedFds;
use crate::spawn::{ChildExit, SpawnRequest, SpawnedChild, Spawner};
use crate::upgrader::{Options, Upgrader};

fn to_io(err: crate::UpgradeError) -> io::Error {
    io::Error::other(err.to_string())
}

/// Fails every spawn.
pub(crate) struct Refuse;

impl Spawner for Refuse {
    fn spawn(&self, _request: SpawnRequest) -> io::Result<SpawnedChild> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no such program"))
    }
}

/// Builds a full child [`Upgrader`] from the request, listens on the given
/// TCP addresses and signals readiness.
#[derive(Clone)]
pub(crate) struct InProcessChild {
    options: Options,
    addresses: Vec<String>,
    children: Arc<Mutex<Vec<(Upgrader, Vec<bool>)>>>,
}

impl InProcessChild {
    pub(crate) fn new(options: Options, addresses: &[&str]) -> Self {
        Self {
            options,
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            children: Arc::default(),
        }
    }

    /// Every child started so far, with the inherited flag of each listener.
    pub(crate) fn children(&self) -> Vec<(Upgrader, Vec<bool>)> {
        self.children.lock().unwrap().clone()
    }
}

impl Spawner for InProcessChild {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild> {
        let inherited =
            InheritedFds::from_parts(request.env, request.control, request.files).map_err(to_io)?;
        let child =
            Upgrader::with_spawner(self.options.clone(), Some(inherited), Refuse).map_err(to_io)?;

        let mut flags = Vec::with_capacity(self.addresses.len());
        for address in &self.addresses {
            let (_, inherited) = child.fds().listen("tcp", address).map_err(to_io)?;
            flags.push(inherited);
        }
        child.ready().map_err(to_io)?;

        self.children.lock().unwrap().push((child, flags));

        // The simulated child never exits.
        let (_, exited) = oneshot::channel();
        Ok(SpawnedChild {
            pid: std::process::id(),
            exited,
        })
    }
}

/// Children that exit with code 7 without reporting anything.
#[derive(Clone, Default)]
pub(crate) struct ExitEarly {
    spawned: Arc<AtomicUsize>,
}

impl ExitEarly {
    pub(crate) fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Spawner for ExitEarly {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        drop(request);
        let (tx, exited) = oneshot::channel();
        let _ = tx.send(ChildExit::code(7));
        Ok(SpawnedChild { pid: 1_000_000, exited })
    }
}

/// Children that stay silent and alive forever.
#[derive(Clone, Default)]
pub(crate) struct Hang {
    spawned: Arc<AtomicUsize>,
    held: Arc<Mutex<Vec<(OwnedFd, oneshot::Sender<ChildExit>)>>>,
}

impl Hang {
    pub(crate) fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Spawner for Hang {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (tx, exited) = oneshot::channel();
        self.held.lock().unwrap().push((request.control, tx));
        Ok(SpawnedChild { pid: 1_000_001, exited })
    }
}

/// Children that report a startup failure over the control channel.
pub(crate) struct ReportFailure;

impl Spawner for ReportFailure {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedChild> {
        ChildControl::new(request.control)?.send(&ControlMessage::Failed {
            pid: 1_000_002,
            reason: "configuration rejected".to_string(),
        })?;
        let (_, exited) = oneshot::channel();
        Ok(SpawnedChild { pid: 1_000_002, exited })
    }
}
