//! The public orchestrator: listener acquisition, readiness, upgrades and
//! exit notification for one generation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{self, ChildControl, ControlMessage, ParentControl};
use crate::error::{Result, UpgradeError};
use crate::fds::{Fds, Listener};
use crate::fdset::InheritedFds;
use crate::handoff::{self, UpgradeEvent, UpgradeState};
use crate::pidfile::{PidFile, PID_LOCK_NAME};
use crate::spawn::{ProcessSpawner, SpawnRequest, Spawner};
use crate::sys;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PARENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upgrader configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Where to record the PID of the live generation. `None` disables it.
    pub pid_file: Option<PathBuf>,
    /// Bound on how long a child may take to become ready. `None` waits
    /// forever.
    pub upgrade_timeout: Option<Duration>,
    /// How long after `Exit` fires before a warning is logged that this
    /// generation is still around. Nothing is killed.
    pub drain_timeout: Duration,
    /// How often [`Upgrader::wait_for_parent`] checks on the parent.
    pub parent_poll_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pid_file: None,
            upgrade_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            parent_poll_interval: DEFAULT_PARENT_POLL_INTERVAL,
        }
    }
}

impl Options {
    /// Read options from `MOULT_PID_FILE`, `MOULT_UPGRADE_TIMEOUT_SECS` and
    /// `MOULT_DRAIN_TIMEOUT_SECS`. Unset variables keep their defaults; an
    /// upgrade timeout of 0 means no timeout.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Ok(path) = std::env::var("MOULT_PID_FILE") {
            if !path.is_empty() {
                options.pid_file = Some(PathBuf::from(path));
            }
        }
        if let Some(timeout) = env_secs("MOULT_UPGRADE_TIMEOUT_SECS")? {
            options.upgrade_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(timeout) = env_secs("MOULT_DRAIN_TIMEOUT_SECS")? {
            options.drain_timeout = timeout;
        }

        Ok(options)
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = Some(timeout);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| {
                UpgradeError::config(format!("{key} must be a number of seconds, got {raw:?}"))
            }),
        Err(_) => Ok(None),
    }
}

/// Reference to the generation that spawned this one. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub pid: u32,
}

impl ParentLink {
    /// Whether the parent is gone. An orphaned process is reparented, so a
    /// changed parent PID means the original parent exited.
    pub fn has_exited(&self) -> bool {
        sys::parent_pid() != self.pid
    }
}

/// Identity of the running generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub pid: u32,
    /// 0 for a fresh start, parent's number + 1 for an upgrade child.
    pub number: u64,
    pub parent: Option<ParentLink>,
}

struct Inner {
    generation: Generation,
    options: Options,
    fds: Fds,
    pid_file: Mutex<PidFile>,
    /// Our end of the parent's control channel, until readiness is reported.
    control: Mutex<Option<ChildControl>>,
    ready: Mutex<bool>,
    state: Mutex<UpgradeState>,
    stopped: AtomicBool,
    exit: CancellationToken,
    spawner: Box<dyn Spawner>,
}

/// Coordinates one generation of a zero-downtime upgradable process.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Upgrader {
    /// Set up the current generation: adopt descriptors passed by a parent
    /// (if any) and take the PID file lock. Upgrades re-execute the running
    /// binary with its original arguments.
    pub fn new(options: Options) -> Result<Self> {
        let inherited = InheritedFds::from_env()?;
        let spawner = ProcessSpawner::current()?;
        Self::with_spawner(options, inherited, spawner)
    }

    /// Like [`Upgrader::new`] with explicit inherited descriptors and a custom
    /// way of starting children.
    pub fn with_spawner(
        options: Options,
        inherited: Option<InheritedFds>,
        spawner: impl Spawner,
    ) -> Result<Self> {
        let pid = std::process::id();

        let (generation, control, mut files) = match inherited {
            Some(InheritedFds {
                env,
                control,
                files,
            }) => (
                Generation {
                    pid,
                    number: env.generation,
                    parent: Some(ParentLink {
                        pid: env.parent_pid,
                    }),
                },
                Some(ChildControl::new(control)?),
                files,
            ),
            None => (
                Generation {
                    pid,
                    number: 0,
                    parent: None,
                },
                None,
                HashMap::new(),
            ),
        };

        let inherited_lock = files.remove(PID_LOCK_NAME);
        let pid_file = match (options.pid_file.as_deref(), inherited_lock) {
            (Some(path), Some(lock)) if !path.as_os_str().is_empty() => {
                PidFile::inherit(path, lock)
            }
            (Some(path), _) => PidFile::acquire(path),
            (None, _) => Ok(PidFile::disabled()),
        };
        let pid_file = match pid_file {
            Ok(pid_file) => pid_file,
            Err(err) => {
                if let Some(control) = control {
                    control.report_failure(&err);
                }
                return Err(err);
            }
        };

        match generation.parent {
            Some(parent) => info!(
                pid,
                generation = generation.number,
                parent_pid = parent.pid,
                inherited = files.len(),
                "Starting upgraded generation"
            ),
            None => info!(pid, "Starting first generation"),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                generation,
                fds: Fds::new(files),
                pid_file: Mutex::new(pid_file),
                control: Mutex::new(control),
                ready: Mutex::new(false),
                state: Mutex::new(UpgradeState::Idle),
                stopped: AtomicBool::new(false),
                exit: CancellationToken::new(),
                spawner: Box::new(spawner),
                options,
            }),
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            Err(UpgradeError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Get a listener for `protocol`/`address`, inherited from the parent if
    /// it passed one, freshly bound otherwise.
    pub fn listen(&self, protocol: &str, address: &str) -> Result<Listener> {
        self.check_running()?;
        let (listener, _) = self.inner.fds.listen(protocol, address)?;
        Ok(listener)
    }

    /// [`Upgrader::listen`] for TCP, converted for use with tokio.
    pub fn listen_tcp(&self, address: &str) -> Result<tokio::net::TcpListener> {
        Ok(self.listen("tcp", address)?.into_tokio_tcp()?)
    }

    /// [`Upgrader::listen`] for a Unix socket path, converted for use with tokio.
    pub fn listen_unix(&self, path: impl AsRef<Path>) -> Result<tokio::net::UnixListener> {
        let path = path.as_ref();
        let address = path
            .to_str()
            .ok_or_else(|| UpgradeError::config(format!("non UTF-8 socket path {path:?}")))?;
        Ok(self.listen("unix", address)?.into_tokio_unix()?)
    }

    /// The descriptor registry, for files and lookups without binding.
    pub fn fds(&self) -> &Fds {
        &self.inner.fds
    }

    /// Mark this generation ready: close inherited descriptors nobody claimed,
    /// write the PID file and tell the parent (if any) that the handoff can
    /// complete. Calling it again is a no-op.
    pub fn ready(&self) -> Result<()> {
        self.check_running()?;

        let mut ready = lock(&self.inner.ready);
        if *ready {
            debug!("Already ready");
            return Ok(());
        }

        let closed = self.inner.fds.close_inherited();
        if closed > 0 {
            debug!(count = closed, "Closed unused inherited descriptors");
        }

        let pid = self.inner.generation.pid;
        lock(&self.inner.pid_file).write(pid)?;

        if let Some(control) = lock(&self.inner.control).take() {
            match control.send(&ControlMessage::Ready { pid }) {
                Ok(()) => debug!("Reported readiness to parent"),
                Err(err) => warn!(error = %err, "Failed to report readiness to parent"),
            }
        }

        *ready = true;
        info!(
            pid,
            generation = self.inner.generation.number,
            "Generation ready"
        );
        Ok(())
    }

    /// Hand off to a new generation.
    ///
    /// Returns once the child reported readiness, after which [`Upgrader::exit`]
    /// fires, or once the attempt failed, in which case this generation carries
    /// on unchanged. Dropping the returned future does not abort an attempt
    /// that is already running.
    pub async fn upgrade(&self) -> Result<()> {
        self.check_running()?;

        if let Some(parent) = self.inner.generation.parent {
            if !parent.has_exited() {
                return Err(UpgradeError::ParentNotExited { pid: parent.pid });
            }
        }

        self.transition(UpgradeEvent::Requested)?;
        info!(pid = self.inner.generation.pid, "Upgrade requested");

        let this = self.clone();
        match tokio::spawn(async move { this.run_upgrade().await }).await {
            Ok(result) => result,
            Err(join_err) => {
                let err = UpgradeError::handoff(format!("upgrade task failed: {join_err}"));
                self.abandon(&err);
                Err(err)
            }
        }
    }

    async fn run_upgrade(&self) -> Result<()> {
        match self.spawn_and_wait().await {
            Ok(child_pid) => {
                self.transition(UpgradeEvent::ChildReady)?;
                info!(child_pid, "Upgrade completed, this generation should exit");
                self.inner.exit.cancel();
                self.remind_after_drain_timeout();
                Ok(())
            }
            Err(err) => {
                self.abandon(&err);
                error!(error = %err, "Upgrade failed, continuing with the current generation");
                Err(err)
            }
        }
    }

    async fn spawn_and_wait(&self) -> Result<u32> {
        let mut set = self.inner.fds.freeze()?;
        let lock_fd = lock(&self.inner.pid_file).lock_fd()?;
        if let Some(lock_fd) = lock_fd {
            set.push(PID_LOCK_NAME, lock_fd)?;
        }

        let generation = &self.inner.generation;
        let (env, files) = set.into_parts(generation.number + 1, generation.pid)?;
        debug!(names = ?env.names().collect::<Vec<_>>(), "Passing descriptors to child");

        let (parent_end, child_end) = control::channel()?;
        let control = ParentControl::new(parent_end)?;

        let child = self
            .inner
            .spawner
            .spawn(SpawnRequest {
                env,
                control: child_end,
                files,
            })
            .map_err(UpgradeError::Spawn)?;
        let child_pid = child.pid;
        self.transition(UpgradeEvent::Spawned { child_pid })?;
        info!(child_pid, "Waiting for child to become ready");

        handoff::await_readiness(control, child, self.inner.options.upgrade_timeout).await
    }

    fn transition(&self, event: UpgradeEvent) -> Result<UpgradeState> {
        let mut state = lock(&self.inner.state);
        let current = *state;
        let next = current.on(event)?;
        debug!(from = %current, to = %next, "Upgrade state change");
        *state = next;
        Ok(next)
    }

    /// Record a failed attempt and return to `Idle`.
    fn abandon(&self, err: &UpgradeError) {
        {
            let mut state = lock(&self.inner.state);
            let event = match *state {
                UpgradeState::Upgrading => UpgradeEvent::SpawnFailed,
                _ => handoff::failure_event(err),
            };
            let failed = state.on(event).unwrap_or(UpgradeState::Failed);
            *state = failed.on(UpgradeEvent::Reset).unwrap_or(UpgradeState::Idle);
        }
        self.inner.fds.thaw();
    }

    fn remind_after_drain_timeout(&self) {
        let timeout = self.inner.options.drain_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(
                timeout_secs = timeout.as_secs(),
                "Drain timeout elapsed and this generation is still running"
            );
        });
    }

    /// Resolves once this generation should shut down: after a successful
    /// upgrade or [`Upgrader::stop`].
    pub async fn exit(&self) {
        self.inner.exit.cancelled().await
    }

    /// A token cancelled together with [`Upgrader::exit`].
    pub fn exit_token(&self) -> CancellationToken {
        self.inner.exit.child_token()
    }

    /// Release the PID file and every held descriptor. Listeners already
    /// handed out stay open. Further operations fail with `Stopped`.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.exit.cancel();
        self.inner.fds.close();
        lock(&self.inner.control).take();
        lock(&self.inner.pid_file).release();
        info!(pid = self.inner.generation.pid, "Upgrader stopped");
    }

    /// Resolves once the parent generation has exited. Returns immediately
    /// for a first generation.
    pub async fn wait_for_parent(&self) {
        let Some(parent) = self.inner.generation.parent else {
            return;
        };
        let mut ticks = tokio::time::interval(self.inner.options.parent_poll_interval);
        loop {
            ticks.tick().await;
            if parent.has_exited() {
                info!(parent_pid = parent.pid, "Parent generation exited");
                return;
            }
        }
    }

    pub fn generation(&self) -> Generation {
        self.inner.generation
    }

    /// Whether this generation was started by an upgrade.
    pub fn has_parent(&self) -> bool {
        self.inner.generation.parent.is_some()
    }

    pub fn state(&self) -> UpgradeState {
        *lock(&self.inner.state)
    }

    pub fn is_ready(&self) -> bool {
        *lock(&self.inner.ready)
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdset::HandoffEnv;
    use crate::pidfile;
    use crate::testing::{ExitEarly, Hang, InProcessChild, Refuse, ReportFailure};
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn first_generation(options: Options, spawner: impl Spawner) -> Upgrader {
        Upgrader::with_spawner(options, None, spawner).unwrap()
    }

    async fn wait_until_in_flight(upgrader: &Upgrader) {
        for _ in 0..200 {
            if upgrader.state().is_in_flight() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("upgrade never started");
    }

    #[test]
    fn test_options_from_env() {
        std::env::set_var("MOULT_PID_FILE", "/tmp/moult-options.pid");
        std::env::set_var("MOULT_UPGRADE_TIMEOUT_SECS", "0");
        std::env::set_var("MOULT_DRAIN_TIMEOUT_SECS", "5");
        let options = Options::from_env().unwrap();
        assert_eq!(
            options.pid_file.as_deref(),
            Some(Path::new("/tmp/moult-options.pid"))
        );
        assert_eq!(options.upgrade_timeout, None);
        assert_eq!(options.drain_timeout, Duration::from_secs(5));

        std::env::set_var("MOULT_DRAIN_TIMEOUT_SECS", "soon");
        assert!(matches!(Options::from_env(), Err(UpgradeError::Config(_))));

        std::env::remove_var("MOULT_PID_FILE");
        std::env::remove_var("MOULT_UPGRADE_TIMEOUT_SECS");
        std::env::remove_var("MOULT_DRAIN_TIMEOUT_SECS");
    }

    #[tokio::test]
    async fn test_successful_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let options = Options::default().with_pid_file(&path);

        let spawner = InProcessChild::new(options.clone(), &["127.0.0.1:0"]);
        let upgrader = first_generation(options, spawner.clone());
        upgrader.listen("tcp", "127.0.0.1:0").unwrap();
        upgrader.ready().unwrap();

        upgrader.upgrade().await.unwrap();

        assert!(upgrader.exit_token().is_cancelled());
        assert!(matches!(upgrader.state(), UpgradeState::Completed { .. }));
        assert_eq!(pidfile::read(&path).unwrap(), Some(std::process::id()));

        let children = spawner.children();
        assert_eq!(children.len(), 1);
        let (child, inherited) = &children[0];
        assert_eq!(inherited, &vec![true], "child must not rebind");
        assert!(child.is_ready());
        assert_eq!(child.generation().number, 1);
        assert!(child.has_parent());
    }

    #[tokio::test]
    async fn test_upgrade_after_completion_is_refused() {
        let spawner = InProcessChild::new(Options::default(), &[]);
        let upgrader = first_generation(Options::default(), spawner.clone());
        upgrader.ready().unwrap();
        upgrader.upgrade().await.unwrap();

        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::AlreadyUpgraded)
        ));
        assert_eq!(spawner.children().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let upgrader = first_generation(Options::default().with_pid_file(&path), Refuse);

        upgrader.ready().unwrap();
        assert_eq!(pidfile::read(&path).unwrap(), Some(std::process::id()));

        // A second call must not touch the file again.
        std::fs::write(&path, "untouched\n").unwrap();
        upgrader.ready().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "untouched\n");
        assert!(upgrader.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_upgrade_is_rejected() {
        let spawner = Hang::default();
        let upgrader = first_generation(
            Options::default().with_upgrade_timeout(Duration::from_millis(300)),
            spawner.clone(),
        );
        upgrader.ready().unwrap();

        let first = tokio::spawn({
            let upgrader = upgrader.clone();
            async move { upgrader.upgrade().await }
        });
        wait_until_in_flight(&upgrader).await;

        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::UpgradeInProgress)
        ));
        assert!(matches!(
            first.await.unwrap(),
            Err(UpgradeError::ChildTimeout { .. })
        ));
        assert_eq!(spawner.spawned(), 1);
        assert_eq!(upgrader.state(), UpgradeState::Idle);
        assert!(!upgrader.exit_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_child_exiting_early_keeps_parent_live() {
        let spawner = ExitEarly::default();
        let upgrader = first_generation(Options::default(), spawner.clone());
        upgrader.listen("tcp", "127.0.0.1:0").unwrap();
        upgrader.ready().unwrap();

        match upgrader.upgrade().await {
            Err(UpgradeError::ChildExitedEarly { status, .. }) => {
                assert_eq!(status, "exit code 7");
            }
            other => panic!("expected ChildExitedEarly, got {other:?}"),
        }
        assert!(!upgrader.exit_token().is_cancelled());
        assert_eq!(upgrader.state(), UpgradeState::Idle);

        // The parent can try again.
        assert!(upgrader.upgrade().await.is_err());
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test]
    async fn test_child_reported_failure() {
        let upgrader = first_generation(Options::default(), ReportFailure);
        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::ChildFailed { .. })
        ));
        assert_eq!(upgrader.state(), UpgradeState::Idle);
    }

    #[tokio::test]
    async fn test_listen_during_upgrade_is_too_late() {
        let upgrader = first_generation(
            Options::default().with_upgrade_timeout(Duration::from_millis(200)),
            Hang::default(),
        );
        upgrader.listen("tcp", "127.0.0.1:0").unwrap();

        let attempt = tokio::spawn({
            let upgrader = upgrader.clone();
            async move { upgrader.upgrade().await }
        });
        wait_until_in_flight(&upgrader).await;

        assert!(upgrader.listen("tcp", "127.0.0.1:0").is_ok());
        assert!(matches!(
            upgrader.listen("tcp4", "127.0.0.1:0"),
            Err(UpgradeError::TooLate { .. })
        ));

        assert!(attempt.await.unwrap().is_err());
        assert!(upgrader.listen("tcp4", "127.0.0.1:0").is_ok());
    }

    #[tokio::test]
    async fn test_unix_listener_through_upgrader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        let upgrader = first_generation(Options::default(), Refuse);

        let _listener = upgrader.listen_unix(&path).unwrap();
        assert_eq!(
            upgrader.fds().names(),
            vec![format!("unix:{}", path.display())]
        );
    }

    #[tokio::test]
    async fn test_spawn_error_returns_to_idle() {
        let upgrader = first_generation(Options::default(), Refuse);
        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::Spawn(_))
        ));
        assert_eq!(upgrader.state(), UpgradeState::Idle);
    }

    #[tokio::test]
    async fn test_stop_refuses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let upgrader = first_generation(Options::default().with_pid_file(&path), Refuse);
        upgrader.ready().unwrap();

        upgrader.stop();
        upgrader.exit().await;
        assert_eq!(pidfile::read(&path).unwrap(), None);

        assert!(matches!(
            upgrader.listen("tcp", "127.0.0.1:0"),
            Err(UpgradeError::Stopped)
        ));
        assert!(matches!(upgrader.ready(), Err(UpgradeError::Stopped)));
        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_child_waits_for_parent_before_upgrading() {
        let (control, _parent_end) = UnixStream::pair().unwrap();
        // Our real parent is certainly still running.
        let env = HandoffEnv::new(1, sys::parent_pid(), Vec::new());
        let inherited = InheritedFds::from_parts(env, OwnedFd::from(control), Vec::new()).unwrap();

        let upgrader = Upgrader::with_spawner(Options::default(), Some(inherited), Refuse).unwrap();
        assert!(upgrader.has_parent());
        assert!(matches!(
            upgrader.upgrade().await,
            Err(UpgradeError::ParentNotExited { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_generation_has_no_parent_to_wait_for() {
        let upgrader = first_generation(Options::default(), Refuse);
        assert!(!upgrader.has_parent());
        assert_eq!(upgrader.generation().number, 0);
        tokio::time::timeout(Duration::from_secs(1), upgrader.wait_for_parent())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pid_file_conflict_is_reported_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let _holder = PidFile::acquire(&path).unwrap();

        let (control, parent_end) = UnixStream::pair().unwrap();
        let env = HandoffEnv::new(1, std::process::id(), Vec::new());
        let inherited = InheritedFds::from_parts(env, OwnedFd::from(control), Vec::new()).unwrap();

        let result =
            Upgrader::with_spawner(Options::default().with_pid_file(&path), Some(inherited), Refuse);
        assert!(matches!(result, Err(UpgradeError::AlreadyRunning { .. })));

        let mut parent = ParentControl::new(parent_end).unwrap();
        assert!(matches!(
            parent.recv().await,
            Some(Ok(ControlMessage::Failed { .. }))
        ));
    }
}
