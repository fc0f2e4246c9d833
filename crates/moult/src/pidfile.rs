//! PID file tracking the live generation.
//!
//! The PID file itself is only ever replaced atomically (write to a temp file
//! in the same directory, then rename), so readers see either the old or the
//! new PID and never a partial write. Exclusivity comes from an `flock` on a
//! sibling `<path>.lock` file. The kernel drops that lock when its last holder
//! exits, so a crashed generation never leaves a stale lock behind.
//!
//! During an upgrade the lock descriptor is handed to the child along with the
//! listeners (under [`PID_LOCK_NAME`]), so the lock is shared by both
//! generations and survives the parent's exit. Since both generations hold the
//! same lock, writes and the release check-and-remove are serialized through a
//! second, short-lived `flock` on `<path>.update` that each operation opens
//! afresh.

use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, UpgradeError};
use crate::sys;

/// Descriptor name under which the lock travels to a child.
pub const PID_LOCK_NAME: &str = "moult:pid-lock";

/// Handle on the PID file. A disabled handle (empty path) does nothing.
#[derive(Debug)]
pub struct PidFile {
    locked: Option<Locked>,
}

#[derive(Debug)]
struct Locked {
    path: PathBuf,
    lock: File,
    written: Option<Written>,
}

/// What this generation last put at the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Written {
    pid: u32,
    dev: u64,
    ino: u64,
}

impl PidFile {
    /// A PID file handle that never touches the disk.
    pub fn disabled() -> Self {
        Self { locked: None }
    }

    /// Take the exclusive lock guarding `path`.
    ///
    /// An empty path disables PID file support. Fails with `AlreadyRunning`
    /// if a live process holds the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Ok(Self::disabled());
        }

        let lock_path = lock_path(path);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&lock_path)
            .map_err(|source| UpgradeError::PidFile {
                path: lock_path.clone(),
                source,
            })?;

        Self::lock(path, lock)
    }

    /// Adopt a lock descriptor inherited from the parent generation.
    pub fn inherit(path: impl AsRef<Path>, lock: OwnedFd) -> Result<Self> {
        Self::lock(path.as_ref(), File::from(lock))
    }

    fn lock(path: &Path, lock: File) -> Result<Self> {
        let acquired =
            sys::try_lock_exclusive(lock.as_fd()).map_err(|source| UpgradeError::PidFile {
                path: lock_path(path),
                source,
            })?;

        if !acquired {
            let pid = read(path).ok().flatten();
            return Err(UpgradeError::AlreadyRunning { pid });
        }

        if let Ok(Some(previous)) = read(path) {
            if previous != std::process::id() && !sys::process_alive(previous) {
                info!(pid = previous, path = %path.display(), "Reclaiming stale PID file");
            }
        }

        debug!(path = %path.display(), "Acquired PID file lock");
        Ok(Self {
            locked: Some(Locked {
                path: path.to_path_buf(),
                lock,
                written: None,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.locked.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.locked.as_ref().map(|l| l.path.as_path())
    }

    /// Atomically replace the PID file's content with `pid`.
    pub fn write(&mut self, pid: u32) -> Result<()> {
        let Some(locked) = self.locked.as_mut() else {
            return Ok(());
        };

        let written = write_locked(&locked.path, pid).map_err(|source| UpgradeError::PidFile {
            path: locked.path.clone(),
            source,
        })?;
        locked.written = Some(written);

        info!(pid, path = %locked.path.display(), "Wrote PID file");
        Ok(())
    }

    /// Duplicate of the lock descriptor, for handing to a child generation.
    pub fn lock_fd(&self) -> Result<Option<OwnedFd>> {
        match self.locked.as_ref() {
            Some(locked) => Ok(Some(locked.lock.try_clone()?.into())),
            None => Ok(None),
        }
    }

    /// Drop the lock and remove the PID file if it is still the one this
    /// generation wrote.
    ///
    /// A successor always replaces the file with a new inode, so a file with
    /// the inode we wrote is ours even if the successor has the same PID. The
    /// check and the removal happen under the update lock, so a successor's
    /// write lands either before the check or after the removal.
    ///
    /// The lock is never explicitly unlocked: a child generation may share it,
    /// and closing our descriptor only releases it once nobody else holds it.
    pub fn release(&mut self) {
        let Some(locked) = self.locked.take() else {
            return;
        };
        let Some(written) = locked.written else {
            return;
        };

        match remove_if_written(&locked.path, written) {
            Ok(true) => debug!(path = %locked.path.display(), "Removed PID file"),
            Ok(false) => {
                debug!(path = %locked.path.display(), "PID file belongs to another generation, leaving it");
            }
            Err(err) => {
                warn!(error = %err, path = %locked.path.display(), "Failed to remove PID file");
            }
        }
    }
}

/// Read the PID recorded at `path`. Returns `Ok(None)` if the file is absent.
pub fn read(path: impl AsRef<Path>) -> io::Result<Option<u32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    content
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad PID file: {e}")))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

fn update_lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".update");
    PathBuf::from(lock)
}

/// Exclusive hold on `<path>.update` for the duration of one update.
struct UpdateLock {
    _file: File,
}

impl UpdateLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(update_lock_path(path))?;
        sys::lock_exclusive(file.as_fd())?;
        Ok(Self { _file: file })
    }
}

fn write_locked(path: &Path, pid: u32) -> io::Result<Written> {
    let _update = UpdateLock::acquire(path)?;
    write_atomic(path, pid)?;
    let meta = std::fs::metadata(path)?;
    Ok(Written {
        pid,
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

fn remove_if_written(path: &Path, written: Written) -> io::Result<bool> {
    let _update = UpdateLock::acquire(path)?;
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if (meta.dev(), meta.ino()) != (written.dev, written.ino) {
        return Ok(false);
    }
    if read(path)? != Some(written.pid) {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    Ok(true)
}

fn write_atomic(path: &Path, pid: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".moult-pid")
        .tempfile_in(dir)?;
    writeln!(tmp, "{pid}")?;
    tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
