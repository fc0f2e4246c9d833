//! Descriptor handoff encoding.
//!
//! The parent hands its child a [`FileDescriptorSet`]: an ordered list of
//! named descriptors. The descriptors land in the child's file table at fixed
//! slots and their names travel in the `MOULT_HANDOFF` environment variable:
//!
//! - fd 3: the child's end of the control channel
//! - fd 4 + i: the descriptor described by `fds[i]`
//!
//! Each entry also records the device and inode of the descriptor the parent
//! passed, so the child never claims an unrelated descriptor that happens to
//! occupy a slot. The child rebuilds the exact name → descriptor mapping from
//! the variable alone, with no further negotiation.

use std::collections::HashMap;
use std::os::unix::io::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::ChildControl;
use crate::error::{Result, UpgradeError};
use crate::sys;

/// Environment variable carrying the [`HandoffEnv`]. Present only in upgrade
/// children.
pub const HANDOFF_ENV: &str = "MOULT_HANDOFF";

/// Slot of the child's control channel end.
pub const CONTROL_SLOT: RawFd = 3;

/// Slot of the first named descriptor.
pub const FIRST_SLOT: RawFd = 4;

const VERSION: u32 = 1;

/// One passed descriptor: its name and the identity of the object behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassedFd {
    pub name: String,
    pub dev: u64,
    pub ino: u64,
}

impl PassedFd {
    /// Describe `fd` under `name`.
    pub fn describe(name: impl Into<String>, fd: BorrowedFd<'_>) -> Result<Self> {
        let (dev, ino) = sys::identity(fd)?;
        Ok(Self {
            name: name.into(),
            dev,
            ino,
        })
    }

    /// Whether `fd` refers to the object this entry was taken from.
    pub fn matches(&self, fd: BorrowedFd<'_>) -> bool {
        sys::identity(fd).is_ok_and(|id| id == (self.dev, self.ino))
    }
}

/// Metadata the parent passes to its child through the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEnv {
    /// Wire format version.
    pub version: u32,
    /// Generation number of the child (the first process is generation 0).
    pub generation: u64,
    /// PID of the parent generation.
    pub parent_pid: u32,
    /// Passed descriptors, in slot order starting at [`FIRST_SLOT`].
    pub fds: Vec<PassedFd>,
}

impl HandoffEnv {
    /// Describe a child of `parent_pid` receiving `fds`.
    pub fn new(generation: u64, parent_pid: u32, fds: Vec<PassedFd>) -> Self {
        Self {
            version: VERSION,
            generation,
            parent_pid,
            fds,
        }
    }

    /// Serialize for the environment.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| UpgradeError::handoff(format!("failed to encode {HANDOFF_ENV}: {e}")))
    }

    /// Parse and validate an encoded marker.
    pub fn decode(raw: &str) -> Result<Self> {
        let env: HandoffEnv = serde_json::from_str(raw)
            .map_err(|e| UpgradeError::handoff(format!("malformed {HANDOFF_ENV}: {e}")))?;

        if env.version != VERSION {
            return Err(UpgradeError::handoff(format!(
                "unsupported {HANDOFF_ENV} version {} (expected {VERSION})",
                env.version
            )));
        }

        let mut seen = std::collections::HashSet::with_capacity(env.fds.len());
        for name in env.names() {
            if name.is_empty() {
                return Err(UpgradeError::handoff("empty descriptor name"));
            }
            if !seen.insert(name) {
                return Err(UpgradeError::handoff(format!(
                    "duplicate descriptor name {name}"
                )));
            }
        }

        Ok(env)
    }

    /// Descriptor names in slot order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.fds.iter().map(|fd| fd.name.as_str())
    }

    /// Every passed descriptor with its slot, in order.
    pub fn slots(&self) -> impl Iterator<Item = (&PassedFd, RawFd)> + '_ {
        self.fds
            .iter()
            .enumerate()
            .map(|(i, fd)| (fd, FIRST_SLOT + i as RawFd))
    }
}

/// An ordered set of named descriptors about to be handed to a child.
#[derive(Debug, Default)]
pub struct FileDescriptorSet {
    entries: Vec<(String, OwnedFd)>,
}

impl FileDescriptorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor. Names must be unique within the set.
    pub fn push(&mut self, name: impl Into<String>, fd: OwnedFd) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(UpgradeError::handoff(format!(
                "duplicate descriptor name {name}"
            )));
        }
        self.entries.push((name, fd));
        Ok(())
    }

    /// Names in slot order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the environment marker for a child of `parent_pid`.
    pub fn describe(&self, generation: u64, parent_pid: u32) -> Result<HandoffEnv> {
        let fds = self
            .entries
            .iter()
            .map(|(name, fd)| PassedFd::describe(name.as_str(), fd.as_fd()))
            .collect::<Result<Vec<_>>>()?;
        Ok(HandoffEnv::new(generation, parent_pid, fds))
    }

    /// Split into the marker and the descriptors in slot order.
    pub fn into_parts(
        self,
        generation: u64,
        parent_pid: u32,
    ) -> Result<(HandoffEnv, Vec<OwnedFd>)> {
        let env = self.describe(generation, parent_pid)?;
        let fds = self.entries.into_iter().map(|(_, fd)| fd).collect();
        Ok((env, fds))
    }
}

/// Descriptors a child generation received from its parent.
#[derive(Debug)]
pub struct InheritedFds {
    /// The decoded marker.
    pub env: HandoffEnv,
    /// Child end of the control channel.
    pub control: OwnedFd,
    /// Named descriptors.
    pub files: HashMap<String, OwnedFd>,
}

impl InheritedFds {
    /// Adopt the descriptors described by `MOULT_HANDOFF`.
    ///
    /// Returns `Ok(None)` on a fresh start. The variable is removed from the
    /// environment so further children of this process never mistake
    /// themselves for upgrade children. If the marker is unusable the failure
    /// is reported to the parent over the control slot before returning.
    ///
    /// A slot is only claimed once it is known to hold the descriptor the
    /// parent passed; anything else found there is left untouched.
    pub fn from_env() -> Result<Option<Self>> {
        let raw = match std::env::var(HANDOFF_ENV) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        std::env::remove_var(HANDOFF_ENV);

        let env = match HandoffEnv::decode(&raw) {
            Ok(env) => env,
            Err(err) => {
                if let Ok(control) = adopt_control() {
                    report_to_parent(control, &err);
                }
                return Err(err);
            }
        };

        let control = adopt_control()?;
        match adopt_named(&env) {
            Ok(files) => Ok(Some(Self {
                env,
                control,
                files,
            })),
            Err(err) => {
                report_to_parent(control, &err);
                Err(err)
            }
        }
    }

    /// Build from descriptors that were passed by some other means, with
    /// `files` in slot order.
    pub fn from_parts(env: HandoffEnv, control: OwnedFd, files: Vec<OwnedFd>) -> Result<Self> {
        if env.fds.len() != files.len() {
            return Err(UpgradeError::handoff(format!(
                "{HANDOFF_ENV} names {} descriptors but {} were passed",
                env.fds.len(),
                files.len()
            )));
        }
        if let Some(passed) = env.fds.iter().zip(&files).find_map(|(passed, fd)| {
            (!passed.matches(fd.as_fd())).then_some(passed)
        }) {
            return Err(UpgradeError::handoff(format!(
                "descriptor {} does not match {HANDOFF_ENV}",
                passed.name
            )));
        }
        let files = env.names().map(str::to_string).zip(files).collect();
        Ok(Self {
            env,
            control,
            files,
        })
    }
}

fn adopt_named(env: &HandoffEnv) -> Result<HashMap<String, OwnedFd>> {
    let mut files = HashMap::with_capacity(env.fds.len());
    for (passed, slot) in env.slots() {
        let fd = adopt(slot, passed)?;
        debug!(fd = slot, name = %passed.name, "Adopted inherited descriptor");
        files.insert(passed.name.clone(), fd);
    }
    Ok(files)
}

fn adopt_control() -> Result<OwnedFd> {
    let fd = borrow_slot(CONTROL_SLOT, "control channel")?;
    if !sys::is_socket(fd) {
        return Err(UpgradeError::handoff(format!(
            "inherited fd {CONTROL_SLOT} (control channel) is not a socket"
        )));
    }
    claim(CONTROL_SLOT)
}

fn adopt(slot: RawFd, passed: &PassedFd) -> Result<OwnedFd> {
    let fd = borrow_slot(slot, &passed.name)?;
    if !passed.matches(fd) {
        return Err(UpgradeError::handoff(format!(
            "inherited fd {slot} ({}) is not the descriptor the parent passed",
            passed.name
        )));
    }
    claim(slot)
}

fn borrow_slot(slot: RawFd, name: &str) -> Result<BorrowedFd<'static>> {
    if !sys::is_open(slot) {
        return Err(UpgradeError::handoff(format!(
            "inherited fd {slot} ({name}) is not open"
        )));
    }
    // SAFETY: the slot is open; the borrow is only used to inspect it before
    // the slot is claimed.
    Ok(unsafe { BorrowedFd::borrow_raw(slot) })
}

fn claim(slot: RawFd) -> Result<OwnedFd> {
    // SAFETY: the slot holds the descriptor the parent placed there for us;
    // nothing else in this process claims it.
    let fd = unsafe { OwnedFd::from_raw_fd(slot) };
    sys::set_cloexec(fd.as_fd())?;
    Ok(fd)
}

fn report_to_parent(control: OwnedFd, err: &UpgradeError) {
    match ChildControl::new(control) {
        Ok(control) => control.report_failure(err),
        Err(open_err) => {
            warn!(error = %open_err, "Control channel unusable, cannot report failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    fn passed(name: &str, dev: u64, ino: u64) -> PassedFd {
        PassedFd {
            name: name.to_string(),
            dev,
            ino,
        }
    }

    #[test]
    fn test_marker_describes_contiguous_slots() {
        let env = HandoffEnv::new(
            2,
            1234,
            vec![
                passed("tcp:127.0.0.1:9000", 1, 10),
                passed("unix:/tmp/app.sock", 1, 11),
            ],
        );
        let decoded = HandoffEnv::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);

        let slots: Vec<_> = decoded
            .slots()
            .map(|(fd, slot)| (fd.name.as_str(), slot))
            .collect();
        assert_eq!(
            slots,
            vec![("tcp:127.0.0.1:9000", 4), ("unix:/tmp/app.sock", 5)]
        );
    }

    #[test]
    fn test_decode_rejects_duplicates() {
        let raw = r#"{"version":1,"generation":1,"parent_pid":1,"fds":[
            {"name":"a","dev":1,"ino":1},{"name":"a","dev":1,"ino":2}]}"#;
        let err = HandoffEnv::decode(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate descriptor name a"));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let raw = r#"{"version":7,"generation":1,"parent_pid":1,"fds":[]}"#;
        assert!(matches!(
            HandoffEnv::decode(raw),
            Err(UpgradeError::Handoff(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(HandoffEnv::decode("LISTEN_FDS=3").is_err());
        // Names without identities are not a valid marker.
        let raw = r#"{"version":1,"generation":1,"parent_pid":1,"fds":["a"]}"#;
        assert!(HandoffEnv::decode(raw).is_err());
    }

    #[test]
    fn test_set_rejects_duplicate_names() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut set = FileDescriptorSet::new();
        set.push("tcp:127.0.0.1:1", OwnedFd::from(a)).unwrap();
        assert!(set.push("tcp:127.0.0.1:1", OwnedFd::from(b)).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_describe_records_identities() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let expected = sys::identity(listener.as_fd()).unwrap();

        let mut set = FileDescriptorSet::new();
        set.push("tcp:127.0.0.1:0", OwnedFd::from(listener)).unwrap();
        let env = set.describe(3, 42).unwrap();

        assert_eq!(env.generation, 3);
        assert_eq!(env.parent_pid, 42);
        assert_eq!(env.fds.len(), 1);
        assert_eq!((env.fds[0].dev, env.fds[0].ino), expected);
    }

    #[test]
    fn test_from_parts_maps_names_in_order() {
        let (control, _peer) = UnixStream::pair().unwrap();
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second_addr = second.local_addr().unwrap();

        let mut set = FileDescriptorSet::new();
        set.push("first", OwnedFd::from(first)).unwrap();
        set.push("second", OwnedFd::from(second)).unwrap();
        let (env, fds) = set.into_parts(1, std::process::id()).unwrap();

        let mut inherited = InheritedFds::from_parts(env, OwnedFd::from(control), fds).unwrap();
        let second = std::net::TcpListener::from(inherited.files.remove("second").unwrap());
        assert_eq!(second.local_addr().unwrap(), second_addr);
    }

    #[test]
    fn test_from_parts_rejects_count_mismatch() {
        let (control, _peer) = UnixStream::pair().unwrap();
        let env = HandoffEnv::new(1, 1, vec![passed("missing", 1, 1)]);
        assert!(InheritedFds::from_parts(env, OwnedFd::from(control), Vec::new()).is_err());
    }

    #[test]
    fn test_from_parts_rejects_swapped_descriptors() {
        let (control, _peer) = UnixStream::pair().unwrap();
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut set = FileDescriptorSet::new();
        set.push("first", OwnedFd::from(first)).unwrap();
        set.push("second", OwnedFd::from(second)).unwrap();
        let (env, mut fds) = set.into_parts(1, std::process::id()).unwrap();
        fds.reverse();

        let err = InheritedFds::from_parts(env, OwnedFd::from(control), fds).unwrap_err();
        assert!(err.to_string().contains("descriptor first does not match"));
    }

    #[test]
    fn test_adopt_rejects_closed_slot() {
        let err = adopt(9999, &passed("tcp:127.0.0.1:1", 1, 1)).unwrap_err();
        assert!(err.to_string().contains("inherited fd 9999 (tcp:127.0.0.1:1) is not open"));
    }

    #[test]
    fn test_adopt_leaves_foreign_descriptor_open() {
        let expected = tempfile::tempfile().unwrap();
        let occupant = tempfile::tempfile().unwrap();
        let entry = PassedFd::describe("state", expected.as_fd()).unwrap();

        let slot = occupant.as_raw_fd();
        let err = adopt(slot, &entry).unwrap_err();
        assert!(err.to_string().contains("is not the descriptor the parent passed"));
        assert!(sys::is_open(slot), "a rejected slot must not be closed");
    }

    #[test]
    fn test_adopt_claims_matching_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let entry = PassedFd::describe("state", file.as_fd()).unwrap();
        let slot = file.into_raw_fd();

        let adopted = adopt(slot, &entry).unwrap();
        assert_eq!(adopted.as_raw_fd(), slot);
        let flags = unsafe { libc::fcntl(slot, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_cold_start_returns_none() {
        std::env::remove_var(HANDOFF_ENV);
        assert!(InheritedFds::from_env().unwrap().is_none());
    }
}
