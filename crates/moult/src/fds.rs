//! Named registry of listening sockets and files.
//!
//! Every listener is registered under `protocol:address` (for example
//! `tcp:127.0.0.1:8080`). On a request the registry first consults the
//! descriptors inherited from the parent generation; only if nothing matches is
//! a fresh socket bound. Inherited sockets are never re-bound, which would
//! either race the parent or fail with "address in use".
//!
//! The registry keeps its own copy of every descriptor it hands out so a future
//! child can inherit it. Callers receive duplicates of the same socket.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::sync::{Mutex, MutexGuard};

use socket2::{Domain, Socket, Type};
use tracing::{debug, info};

use crate::error::{Result, UpgradeError};
use crate::fdset::FileDescriptorSet;
use crate::sys;

const LISTEN_BACKLOG: i32 = 1024;

/// A listening socket handed out by [`Fds::listen`].
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn into_tcp(self) -> Option<TcpListener> {
        match self {
            Listener::Tcp(listener) => Some(listener),
            Listener::Unix(_) => None,
        }
    }

    pub fn into_unix(self) -> Option<UnixListener> {
        match self {
            Listener::Unix(listener) => Some(listener),
            Listener::Tcp(_) => None,
        }
    }

    /// Convert into a tokio TCP listener. Must be called within a runtime.
    pub fn into_tokio_tcp(self) -> io::Result<tokio::net::TcpListener> {
        let listener = self
            .into_tcp()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a TCP listener"))?;
        tokio::net::TcpListener::from_std(listener)
    }

    /// Convert into a tokio Unix listener. Must be called within a runtime.
    pub fn into_tokio_unix(self) -> io::Result<tokio::net::UnixListener> {
        let listener = self
            .into_unix()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a Unix listener"))?;
        tokio::net::UnixListener::from_std(listener)
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    fn parse(protocol: &str) -> Result<Self> {
        match protocol {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            other => Err(UpgradeError::UnsupportedProtocol(other.to_string())),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
            Network::Unix => false,
        }
    }

    /// Pick the address to bind among the resolved ones. Plain `tcp` prefers
    /// IPv4, so `localhost` binds `127.0.0.1` even where `::1` resolves first.
    fn select(self, addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
        let mut accepted = addrs.into_iter().filter(|addr| self.accepts(addr));
        if self != Network::Tcp {
            return accepted.next();
        }
        let mut fallback = None;
        for addr in accepted {
            if addr.is_ipv4() {
                return Some(addr);
            }
            fallback.get_or_insert(addr);
        }
        fallback
    }

    fn bind(self, address: &str) -> io::Result<OwnedFd> {
        if self == Network::Unix {
            let listener = UnixListener::bind(address)?;
            listener.set_nonblocking(true)?;
            return Ok(listener.into());
        }

        let addr = self
            .select(address.to_socket_addrs()?)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no suitable address for {address}"),
                )
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        if self == Network::Tcp6 {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn wrap(self, fd: OwnedFd) -> io::Result<Listener> {
        if !sys::is_socket(fd.as_fd()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor is not a socket",
            ));
        }
        match self {
            Network::Unix => {
                let listener = UnixListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix(listener))
            }
            _ => {
                let listener = TcpListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(Listener::Tcp(listener))
            }
        }
    }
}

/// Logical name of a listener.
pub fn listener_name(protocol: &str, address: &str) -> String {
    format!("{protocol}:{address}")
}

#[derive(Debug)]
struct Entry {
    fd: OwnedFd,
    inherited: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Passed by the parent and not yet claimed.
    inherited: HashMap<String, OwnedFd>,
    /// Claimed or created in this generation; what a child would inherit.
    used: BTreeMap<String, Entry>,
    frozen: bool,
    closed: bool,
}

/// The descriptor registry of one generation.
#[derive(Debug, Default)]
pub struct Fds {
    inner: Mutex<Inner>,
}

impl Fds {
    /// Create a registry seeded with descriptors inherited from a parent.
    pub fn new(inherited: HashMap<String, OwnedFd>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                inherited,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a listener for `protocol`/`address`, inheriting it if the parent
    /// passed one under that name and binding a new one otherwise.
    ///
    /// Returns the listener and whether it was inherited. Repeated calls with
    /// the same name return the same underlying socket.
    pub fn listen(&self, protocol: &str, address: &str) -> Result<(Listener, bool)> {
        let network = Network::parse(protocol)?;
        let name = listener_name(protocol, address);
        let mut inner = self.lock();

        if inner.closed {
            return Err(UpgradeError::Stopped);
        }

        if let Some(entry) = inner.used.get(&name) {
            let listener = network.wrap(entry.fd.try_clone()?)?;
            return Ok((listener, entry.inherited));
        }

        if let Some(fd) = inner.inherited.remove(&name) {
            let listener = network
                .wrap(fd.try_clone()?)
                .map_err(|e| UpgradeError::handoff(format!("inherited {name}: {e}")))?;
            info!(name = %name, "Inherited listener from parent generation");
            inner.used.insert(name, Entry { fd, inherited: true });
            return Ok((listener, true));
        }

        if inner.frozen {
            return Err(UpgradeError::TooLate { name });
        }

        let fd = network.bind(address).map_err(|source| UpgradeError::Bind {
            name: name.clone(),
            source,
        })?;
        let listener = network.wrap(fd.try_clone()?)?;
        info!(name = %name, "Bound new listener");
        inner.used.insert(
            name,
            Entry {
                fd,
                inherited: false,
            },
        );
        Ok((listener, false))
    }

    /// Look up an inherited listener without ever binding.
    pub fn listener(&self, protocol: &str, address: &str) -> Result<Option<Listener>> {
        let network = Network::parse(protocol)?;
        let name = listener_name(protocol, address);
        let mut inner = self.lock();

        if let Some(entry) = inner.used.get(&name) {
            return Ok(Some(network.wrap(entry.fd.try_clone()?)?));
        }
        match inner.inherited.remove(&name) {
            Some(fd) => {
                let listener = network.wrap(fd.try_clone()?)?;
                inner.used.insert(name, Entry { fd, inherited: true });
                Ok(Some(listener))
            }
            None => Ok(None),
        }
    }

    /// Register an arbitrary descriptor so a child can inherit it.
    pub fn add_file(&self, name: &str, fd: impl Into<OwnedFd>) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(UpgradeError::Stopped);
        }
        if inner.frozen {
            return Err(UpgradeError::TooLate {
                name: name.to_string(),
            });
        }
        inner.inherited.remove(name);
        inner.used.insert(
            name.to_string(),
            Entry {
                fd: fd.into(),
                inherited: false,
            },
        );
        Ok(())
    }

    /// Get a duplicate of a named descriptor, inherited or registered here.
    pub fn file(&self, name: &str) -> Result<Option<OwnedFd>> {
        let mut inner = self.lock();
        if let Some(entry) = inner.used.get(name) {
            return Ok(Some(entry.fd.try_clone()?));
        }
        match inner.inherited.remove(name) {
            Some(fd) => {
                let dup = fd.try_clone()?;
                inner
                    .used
                    .insert(name.to_string(), Entry { fd, inherited: true });
                Ok(Some(dup))
            }
            None => Ok(None),
        }
    }

    /// Names of the descriptors a child would inherit, in slot order.
    pub fn names(&self) -> Vec<String> {
        self.lock().used.keys().cloned().collect()
    }

    /// Stop accepting new registrations and snapshot the current descriptors.
    pub(crate) fn freeze(&self) -> Result<FileDescriptorSet> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(UpgradeError::Stopped);
        }
        let mut set = FileDescriptorSet::new();
        for (name, entry) in &inner.used {
            set.push(name.clone(), entry.fd.try_clone()?)?;
        }
        inner.frozen = true;
        debug!(count = set.len(), "Froze descriptor set for upgrade");
        Ok(set)
    }

    /// Accept new registrations again after a failed upgrade.
    pub(crate) fn thaw(&self) {
        self.lock().frozen = false;
    }

    /// Close inherited descriptors nobody asked for. Returns how many.
    pub(crate) fn close_inherited(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.inherited.len();
        for name in inner.inherited.keys() {
            info!(name = %name, "Closing unused inherited descriptor");
        }
        inner.inherited.clear();
        count
    }

    /// Close everything held by the registry. Listeners already handed out
    /// stay open.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.inherited.clear();
        inner.used.clear();
    }
}
