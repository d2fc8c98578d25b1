//! The ipset control channel.
//!
//! A [`Channel`] owns one control socket and the protocol version the
//! kernel reported for it. It opens lazily: the first resolve or test runs
//! version negotiation, and a [`teardown`](Channel::teardown) makes the next
//! call negotiate again from scratch.
//!
//! ```text
//! CLOSED --ensure_open--> OPEN --teardown--> CLOSED
//! ```
//!
//! A channel is plain owned state with no interior locking. Threads that
//! share one socket go through [`SharedChannel`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errno::KernelError;
use crate::handle::SetHandle;
use crate::membership::Membership;
use crate::proto::{ReqVersion, IP_SET_PROTOCOL_UNALIGNED, IP_SET_PROTOCOL_VERSION};
use crate::{IpSetError, RawConnector, Result};

/// Socket option access to the kernel's ipset handler.
pub trait SockOpt {
    /// `getsockopt`: the kernel reads the request from `buf` and writes its
    /// reply over it. Returns the reply length.
    fn get(&self, buf: &mut [u8]) -> std::result::Result<usize, KernelError>;

    /// `setsockopt`: a write-only command.
    fn set(&self, buf: &[u8]) -> std::result::Result<(), KernelError>;
}

/// Opens control sockets for a [`Channel`].
pub trait Connector {
    type Socket: SockOpt;

    fn connect(&mut self) -> Result<Self::Socket>;
}

/// The two protocol revisions this client speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Revision 4, naturally aligned structures.
    Aligned,
    /// Revision 3.
    Unaligned,
}

impl ProtocolVersion {
    pub fn from_raw(version: u32) -> Option<Self> {
        match version {
            IP_SET_PROTOCOL_VERSION => Some(ProtocolVersion::Aligned),
            IP_SET_PROTOCOL_UNALIGNED => Some(ProtocolVersion::Unaligned),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ProtocolVersion::Aligned => IP_SET_PROTOCOL_VERSION,
            ProtocolVersion::Unaligned => IP_SET_PROTOCOL_UNALIGNED,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Result of a successful `setsockopt` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The kernel accepted the command.
    Applied,
    /// The kernel answered EEXIST. Not a failure: for the test operation it
    /// is how membership is reported.
    AlreadyExists,
}

struct Session<S> {
    socket: S,
    version: ProtocolVersion,
}

/// A lazily opened ipset control channel.
pub struct Channel<C: Connector = RawConnector> {
    connector: C,
    session: Option<Session<C::Socket>>,
}

impl Channel<RawConnector> {
    /// A closed channel to the running kernel.
    pub fn new() -> Self {
        Self::with_connector(RawConnector)
    }
}

impl Default for Channel<RawConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> Channel<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            session: None,
        }
    }

    /// Open the control socket and negotiate the protocol version.
    ///
    /// An already open socket is closed first. On any failure the channel is
    /// left closed.
    pub fn initialize(&mut self) -> Result<ProtocolVersion> {
        self.teardown();
        let session = Self::negotiate(&mut self.connector)?;
        let version = session.version;
        self.session = Some(session);
        Ok(version)
    }

    /// Re-open after `fork()`.
    ///
    /// A socket inherited from the parent process is not reliable in the
    /// child. Each forked worker calls this once before its first lookup.
    pub fn reinitialize(&mut self) -> Result<ProtocolVersion> {
        self.initialize()
    }

    /// Succeeds immediately when open, otherwise runs [`initialize`](Self::initialize).
    pub fn ensure_open(&mut self) -> Result<()> {
        self.session().map(|_| ())
    }

    /// Close the socket. Closing a closed channel does nothing.
    pub fn teardown(&mut self) {
        self.session = None;
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The negotiated protocol version, `None` while closed.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.session.as_ref().map(|s| s.version)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Exchange a request through `getsockopt`, opening the channel first if
    /// needed. The reply overwrites `buf`.
    pub fn query(&mut self, buf: &mut [u8]) -> Result<usize> {
        let session = self.session()?;
        session.socket.get(buf).map_err(IpSetError::Kernel)
    }

    /// Send a command through `setsockopt`, opening the channel first if
    /// needed.
    pub fn command(&mut self, buf: &[u8]) -> Result<CommandOutcome> {
        let session = self.session()?;
        match session.socket.set(buf) {
            Ok(()) => Ok(CommandOutcome::Applied),
            Err(err) if err.errno() == nix::errno::Errno::EEXIST => {
                Ok(CommandOutcome::AlreadyExists)
            }
            Err(err) => Err(IpSetError::Kernel(err)),
        }
    }

    /// Like [`ensure_open`](Self::ensure_open), returning the negotiated version.
    pub(crate) fn open_version(&mut self) -> Result<ProtocolVersion> {
        self.session().map(|s| s.version)
    }

    fn session(&mut self) -> Result<&mut Session<C::Socket>> {
        let session = match self.session.take() {
            Some(session) => session,
            None => Self::negotiate(&mut self.connector)?,
        };
        Ok(self.session.insert(session))
    }

    fn negotiate(connector: &mut C) -> Result<Session<C::Socket>> {
        let socket = connector.connect()?;

        let mut buf = ReqVersion::request().encode();
        socket.get(&mut buf).map_err(IpSetError::VersionQuery)?;

        let reply = ReqVersion::decode(&buf);
        let version =
            ProtocolVersion::from_raw(reply.version).ok_or(IpSetError::VersionMismatch(reply.version))?;

        Ok(Session { socket, version })
    }
}

/// A [`Channel`] behind a mutex, for embedding hosts that look up sets from
/// several threads.
///
/// Every operation holds the lock for the whole kernel round trip, so
/// negotiation, teardown and lookups never interleave. Clones share the same
/// socket.
pub struct SharedChannel<C: Connector = RawConnector> {
    inner: Arc<Mutex<Channel<C>>>,
}

impl<C: Connector> Clone for SharedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> SharedChannel<C> {
    pub fn new(channel: Channel<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    pub fn initialize(&self) -> Result<ProtocolVersion> {
        self.inner.lock().initialize()
    }

    pub fn reinitialize(&self) -> Result<ProtocolVersion> {
        self.inner.lock().reinitialize()
    }

    pub fn ensure_open(&self) -> Result<()> {
        self.inner.lock().ensure_open()
    }

    pub fn teardown(&self) {
        self.inner.lock().teardown()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_open()
    }

    pub fn resolve(&self, name: &str) -> Result<SetHandle> {
        self.inner.lock().resolve(name)
    }

    pub fn test(&self, handle: SetHandle, addr: std::net::Ipv4Addr) -> Result<Membership> {
        self.inner.lock().test(handle, addr)
    }

    /// Run `f` with exclusive access to the channel.
    pub fn with<R>(&self, f: impl FnOnce(&mut Channel<C>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<C: Connector> From<Channel<C>> for SharedChannel<C> {
    fn from(channel: Channel<C>) -> Self {
        Self::new(channel)
    }
}
