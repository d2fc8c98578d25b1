//! In-memory stand-in for the kernel's ipset socket option handler.
//!
//! [`FakeKernel`] answers the same requests the legacy kernel module does,
//! with the same errno conventions, so channels can be exercised without
//! root or a kernel that still speaks protocol 3/4.
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use ipset_read::mock::{FakeKernel, MockConnector};
//! use ipset_read::{Channel, Membership};
//!
//! let kernel = FakeKernel::new();
//! kernel.create_set("allowlist");
//! kernel.insert("allowlist", Ipv4Addr::new(10, 0, 0, 5));
//!
//! let mut channel = Channel::with_connector(MockConnector::new(kernel.clone()));
//! let handle = channel.resolve("allowlist").unwrap();
//! assert_eq!(
//!     channel.test(handle, Ipv4Addr::new(10, 0, 0, 5)).unwrap(),
//!     Membership::InSet
//! );
//! ```

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;

use crate::channel::{Connector, SockOpt};
use crate::errno::KernelError;
use crate::proto::{
    request_op, ReqAdtGet, ReqTestIp, ReqVersion, IP_SET_MAXNAMELEN, IP_SET_OP_ADT_GET,
    IP_SET_OP_TEST_IP, IP_SET_OP_VERSION, IP_SET_PROTOCOL_VERSION,
};
use crate::{IpSetError, Result};

/// Call counters of a [`FakeKernel`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Sockets opened over the kernel's lifetime.
    pub connects: usize,
    /// Sockets currently open.
    pub open_sockets: usize,
    pub version_queries: usize,
    pub resolves: usize,
    pub tests: usize,
}

struct FakeSet {
    name: Vec<u8>,
    members: HashSet<u32>,
}

struct State {
    version: u32,
    privileged: bool,
    /// Slot position is the set index.
    sets: Vec<Option<FakeSet>>,
    failures: HashMap<u32, Errno>,
    stats: KernelStats,
}

/// A shared, cloneable fake kernel.
#[derive(Clone)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A privileged kernel speaking protocol 4 with no sets.
    pub fn new() -> Self {
        Self::with_version(IP_SET_PROTOCOL_VERSION)
    }

    /// A kernel reporting an arbitrary protocol version.
    pub fn with_version(version: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                version,
                privileged: true,
                sets: Vec::new(),
                failures: HashMap::new(),
                stats: KernelStats::default(),
            })),
        }
    }

    /// Whether the calling process holds the required capabilities.
    pub fn set_privileged(&self, privileged: bool) {
        self.state.lock().privileged = privileged;
    }

    /// Fail the next request with operation `op` with `errno`.
    pub fn fail_next(&self, op: u32, errno: Errno) {
        self.state.lock().failures.insert(op, errno);
    }

    /// Create an empty set in the first free slot and return its index.
    pub fn create_set(&self, name: &str) -> u16 {
        let mut state = self.state.lock();
        let set = FakeSet {
            name: truncate_name(name.as_bytes()).to_vec(),
            members: HashSet::new(),
        };

        let free = state.sets.iter().position(Option::is_none);
        match free {
            Some(slot) => {
                state.sets[slot] = Some(set);
                slot as u16
            }
            None => {
                state.sets.push(Some(set));
                (state.sets.len() - 1) as u16
            }
        }
    }

    pub fn destroy_set(&self, name: &str) {
        let mut state = self.state.lock();
        let slot = state.find_slot(name.as_bytes());
        if let Some(slot) = slot {
            state.sets[slot] = None;
        }
    }

    pub fn rename_set(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        let slot = state.find_slot(from.as_bytes());
        if let Some(slot) = slot {
            if let Some(set) = state.sets[slot].as_mut() {
                set.name = truncate_name(to.as_bytes()).to_vec();
            }
        }
    }

    pub fn insert(&self, name: &str, addr: Ipv4Addr) {
        self.with_set(name, |set| {
            set.members.insert(u32::from(addr));
        });
    }

    pub fn remove(&self, name: &str, addr: Ipv4Addr) {
        self.with_set(name, |set| {
            set.members.remove(&u32::from(addr));
        });
    }

    pub fn contains(&self, name: &str, addr: Ipv4Addr) -> bool {
        let mut found = false;
        self.with_set(name, |set| found = set.members.contains(&u32::from(addr)));
        found
    }

    pub fn stats(&self) -> KernelStats {
        self.state.lock().stats
    }

    fn with_set(&self, name: &str, f: impl FnOnce(&mut FakeSet)) {
        let mut state = self.state.lock();
        let slot = state.find_slot(name.as_bytes());
        if let Some(slot) = slot {
            if let Some(set) = state.sets[slot].as_mut() {
                f(set);
            }
        }
    }

    fn handle_get(&self, buf: &mut [u8]) -> std::result::Result<usize, KernelError> {
        let mut state = self.state.lock();
        let op = state.admit(buf)?;

        match op {
            IP_SET_OP_VERSION => {
                let raw: &mut [u8; ReqVersion::SIZE] =
                    buf.try_into().map_err(|_| KernelError::new(Errno::EINVAL))?;
                state.stats.version_queries += 1;

                let mut req = ReqVersion::decode(raw);
                req.version = state.version;
                *raw = req.encode();
                Ok(ReqVersion::SIZE)
            }
            IP_SET_OP_ADT_GET => {
                let raw: &mut [u8; ReqAdtGet::SIZE] =
                    buf.try_into().map_err(|_| KernelError::new(Errno::EINVAL))?;
                state.stats.resolves += 1;

                let mut req = ReqAdtGet::decode(raw);
                if req.version != state.version {
                    return Err(KernelError::new(Errno::EPROTO));
                }
                let slot = state
                    .find_slot(req.name())
                    .ok_or(KernelError::new(Errno::ENOENT))?;
                req.set_index(slot as u16);
                *raw = req.encode();
                Ok(ReqAdtGet::SIZE)
            }
            _ => Err(KernelError::new(Errno::EBADMSG)),
        }
    }

    fn handle_set(&self, buf: &[u8]) -> std::result::Result<(), KernelError> {
        let mut state = self.state.lock();
        let op = state.admit(buf)?;

        match op {
            IP_SET_OP_TEST_IP => {
                let raw: &[u8; ReqTestIp::SIZE] =
                    buf.try_into().map_err(|_| KernelError::new(Errno::EINVAL))?;
                state.stats.tests += 1;

                let req = ReqTestIp::decode(raw);
                let set = state
                    .sets
                    .get(req.index as usize)
                    .and_then(Option::as_ref)
                    .ok_or(KernelError::new(Errno::ENOENT))?;

                if set.members.contains(&req.ip) {
                    Err(KernelError::new(Errno::EEXIST))
                } else {
                    Ok(())
                }
            }
            _ => Err(KernelError::new(Errno::EBADMSG)),
        }
    }
}

impl State {
    /// Capability check, op decoding and injected failures, in the order the
    /// kernel applies them.
    fn admit(&mut self, buf: &[u8]) -> std::result::Result<u32, KernelError> {
        if !self.privileged {
            return Err(KernelError::new(Errno::EPERM));
        }
        let op = request_op(buf).ok_or(KernelError::new(Errno::EINVAL))?;
        if let Some(errno) = self.failures.remove(&op) {
            return Err(KernelError::new(errno));
        }
        Ok(op)
    }

    fn find_slot(&self, name: &[u8]) -> Option<usize> {
        let name = truncate_name(name);
        self.sets
            .iter()
            .position(|set| set.as_ref().is_some_and(|s| s.name == name))
    }
}

fn truncate_name(name: &[u8]) -> &[u8] {
    &name[..name.len().min(IP_SET_MAXNAMELEN)]
}

/// Hands out [`MockSocket`]s bound to one [`FakeKernel`].
#[derive(Clone)]
pub struct MockConnector {
    kernel: FakeKernel,
}

impl MockConnector {
    pub fn new(kernel: FakeKernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &FakeKernel {
        &self.kernel
    }
}

impl Connector for MockConnector {
    type Socket = MockSocket;

    fn connect(&mut self) -> Result<MockSocket> {
        let mut state = self.kernel.state.lock();
        if !state.privileged {
            return Err(IpSetError::Open(KernelError::new(Errno::EPERM)));
        }
        state.stats.connects += 1;
        state.stats.open_sockets += 1;
        drop(state);

        Ok(MockSocket {
            kernel: self.kernel.clone(),
        })
    }
}

/// A socket opened on a [`FakeKernel`].
pub struct MockSocket {
    kernel: FakeKernel,
}

impl SockOpt for MockSocket {
    fn get(&self, buf: &mut [u8]) -> std::result::Result<usize, KernelError> {
        self.kernel.handle_get(buf)
    }

    fn set(&self, buf: &[u8]) -> std::result::Result<(), KernelError> {
        self.kernel.handle_set(buf)
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        let mut state = self.kernel.state.lock();
        state.stats.open_sockets = state.stats.open_sockets.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_request_size() {
        let kernel = FakeKernel::new();
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&IP_SET_OP_VERSION.to_ne_bytes());
        assert_eq!(
            kernel.handle_get(&mut buf).unwrap_err().errno(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_unknown_command() {
        let kernel = FakeKernel::new();
        let buf = 0xdeadu32.to_ne_bytes();
        assert_eq!(kernel.handle_set(&buf).unwrap_err().errno(), Errno::EBADMSG);
    }

    #[test]
    fn test_version_checked_on_resolve() {
        let kernel = FakeKernel::new();
        kernel.create_set("allowlist");
        let mut buf = ReqAdtGet::request(3, "allowlist").encode();
        assert_eq!(
            kernel.handle_get(&mut buf).unwrap_err().errno(),
            Errno::EPROTO
        );
    }

    #[test]
    fn test_slots_are_reused() {
        let kernel = FakeKernel::new();
        assert_eq!(kernel.create_set("a"), 0);
        assert_eq!(kernel.create_set("b"), 1);
        kernel.destroy_set("a");
        assert_eq!(kernel.create_set("c"), 0);
    }

    #[test]
    fn test_rename_keeps_members() {
        let kernel = FakeKernel::new();
        kernel.create_set("old");
        kernel.insert("old", Ipv4Addr::LOCALHOST);
        kernel.rename_set("old", "new");
        assert!(kernel.contains("new", Ipv4Addr::LOCALHOST));
        assert!(!kernel.contains("old", Ipv4Addr::LOCALHOST));
    }
}
