//! Membership tests against a resolved set.
//!
//! The legacy ipset interface has no read-only query. Its test operation is
//! issued like an add that is never committed, and the kernel reports a hit
//! by refusing it with EEXIST. So:
//!
//! | kernel reply | outcome |
//! |---|---|
//! | EEXIST | [`Membership::InSet`] |
//! | success | [`Membership::NotInSet`] |
//! | anything else | [`IpSetError::Test`] |
//!
//! This rides on the kernel's add path. Whether some kernel could commit part
//! of an add before answering EEXIST cannot be told from user space; the
//! host must run against a kernel whose test operation does not mutate.

use std::fmt;
use std::net::Ipv4Addr;

use crate::channel::{Channel, CommandOutcome, Connector};
use crate::handle::SetHandle;
use crate::proto::ReqTestIp;
use crate::{IpSetError, Result};

/// Whether an address is currently in a set.
///
/// A failed test is the `Err` side of the result, so exactly one of
/// in-set, not-in-set or failure comes back from every call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Membership {
    InSet,
    NotInSet,
}

impl Membership {
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::InSet)
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Membership::InSet => write!(f, "in set"),
            Membership::NotInSet => write!(f, "not in set"),
        }
    }
}

impl<C: Connector> Channel<C> {
    /// Test whether `addr` is in the set behind `handle`.
    ///
    /// Opens the channel first if needed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::net::Ipv4Addr;
    /// use ipset_read::{Channel, Membership};
    ///
    /// let mut channel = Channel::new();
    /// let handle = channel.resolve("allowlist").unwrap();
    /// let hit = channel.test(handle, Ipv4Addr::new(10, 0, 0, 5)).unwrap();
    /// assert_eq!(hit, Membership::InSet);
    /// ```
    pub fn test(&mut self, handle: SetHandle, addr: Ipv4Addr) -> Result<Membership> {
        // Ipv4Addr holds network order; the kernel wants a host-order integer
        let req = ReqTestIp::request(handle.index(), u32::from(addr));

        match self.command(&req.encode()) {
            Ok(CommandOutcome::AlreadyExists) => Ok(Membership::InSet),
            Ok(CommandOutcome::Applied) => Ok(Membership::NotInSet),
            Err(IpSetError::Kernel(err)) => Err(IpSetError::Test(err)),
            Err(err) => Err(err),
        }
    }
}
