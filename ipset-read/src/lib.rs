//! Read-only ipset client over the kernel's `SO_IP_SET` socket option.
//!
//! This crate resolves named ipsets to kernel handles and tests IPv4
//! addresses for membership, fast enough to run once per connection:
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use ipset_read::{Channel, Membership};
//!
//! let mut channel = Channel::new();
//! let handle = channel.resolve("blocklist")?;
//! if channel.test(handle, Ipv4Addr::new(203, 0, 113, 7))? == Membership::InSet {
//!     // refuse the connection
//! }
//! # Ok::<(), ipset_read::IpSetError>(())
//! ```
//!
//! It talks the legacy socket option protocol (revisions 3 and 4), needs
//! root-equivalent privileges, and never retries or logs: every failure is
//! returned to the caller as an [`IpSetError`].
//!
//! On non-Linux platforms the control socket cannot be opened and every
//! kernel operation returns `Err(IpSetError::UnsupportedPlatform)`.

mod channel;
mod errno;
mod handle;
mod membership;
pub mod mock;
pub mod proto;

#[cfg(target_os = "linux")]
mod socket;
#[cfg(target_os = "linux")]
pub use socket::{RawConnector, RawSocket};

// Stub implementations for non-Linux platforms
#[cfg(not(target_os = "linux"))]
mod stub;
#[cfg(not(target_os = "linux"))]
pub use stub::{RawConnector, RawSocket};

pub use channel::{Channel, CommandOutcome, Connector, ProtocolVersion, SharedChannel, SockOpt};
pub use errno::{describe, KernelError};
pub use handle::{validate_set_name, SetHandle};
pub use membership::Membership;

use thiserror::Error;

/// Error type for ipset operations.
#[derive(Error, Debug)]
pub enum IpSetError {
    #[error("cannot open ipset control socket: {0}")]
    Open(KernelError),

    #[error("couldn't verify ipset kernel module version: {0}")]
    VersionQuery(KernelError),

    #[error("ipset kernel module protocol version mismatch (kernel reports {0})")]
    VersionMismatch(u32),

    #[error("cannot resolve ipset {name:?}: {source}")]
    Resolve { name: String, source: KernelError },

    #[error("ipset membership test failed: {0}")]
    Test(KernelError),

    /// A raw [`Channel::query`] or [`Channel::command`] failed. Resolve and
    /// test wrap their kernel errors in their own variants instead.
    #[error("ipset request failed: {0}")]
    Kernel(KernelError),

    #[error("Invalid set name: {0:?}")]
    InvalidSetName(String),

    #[error("Unsupported platform: ipset operations are only available on Linux")]
    UnsupportedPlatform,
}

pub type Result<T> = std::result::Result<T, IpSetError>;

/// Where in the lookup sequence an error happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Opening the socket or negotiating the protocol. Every later call
    /// fails the same way until initialization succeeds.
    Initialization,
    /// Resolving a set name. Configuration referencing the set should be
    /// refused.
    Resolution,
    /// A single membership test. The caller applies its failure policy.
    Membership,
    /// A raw request sent through [`Channel::query`] or [`Channel::command`].
    Request,
}

impl IpSetError {
    /// The kernel errno behind this error, if there is one.
    pub fn kernel_error(&self) -> Option<KernelError> {
        match self {
            IpSetError::Open(e)
            | IpSetError::VersionQuery(e)
            | IpSetError::Resolve { source: e, .. }
            | IpSetError::Test(e)
            | IpSetError::Kernel(e) => Some(*e),
            IpSetError::VersionMismatch(_)
            | IpSetError::InvalidSetName(_)
            | IpSetError::UnsupportedPlatform => None,
        }
    }

    /// The process lacks the capabilities ipset requires. By far the most
    /// common deployment mistake.
    pub fn is_permission_denied(&self) -> bool {
        self.kernel_error()
            .is_some_and(|e| e.is_permission_denied())
    }

    /// The named set does not exist in the kernel.
    pub fn is_set_not_found(&self) -> bool {
        matches!(self, IpSetError::Resolve { source, .. } if source.errno() == nix::errno::Errno::ENOENT)
    }

    /// The kernel's sets were locked; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.kernel_error()
            .is_some_and(|e| e.errno() == nix::errno::Errno::EAGAIN)
    }

    pub fn stage(&self) -> Stage {
        match self {
            IpSetError::Open(_)
            | IpSetError::VersionQuery(_)
            | IpSetError::VersionMismatch(_)
            | IpSetError::UnsupportedPlatform => Stage::Initialization,
            IpSetError::Resolve { .. } | IpSetError::InvalidSetName(_) => Stage::Resolution,
            IpSetError::Test(_) => Stage::Membership,
            IpSetError::Kernel(_) => Stage::Request,
        }
    }
}
