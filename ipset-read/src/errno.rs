//! Kernel error codes and their ipset-specific meaning.
//!
//! The ipset socket option handler reuses generic errno values with
//! meanings that `strerror` does not convey, so every failed kernel call is
//! described through [`describe`] instead.

use std::fmt;
use std::io;

use nix::errno::Errno;

/// Translate an errno returned by the ipset socket option into a
/// human-readable diagnostic.
///
/// Codes the ipset handler does not overload fall back to the platform's
/// generic description.
pub fn describe(errno: Errno) -> &'static str {
    match errno {
        Errno::EPERM => "Missing capability (or not allowed)",
        Errno::EBADF => "Invalid socket option",
        Errno::EINVAL => "Size mismatch for expected socket data",
        Errno::ENOMEM => "Not enough memory",
        Errno::EFAULT => "Failed to copy data",
        Errno::EPROTO => "ipset kernel/userspace version mismatch",
        Errno::EBADMSG => "Unknown ipset command",
        Errno::ENOENT => "Unknown ipset",
        Errno::EAGAIN => "IpSets are busy, try again later",
        Errno::ERANGE => "IP/port/element is outside of the set or set is full",
        Errno::EEXIST => "Set specified as element does not exist",
        Errno::EBUSY => "Set is in use, operation not permitted",
        Errno::ENOPROTOOPT => "No module in kernel",
        other => other.desc(),
    }
}

/// A failed call into the kernel, identified by its errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelError(Errno);

impl KernelError {
    pub fn new(errno: Errno) -> Self {
        Self(errno)
    }

    /// Capture the calling thread's current errno.
    pub fn last() -> Self {
        Self(Errno::last())
    }

    pub fn errno(&self) -> Errno {
        self.0
    }

    /// The ipset-specific diagnostic for this error.
    pub fn describe(&self) -> &'static str {
        describe(self.0)
    }

    /// EPERM or EACCES: the caller lacks CAP_NET_ADMIN / CAP_NET_RAW.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.0, Errno::EPERM | Errno::EACCES)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.describe(), self.0)
    }
}

impl std::error::Error for KernelError {}

impl From<Errno> for KernelError {
    fn from(errno: Errno) -> Self {
        Self(errno)
    }
}

impl From<io::Error> for KernelError {
    fn from(err: io::Error) -> Self {
        Self(
            err.raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::UnknownErrno),
        )
    }
}
