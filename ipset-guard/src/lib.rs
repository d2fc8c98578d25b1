//! ipset-backed block/allow lists.
//!
//! Resolves the sets named in a TOML configuration once, then decides per
//! connection whether a peer is allowed, using [`ipset_read`] for the kernel
//! lookups. Set contents may change at runtime; renaming or recreating a set
//! requires a restart, since handles are resolved only at configuration time.

pub mod config;
mod error;
pub mod policy;

pub use config::{Config, Rule};
pub use error::{Error, Result};
pub use policy::{decide, AccessMode, FailurePolicy, Guard, Verdict};

/// Whether the process runs with root privileges.
///
/// ipset lookups need CAP_NET_ADMIN and CAP_NET_RAW, which in practice
/// means running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
