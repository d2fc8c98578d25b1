//! Resolving set names to kernel handles.

use std::fmt;

use nix::errno::Errno;

use crate::channel::{Channel, Connector};
use crate::errno::KernelError;
use crate::proto::{ReqAdtGet, IP_SET_INVALID_ID, IP_SET_MAXNAMELEN};
use crate::{IpSetError, Result};

/// Kernel-assigned index of a named set.
///
/// A handle stays valid only as long as the set it was resolved from: after
/// the set is renamed, destroyed or recreated the caller must resolve the
/// name again. The kernel sends no notification when that happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SetHandle(u16);

impl SetHandle {
    pub fn from_index(index: u16) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Check that `name` fits the kernel's name field with its terminator.
///
/// [`Channel::resolve`] silently truncates long names; callers that cannot
/// accept that validate first.
pub fn validate_set_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= IP_SET_MAXNAMELEN || name.contains('\0') {
        return Err(IpSetError::InvalidSetName(name.to_string()));
    }
    Ok(())
}

impl<C: Connector> Channel<C> {
    /// Resolve a set name to its handle.
    ///
    /// Opens the channel first if needed. Names longer than the kernel's
    /// 32-byte field are truncated. A missing set fails with ENOENT, see
    /// [`IpSetError::is_set_not_found`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ipset_read::Channel;
    ///
    /// let mut channel = Channel::new();
    /// let handle = channel.resolve("blocklist").unwrap();
    /// println!("blocklist is {}", handle);
    /// ```
    pub fn resolve(&mut self, name: &str) -> Result<SetHandle> {
        let version = self.open_version()?;

        let mut buf = ReqAdtGet::request(version.as_u32(), name).encode();
        self.query(&mut buf).map_err(|err| match err {
            IpSetError::Kernel(source) => IpSetError::Resolve {
                name: name.to_string(),
                source,
            },
            other => other,
        })?;

        let index = ReqAdtGet::decode(&buf).index();
        if index == IP_SET_INVALID_ID {
            return Err(IpSetError::Resolve {
                name: name.to_string(),
                source: KernelError::new(Errno::ENOENT),
            });
        }

        Ok(SetHandle(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SockOpt;
    use crate::mock::{FakeKernel, MockConnector};
    use crate::proto::{request_op, ReqVersion, IP_SET_OP_ADT_GET, IP_SET_PROTOCOL_VERSION};

    fn channel(kernel: &FakeKernel) -> Channel<MockConnector> {
        Channel::with_connector(MockConnector::new(kernel.clone()))
    }

    #[test]
    fn test_resolve_existing_set() {
        let kernel = FakeKernel::new();
        kernel.create_set("other");
        let index = kernel.create_set("allowlist");
        let mut ch = channel(&kernel);

        let handle = ch.resolve("allowlist").unwrap();
        assert_eq!(handle.index(), index);
        assert_eq!(handle, SetHandle::from_index(index));
    }

    #[test]
    fn test_resolve_opens_channel_first() {
        let kernel = FakeKernel::new();
        let mut ch = channel(&kernel);

        let err = ch.resolve("blocklist").unwrap_err();
        assert!(ch.is_open());
        assert_eq!(kernel.stats().version_queries, 1);
        assert_eq!(kernel.stats().resolves, 1);
        assert!(err.is_set_not_found());
        assert!(err.to_string().contains("Unknown ipset"));
        assert!(err.to_string().contains("blocklist"));
    }

    #[test]
    fn test_resolve_unprivileged_never_reaches_kernel() {
        let kernel = FakeKernel::new();
        kernel.create_set("allowlist");
        kernel.set_privileged(false);
        let mut ch = channel(&kernel);

        let err = ch.resolve("allowlist").unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(kernel.stats().resolves, 0);

        // Still refused until initialization succeeds
        let err = ch.resolve("allowlist").unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(kernel.stats().resolves, 0);

        kernel.set_privileged(true);
        assert!(ch.resolve("allowlist").is_ok());
    }

    #[test]
    fn test_resolve_sends_negotiated_version() {
        let kernel = FakeKernel::with_version(3);
        kernel.create_set("allowlist");
        let mut ch = channel(&kernel);

        // The fake kernel answers EPROTO when the request version differs
        assert!(ch.resolve("allowlist").is_ok());
    }

    #[test]
    fn test_resolve_truncates_long_names() {
        let kernel = FakeKernel::new();
        let name = "n".repeat(IP_SET_MAXNAMELEN);
        let index = kernel.create_set(&name);
        let mut ch = channel(&kernel);

        let long = format!("{}-suffix", name);
        assert_eq!(ch.resolve(&long).unwrap().index(), index);
    }

    #[test]
    fn test_resolve_kernel_busy() {
        let kernel = FakeKernel::new();
        kernel.create_set("allowlist");
        kernel.fail_next(crate::proto::IP_SET_OP_ADT_GET, Errno::EAGAIN);
        let mut ch = channel(&kernel);

        let err = ch.resolve("allowlist").unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_set_not_found());

        // Not retried internally; the caller's next attempt succeeds
        assert!(ch.resolve("allowlist").is_ok());
    }

    /// Answers every resolve successfully, but with the invalid index.
    struct InvalidIdSocket;

    impl SockOpt for InvalidIdSocket {
        fn get(&self, buf: &mut [u8]) -> std::result::Result<usize, KernelError> {
            match request_op(buf) {
                Some(IP_SET_OP_ADT_GET) => {
                    let raw: &mut [u8; ReqAdtGet::SIZE] =
                        buf.try_into().map_err(|_| KernelError::new(Errno::EINVAL))?;
                    let mut req = ReqAdtGet::decode(raw);
                    req.set_index(IP_SET_INVALID_ID);
                    *raw = req.encode();
                    Ok(ReqAdtGet::SIZE)
                }
                Some(_) => {
                    let raw: &mut [u8; ReqVersion::SIZE] =
                        buf.try_into().map_err(|_| KernelError::new(Errno::EINVAL))?;
                    let mut req = ReqVersion::decode(raw);
                    req.version = IP_SET_PROTOCOL_VERSION;
                    *raw = req.encode();
                    Ok(ReqVersion::SIZE)
                }
                None => Err(KernelError::new(Errno::EINVAL)),
            }
        }

        fn set(&self, _buf: &[u8]) -> std::result::Result<(), KernelError> {
            Ok(())
        }
    }

    struct InvalidIdConnector;

    impl Connector for InvalidIdConnector {
        type Socket = InvalidIdSocket;

        fn connect(&mut self) -> Result<InvalidIdSocket> {
            Ok(InvalidIdSocket)
        }
    }

    #[test]
    fn test_resolve_invalid_id_is_not_found() {
        let mut ch = Channel::with_connector(InvalidIdConnector);

        let err = ch.resolve("x").unwrap_err();
        assert!(err.is_set_not_found());
        assert!(matches!(&err, IpSetError::Resolve { name, .. } if name == "x"));
        assert!(err.to_string().contains("Unknown ipset"));
    }

    #[test]
    fn test_validate_set_name() {
        assert!(validate_set_name("blocklist").is_ok());
        assert!(validate_set_name(&"a".repeat(IP_SET_MAXNAMELEN - 1)).is_ok());
        assert!(matches!(
            validate_set_name(""),
            Err(IpSetError::InvalidSetName(_))
        ));
        assert!(matches!(
            validate_set_name(&"a".repeat(IP_SET_MAXNAMELEN)),
            Err(IpSetError::InvalidSetName(_))
        ));
    }
}
