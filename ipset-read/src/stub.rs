//! Stub implementations for non-Linux platforms.
//!
//! Connecting always fails with `Err(IpSetError::UnsupportedPlatform)`.

use crate::channel::{Connector, SockOpt};
use crate::errno::KernelError;
use crate::{IpSetError, Result};

/// ipset control socket (stub for non-Linux, never constructed)
pub struct RawSocket {
    _private: (),
}

impl SockOpt for RawSocket {
    fn get(&self, _buf: &mut [u8]) -> std::result::Result<usize, KernelError> {
        Err(KernelError::new(nix::errno::Errno::ENOPROTOOPT))
    }

    fn set(&self, _buf: &[u8]) -> std::result::Result<(), KernelError> {
        Err(KernelError::new(nix::errno::Errno::ENOPROTOOPT))
    }
}

/// Connector for the running kernel (stub for non-Linux)
#[derive(Clone, Copy, Debug, Default)]
pub struct RawConnector;

impl Connector for RawConnector {
    type Socket = RawSocket;

    fn connect(&mut self) -> Result<RawSocket> {
        Err(IpSetError::UnsupportedPlatform)
    }
}
