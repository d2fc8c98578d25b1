//! Raw IPv4 socket carrying the `SO_IP_SET` socket option.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::channel::{Connector, SockOpt};
use crate::errno::KernelError;
use crate::proto::SO_IP_SET;
use crate::{IpSetError, Result};

/// The kernel's ipset control socket.
///
/// Opening it requires CAP_NET_RAW; the ipset handler behind it additionally
/// checks CAP_NET_ADMIN on every call.
pub struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    pub fn open() -> std::result::Result<Self, KernelError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_RAW,
            )
        };

        if fd < 0 {
            return Err(KernelError::last());
        }

        Ok(Self { fd })
    }
}

impl SockOpt for RawSocket {
    fn get(&self, buf: &mut [u8]) -> std::result::Result<usize, KernelError> {
        let mut len = buf.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_IP,
                SO_IP_SET,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };

        if ret != 0 {
            return Err(KernelError::last());
        }

        Ok(len as usize)
    }

    fn set(&self, buf: &[u8]) -> std::result::Result<(), KernelError> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_IP,
                SO_IP_SET,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::socklen_t,
            )
        };

        if ret != 0 {
            return Err(KernelError::last());
        }

        Ok(())
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Opens [`RawSocket`]s against the running kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawConnector;

impl Connector for RawConnector {
    type Socket = RawSocket;

    fn connect(&mut self) -> Result<RawSocket> {
        RawSocket::open().map_err(IpSetError::Open)
    }
}
