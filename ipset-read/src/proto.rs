//! Wire structures of the legacy ipset socket option protocol.
//!
//! Requests are exchanged through `getsockopt`/`setsockopt(SOL_IP, SO_IP_SET)`
//! on a raw IPv4 socket. Every structure is a fixed-size native-endian
//! block; the kernel rejects any other length with EINVAL.

use std::mem;

// Compile-time size assertions to ensure struct layouts match kernel expectations
const _: () = assert!(mem::size_of::<ReqVersion>() == 8);
const _: () = assert!(mem::size_of::<ReqAdtGet>() == 72);
const _: () = assert!(mem::size_of::<ReqTestIp>() == 12);

/// Socket option number of the ipset control interface (level `SOL_IP`).
pub const SO_IP_SET: i32 = 83;

/// Protocol revision with naturally aligned request structures.
pub const IP_SET_PROTOCOL_VERSION: u32 = 4;
/// Older protocol revision, still accepted by this client.
pub const IP_SET_PROTOCOL_UNALIGNED: u32 = 3;

/// Size of the set name field, including the terminator when there is room for one.
pub const IP_SET_MAXNAMELEN: usize = 32;
/// Index the kernel reports for a name it could not find.
pub const IP_SET_INVALID_ID: u16 = 65535;

// ipset operations
pub const IP_SET_OP_ADT_GET: u32 = 0x0000_0010;
pub const IP_SET_OP_VERSION: u32 = 0x0000_0100;
pub const IP_SET_OP_TEST_IP: u32 = 0x0000_0103;

/// `struct ip_set_req_version`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReqVersion {
    pub op: u32,
    pub version: u32,
}

impl ReqVersion {
    pub const SIZE: usize = mem::size_of::<ReqVersion>();

    pub fn request() -> Self {
        Self {
            op: IP_SET_OP_VERSION,
            version: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.op.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.version.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            op: read_u32(buf, 0),
            version: read_u32(buf, 4),
        }
    }
}

/// `struct ip_set_req_adt_get`
///
/// `set` is a C union: the name goes in, the kernel overwrites its first two
/// bytes with the set index on the way out.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReqAdtGet {
    pub op: u32,
    pub version: u32,
    pub set: [u8; IP_SET_MAXNAMELEN],
    pub typename: [u8; IP_SET_MAXNAMELEN],
}

impl ReqAdtGet {
    pub const SIZE: usize = mem::size_of::<ReqAdtGet>();

    /// Build a resolve-by-name request. Names longer than
    /// [`IP_SET_MAXNAMELEN`] are truncated the way `strncpy` would.
    pub fn request(version: u32, name: &str) -> Self {
        let mut set = [0u8; IP_SET_MAXNAMELEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(IP_SET_MAXNAMELEN);
        set[..len].copy_from_slice(&bytes[..len]);

        Self {
            op: IP_SET_OP_ADT_GET,
            version,
            set,
            typename: [0u8; IP_SET_MAXNAMELEN],
        }
    }

    /// The set name as sent, up to the first NUL.
    pub fn name(&self) -> &[u8] {
        let end = self
            .set
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IP_SET_MAXNAMELEN);
        &self.set[..end]
    }

    /// The index written back by the kernel.
    pub fn index(&self) -> u16 {
        u16::from_ne_bytes([self.set[0], self.set[1]])
    }

    pub fn set_index(&mut self, index: u16) {
        self.set = [0u8; IP_SET_MAXNAMELEN];
        self.set[0..2].copy_from_slice(&index.to_ne_bytes());
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.op.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.version.to_ne_bytes());
        buf[8..40].copy_from_slice(&self.set);
        buf[40..72].copy_from_slice(&self.typename);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut set = [0u8; IP_SET_MAXNAMELEN];
        let mut typename = [0u8; IP_SET_MAXNAMELEN];
        set.copy_from_slice(&buf[8..40]);
        typename.copy_from_slice(&buf[40..72]);

        Self {
            op: read_u32(buf, 0),
            version: read_u32(buf, 4),
            set,
            typename,
        }
    }
}

/// `struct ip_set_req_adt` followed by an `ip_set_ip_t`.
///
/// The header is padded to 8 bytes by the C compiler; the padding is
/// spelled out so the layout carries no uninitialized bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReqTestIp {
    pub op: u32,
    pub index: u16,
    pub pad: u16,
    /// IPv4 address in host byte order.
    pub ip: u32,
}

impl ReqTestIp {
    pub const SIZE: usize = mem::size_of::<ReqTestIp>();

    pub fn request(index: u16, ip: u32) -> Self {
        Self {
            op: IP_SET_OP_TEST_IP,
            index,
            pad: 0,
            ip,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.op.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.index.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.pad.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.ip.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            op: read_u32(buf, 0),
            index: u16::from_ne_bytes([buf[4], buf[5]]),
            pad: u16::from_ne_bytes([buf[6], buf[7]]),
            ip: read_u32(buf, 8),
        }
    }
}

/// Read the operation code every request starts with.
pub fn request_op(buf: &[u8]) -> Option<u32> {
    buf.get(0..4).map(|_| read_u32(buf, 0))
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_request_layout() {
        let buf = ReqVersion::request().encode();
        assert_eq!(&buf[0..4], &IP_SET_OP_VERSION.to_ne_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(request_op(&buf), Some(IP_SET_OP_VERSION));
    }

    #[test]
    fn test_adt_get_name_truncation() {
        let req = ReqAdtGet::request(IP_SET_PROTOCOL_VERSION, "blocklist");
        assert_eq!(req.name(), b"blocklist");
        assert_eq!(req.set[9], 0);

        let long_name = "x".repeat(40);
        let req = ReqAdtGet::request(IP_SET_PROTOCOL_VERSION, &long_name);
        assert_eq!(req.name().len(), IP_SET_MAXNAMELEN);
    }

    #[test]
    fn test_adt_get_index_written_back() {
        let mut req = ReqAdtGet::request(IP_SET_PROTOCOL_VERSION, "allowlist");
        req.set_index(7);
        let decoded = ReqAdtGet::decode(&req.encode());
        assert_eq!(decoded.index(), 7);
        assert_eq!(decoded.op, IP_SET_OP_ADT_GET);
        assert_eq!(decoded.version, IP_SET_PROTOCOL_VERSION);
    }

    #[test]
    fn test_test_ip_layout() {
        let ip = u32::from(std::net::Ipv4Addr::new(10, 0, 0, 5));
        let buf = ReqTestIp::request(3, ip).encode();
        assert_eq!(&buf[4..6], &3u16.to_ne_bytes());
        assert_eq!(&buf[6..8], &[0, 0]);
        assert_eq!(&buf[8..12], &0x0a00_0005u32.to_ne_bytes());
    }

    #[test]
    fn test_request_op_short_buffer() {
        assert_eq!(request_op(&[1, 2]), None);
    }
}
