//! Compact socket-address encoding for the lookup datagrams.
//!
//! Requests carry the local and remote addresses of the accepted socket.
//! Rather than shipping raw OS `sockaddr` bytes (whose layout is
//! platform-defined), both endpoints of the channel are this crate, so the
//! address travels in a private fixed-layout encoding:
//!
//! ```text
//! offset  size  field
//!      0     1  family tag: 4 = IPv4, 6 = IPv6
//!      1     2  port, big-endian
//!      3   4/16  address bytes (4 for IPv4, 16 for IPv6)
//! ```
//!
//! The blob region in the datagram is fixed at [`ADDR_BLOB_LEN`] bytes;
//! the companion length field says how many of them are meaningful.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Size of the address region inside a request datagram.
///
/// Generously larger than the 19 bytes an IPv6 address needs, so the wire
/// layout survives future address families without a size change.
pub const ADDR_BLOB_LEN: usize = 128;

/// Encoded length of an IPv4 address.
const V4_LEN: usize = 7;

/// Encoded length of an IPv6 address.
const V6_LEN: usize = 19;

//------------ AddrBlob ------------------------------------------------------

/// A socket address in its wire encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AddrBlob {
    bytes: [u8; ADDR_BLOB_LEN],
    len: usize,
}

impl AddrBlob {
    /// Creates a blob from raw wire bytes.
    ///
    /// The bytes are not validated here; [`Self::to_socket_addr`] reports
    /// garbage as `None` so the caller can fall back per the protocol
    /// contract.
    pub fn from_wire(bytes: [u8; ADDR_BLOB_LEN], len: usize) -> Self {
        Self {
            bytes,
            len: len.min(ADDR_BLOB_LEN),
        }
    }

    /// Returns the raw blob region and the meaningful length.
    pub fn as_wire(&self) -> (&[u8; ADDR_BLOB_LEN], usize) {
        (&self.bytes, self.len)
    }

    /// Decodes the blob back into a socket address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let data = &self.bytes[..self.len];
        match *data.first()? {
            4 if data.len() == V4_LEN => {
                let port = u16::from_be_bytes([data[1], data[2]]);
                let octets: [u8; 4] = data[3..7].try_into().ok()?;
                Some(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                ))
            }
            6 if data.len() == V6_LEN => {
                let port = u16::from_be_bytes([data[1], data[2]]);
                let octets: [u8; 16] = data[3..19].try_into().ok()?;
                Some(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                ))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for AddrBlob {
    fn from(addr: SocketAddr) -> Self {
        let mut bytes = [0; ADDR_BLOB_LEN];
        let len = match addr.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = 4;
                bytes[1..3].copy_from_slice(&addr.port().to_be_bytes());
                bytes[3..7].copy_from_slice(&ip.octets());
                V4_LEN
            }
            IpAddr::V6(ip) => {
                bytes[0] = 6;
                bytes[1..3].copy_from_slice(&addr.port().to_be_bytes());
                bytes[3..19].copy_from_slice(&ip.octets());
                V6_LEN
            }
        };
        Self { bytes, len }
    }
}

//--- Debug

impl std::fmt::Debug for AddrBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "AddrBlob({addr})"),
            None => write!(f, "AddrBlob(<{} garbled bytes>)", self.len),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "192.0.2.7:4201".parse().unwrap();
        let blob = AddrBlob::from(addr);
        assert_eq!(blob.to_socket_addr(), Some(addr));
        assert_eq!(blob.as_wire().1, 7);
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[2001:db8::42]:23".parse().unwrap();
        let blob = AddrBlob::from(addr);
        assert_eq!(blob.to_socket_addr(), Some(addr));
        assert_eq!(blob.as_wire().1, 19);
    }

    #[test]
    fn garbage_decodes_to_none() {
        let blob = AddrBlob::from_wire([0xff; ADDR_BLOB_LEN], 7);
        assert!(blob.to_socket_addr().is_none());

        // Family tag right, length wrong.
        let mut bytes = [0; ADDR_BLOB_LEN];
        bytes[0] = 4;
        let blob = AddrBlob::from_wire(bytes, 5);
        assert!(blob.to_socket_addr().is_none());

        let blob = AddrBlob::from_wire([0; ADDR_BLOB_LEN], 0);
        assert!(blob.to_socket_addr().is_none());
    }
}
