//! The fixed-layout datagrams exchanged with the lookup helper.
//!
//! Each request and each response is exactly one datagram on a connected
//! socketpair. Since a datagram socket transfers a whole message per
//! send/receive, no framing is needed; a datagram of the wrong size is a
//! protocol violation and fatal to the process that reads it.
//!
//! The layout is spelled out explicitly rather than relying on in-memory
//! struct layout, so the contract does not depend on compiler padding.
//! All integers are big-endian. Text fields are NUL-padded; content ends
//! at the first NUL byte.
//!
//! Request, [`REQUEST_SIZE`] (280) bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  handle (u32)
//!      4   128  local socket address blob (see [`crate::lookup::addr`])
//!    132   128  remote socket address blob
//!    260     4  local blob length (u32)
//!    264     4  remote blob length (u32)
//!    268     4  want-dns flag (u32, 0 or 1)
//!    272     4  want-ident flag (u32, 0 or 1)
//!    276     4  lookup timeout in seconds (u32)
//! ```
//!
//! Response, [`RESPONSE_SIZE`] (520) bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  handle (u32, echoes the request)
//!      4   128  numeric address, text
//!    132   256  resolved hostname, text; numeric address on failure
//!    388   128  ident answer, text; empty when not requested or failed
//!    516     4  local port (i32, -1 when unknown)
//! ```

use std::error;
use std::fmt;
use std::time::Duration;

use super::addr::{AddrBlob, ADDR_BLOB_LEN};
use super::Handle;

/// Size of the numeric-address field in a response.
pub const IPADDR_LEN: usize = 128;

/// Size of the hostname field in a response.
pub const HOSTNAME_LEN: usize = 256;

/// Size of the ident field in a response.
pub const IDENT_LEN: usize = 128;

/// Exact size of a request datagram.
pub const REQUEST_SIZE: usize = 4 + 2 * ADDR_BLOB_LEN + 4 + 4 + 4 + 4 + 4;

/// Exact size of a response datagram.
pub const RESPONSE_SIZE: usize = 4 + IPADDR_LEN + HOSTNAME_LEN + IDENT_LEN + 4;

//------------ LookupRequest -------------------------------------------------

/// One lookup request, as sent to the helper.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LookupRequest {
    /// Correlation key, echoed verbatim in the response.
    pub handle: Handle,

    /// The local address the connection arrived on.
    pub local: AddrBlob,

    /// The remote peer's address.
    pub remote: AddrBlob,

    /// Perform a reverse-DNS lookup of the remote address?
    pub want_dns: bool,

    /// Perform an ident query against the remote host?
    pub want_ident: bool,

    /// Wall-clock budget for the whole lookup.
    pub timeout: Duration,
}

impl LookupRequest {
    /// Serializes the request into its wire form.
    pub fn compose(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&self.handle.0.to_be_bytes());
        let (local, llen) = self.local.as_wire();
        let (remote, rlen) = self.remote.as_wire();
        buf[4..132].copy_from_slice(local);
        buf[132..260].copy_from_slice(remote);
        buf[260..264].copy_from_slice(&(llen as u32).to_be_bytes());
        buf[264..268].copy_from_slice(&(rlen as u32).to_be_bytes());
        buf[268..272].copy_from_slice(&u32::from(self.want_dns).to_be_bytes());
        buf[272..276]
            .copy_from_slice(&u32::from(self.want_ident).to_be_bytes());
        let secs = u32::try_from(self.timeout.as_secs()).unwrap_or(u32::MAX);
        buf[276..280].copy_from_slice(&secs.to_be_bytes());
        buf
    }

    /// Deserializes a request from a received datagram.
    ///
    /// The datagram must be exactly [`REQUEST_SIZE`] bytes; anything else
    /// is a [`WireError::BadSize`] and grounds for the reader to exit.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != REQUEST_SIZE {
            return Err(WireError::BadSize {
                expected: REQUEST_SIZE,
                got: data.len(),
            });
        }
        let llen = read_u32(&data[260..264]) as usize;
        let rlen = read_u32(&data[264..268]) as usize;
        Ok(Self {
            handle: Handle(read_u32(&data[0..4])),
            local: AddrBlob::from_wire(
                data[4..132].try_into().expect("sized above"),
                llen,
            ),
            remote: AddrBlob::from_wire(
                data[132..260].try_into().expect("sized above"),
                rlen,
            ),
            want_dns: read_u32(&data[268..272]) != 0,
            want_ident: read_u32(&data[272..276]) != 0,
            timeout: Duration::from_secs(read_u32(&data[276..280]).into()),
        })
    }
}

//------------ LookupResponse ------------------------------------------------

/// One lookup response, as sent back by the helper.
///
/// A response is produced exactly once per accepted request, even when the
/// lookup fails: failure degrades the hostname to the numeric address and
/// the ident answer to the empty string, never to silence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LookupResponse {
    /// The request's correlation key.
    pub handle: Handle,

    /// Textual numeric form of the remote address.
    pub ipaddr: String,

    /// Resolved hostname, or the numeric address when resolution failed.
    pub hostname: String,

    /// Ident answer; empty when not requested or when the query failed.
    pub ident: String,

    /// The local port the connection arrived on, -1 when unknown.
    pub local_port: i32,
}

impl LookupResponse {
    /// Serializes the response into its wire form.
    ///
    /// Over-long text is silently truncated to its field; the fields are
    /// far larger than anything a resolver hands back in practice.
    pub fn compose(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0; RESPONSE_SIZE];
        buf[0..4].copy_from_slice(&self.handle.0.to_be_bytes());
        write_text(&mut buf[4..132], &self.ipaddr);
        write_text(&mut buf[132..388], &self.hostname);
        write_text(&mut buf[388..516], &self.ident);
        buf[516..520].copy_from_slice(&self.local_port.to_be_bytes());
        buf
    }

    /// Deserializes a response from a received datagram.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != RESPONSE_SIZE {
            return Err(WireError::BadSize {
                expected: RESPONSE_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            handle: Handle(read_u32(&data[0..4])),
            ipaddr: read_text(&data[4..132]),
            hostname: read_text(&data[132..388]),
            ident: read_text(&data[388..516]),
            local_port: i32::from_be_bytes(
                data[516..520].try_into().expect("sized above"),
            ),
        })
    }
}

//------------ WireError -----------------------------------------------------

/// A received datagram violated the protocol contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireError {
    /// The datagram was not exactly the size the contract requires.
    BadSize {
        /// The size the contract requires.
        expected: usize,

        /// The size actually received.
        got: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WireError::BadSize { expected, got } => {
                write!(f, "datagram of {got} bytes, expected {expected}")
            }
        }
    }
}

impl error::Error for WireError {}

//------------ Helper Functions ----------------------------------------------

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes(data.try_into().expect("caller passes 4 bytes"))
}

/// Copies `text` into a NUL-padded fixed field, truncating if needed.
///
/// The field always keeps at least one trailing NUL so readers that scan
/// for a terminator stay in bounds.
fn write_text(field: &mut [u8], text: &str) {
    let n = text.len().min(field.len() - 1);
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
}

/// Reads a NUL-padded text field back into a string.
fn read_text(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> LookupRequest {
        LookupRequest {
            handle: Handle(17),
            local: "198.51.100.4:4201".parse::<std::net::SocketAddr>()
                .unwrap()
                .into(),
            remote: "[2001:db8::7]:61000"
                .parse::<std::net::SocketAddr>()
                .unwrap()
                .into(),
            want_dns: true,
            want_ident: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(REQUEST_SIZE, 280);
        assert_eq!(RESPONSE_SIZE, 520);
    }

    #[test]
    fn request_round_trip() {
        let req = sample_request();
        let parsed = LookupRequest::parse(&req.compose()).unwrap();
        assert_eq!(parsed.handle, req.handle);
        assert_eq!(
            parsed.local.to_socket_addr(),
            req.local.to_socket_addr()
        );
        assert_eq!(
            parsed.remote.to_socket_addr(),
            req.remote.to_socket_addr()
        );
        assert!(parsed.want_dns);
        assert!(!parsed.want_ident);
        assert_eq!(parsed.timeout, Duration::from_secs(5));
    }

    #[test]
    fn response_round_trip() {
        let resp = LookupResponse {
            handle: Handle(17),
            ipaddr: "198.51.100.4".into(),
            hostname: "mud.example.net".into(),
            ident: String::new(),
            local_port: 4201,
        };
        assert_eq!(LookupResponse::parse(&resp.compose()).unwrap(), resp);
    }

    #[test]
    fn wrong_size_is_rejected() {
        let req = sample_request().compose();
        assert_eq!(
            LookupRequest::parse(&req[..REQUEST_SIZE - 1]),
            Err(WireError::BadSize {
                expected: REQUEST_SIZE,
                got: REQUEST_SIZE - 1
            })
        );
        assert!(LookupResponse::parse(&[0; RESPONSE_SIZE + 4]).is_err());
    }

    #[test]
    fn long_hostname_is_truncated_not_overrun() {
        let resp = LookupResponse {
            handle: Handle(1),
            ipaddr: "203.0.113.9".into(),
            hostname: "x".repeat(HOSTNAME_LEN * 2),
            ident: String::new(),
            local_port: 23,
        };
        let parsed = LookupResponse::parse(&resp.compose()).unwrap();
        assert_eq!(parsed.hostname.len(), HOSTNAME_LEN - 1);
    }
}
