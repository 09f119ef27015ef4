//! The lookup helper process.
//!
//! The server farms name lookups out to this helper so its own event loop
//! never blocks in a resolver. The helper reads one fixed-size request
//! datagram at a time from descriptor 0, performs the blocking
//! resolution, and writes exactly one fixed-size response datagram to
//! descriptor 1 — both descriptors being the same connected socketpair
//! the server created before spawning it.
//!
//! Concurrency is bounded fan-out: up to [`worker::MAX_SUBWORKERS`]
//! one-shot sub-worker processes handle requests in parallel; past the
//! cap the main loop resolves inline, blocking further requests until it
//! finishes. Either way the observable contract holds: every request
//! read produces exactly one response with the same handle, with the
//! documented fallbacks on failure, never silence.
//!
//! The helper exits zero when it notices the parent is gone, and
//! non-zero on a protocol violation or a broken event loop; the server's
//! respawn logic handles the rest.

pub mod eventwait;
pub mod ident;
pub mod resolve;
pub mod worker;

use std::error;
use std::fmt;
use std::io::{self, Read};
use std::os::unix::io::RawFd;

use tracing::{info, warn};

use crate::lookup::wire::{
    LookupRequest, LookupResponse, WireError, REQUEST_SIZE,
};
use eventwait::{Event, EventWait, WaitError};
use resolve::TimeBudget;
use worker::{SubworkerPool, MAX_SUBWORKERS};

pub use worker::ONESHOT_ARG;

/// The descriptor requests arrive on.
const REQUEST_FD: RawFd = 0;

/// The descriptor responses leave on.
const RESPONSE_FD: RawFd = 1;

//------------ run -----------------------------------------------------------

/// The helper's main loop. Runs until parent death or a fatal error.
///
/// Returns `Ok(())` only for the clean parent-gone shutdown; any error
/// return means the process should exit non-zero.
pub fn run() -> Result<(), SlaveError> {
    let exe = std::env::current_exe().map_err(SlaveError::Init)?;
    let mut pool = SubworkerPool::new(MAX_SUBWORKERS, exe);

    let mut waiter = EventWait::init().map_err(SlaveError::Init)?;
    waiter.watch_readable(REQUEST_FD).map_err(SlaveError::Init)?;
    waiter.watch_parent_exit().map_err(SlaveError::Init)?;
    waiter.watch_child_exit().map_err(SlaveError::Init)?;

    info!("starting event loop using {}", waiter.strategy_name());

    loop {
        match waiter.wait() {
            Ok(Event::Readable(_)) => {}
            Ok(Event::ParentExited) => {
                info!("parent server exited; shutting down");
                return Ok(());
            }
            Ok(Event::ChildExited) => {
                pool.reap();
                continue;
            }
            Err(WaitError::Interrupted) => {
                pool.reap();
                continue;
            }
            Err(WaitError::Fatal(err)) => {
                return Err(SlaveError::Channel(err));
            }
        }

        // One byte over the contract size so truncation is detectable.
        let mut buf = [0; REQUEST_SIZE + 1];
        let len = match recv_dgram(REQUEST_FD, &mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SlaveError::Channel(err)),
        };
        let request = LookupRequest::parse(&buf[..len])
            .map_err(SlaveError::Protocol)?;
        let datagram: [u8; REQUEST_SIZE] =
            buf[..REQUEST_SIZE].try_into().expect("parse checked the size");

        pool.reap();
        if pool.has_capacity() {
            match pool.spawn(&datagram) {
                Ok(()) => continue,
                Err(err) => {
                    warn!("cannot start sub-worker, resolving inline: {err}");
                }
            }
        }

        // At the fan-out cap, or the spawn failed: resolve right here,
        // blocking the loop until done.
        let response = build_response(&request);
        send_dgram(RESPONSE_FD, &response.compose())
            .map_err(SlaveError::Channel)?;
    }
}

//------------ run_oneshot ---------------------------------------------------

/// The sub-worker mode: one request in on stdin, one response out, exit.
pub fn run_oneshot() -> Result<(), SlaveError> {
    let mut buf = [0; REQUEST_SIZE];
    io::stdin()
        .lock()
        .read_exact(&mut buf)
        .map_err(SlaveError::Channel)?;
    let request =
        LookupRequest::parse(&buf).map_err(SlaveError::Protocol)?;
    let response = build_response(&request);
    send_dgram(RESPONSE_FD, &response.compose())
        .map_err(SlaveError::Channel)
}

//------------ build_response ------------------------------------------------

/// Performs the blocking lookup steps for one request.
///
/// Infallible by contract: every failure along the way degrades to its
/// documented fallback value and the response is produced regardless.
pub fn build_response(request: &LookupRequest) -> LookupResponse {
    let remote = request.remote.to_socket_addr();
    let local = request.local.to_socket_addr();

    let ipaddr = resolve::numeric_host(remote);
    let local_port = resolve::local_port(local);

    let budget = TimeBudget::new(request.timeout);

    let ident = match (request.want_ident, local, remote) {
        (true, Some(local), Some(remote)) => {
            ident::query(local, remote, &budget).unwrap_or_default()
        }
        _ => String::new(),
    };

    let hostname = match (request.want_dns, remote) {
        (true, Some(remote)) => resolve::reverse_dns(&remote, &budget)
            .unwrap_or_else(|| ipaddr.clone()),
        _ => ipaddr.clone(),
    };

    LookupResponse {
        handle: request.handle,
        ipaddr,
        hostname,
        ident,
        local_port,
    }
}

//------------ SlaveError ----------------------------------------------------

/// A terminal condition in the helper process.
#[derive(Debug)]
pub enum SlaveError {
    /// Setting up the event loop or worker pool failed.
    Init(io::Error),

    /// A received datagram violated the protocol contract.
    Protocol(WireError),

    /// Reading or writing the channel failed for real.
    Channel(io::Error),
}

impl fmt::Display for SlaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaveError::Init(err) => {
                write!(f, "event loop initialization failed: {err}")
            }
            SlaveError::Protocol(err) => {
                write!(f, "protocol violation: {err}")
            }
            SlaveError::Channel(err) => {
                write!(f, "channel I/O failed: {err}")
            }
        }
    }
}

impl error::Error for SlaveError {}

//------------ Datagram I/O --------------------------------------------------

/// Receives one whole datagram from a raw descriptor.
fn recv_dgram(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sends one whole datagram to a raw descriptor.
fn send_dgram(fd: RawFd, data: &[u8]) -> io::Result<()> {
    let n = unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else if n as usize != data.len() {
        Err(io::Error::new(io::ErrorKind::Other, "short send"))
    } else {
        Ok(())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::addr::{AddrBlob, ADDR_BLOB_LEN};
    use crate::lookup::Handle;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn request_for(remote: &str, want_dns: bool) -> LookupRequest {
        LookupRequest {
            handle: Handle(9),
            local: "127.0.0.1:4201".parse::<SocketAddr>().unwrap().into(),
            remote: remote.parse::<SocketAddr>().unwrap().into(),
            want_dns,
            want_ident: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn numeric_only_lookup_echoes_the_address() {
        let response =
            build_response(&request_for("127.0.0.1:50000", false));
        assert_eq!(response.handle, Handle(9));
        assert_eq!(response.ipaddr, "127.0.0.1");
        assert_eq!(response.hostname, "127.0.0.1");
        assert_eq!(response.ident, "");
        assert_eq!(response.local_port, 4201);
    }

    #[test]
    fn garbled_addresses_still_produce_a_response() {
        let request = LookupRequest {
            handle: Handle(3),
            local: AddrBlob::from_wire([0xff; ADDR_BLOB_LEN], 4),
            remote: AddrBlob::from_wire([0xff; ADDR_BLOB_LEN], 4),
            want_dns: true,
            want_ident: true,
            timeout: Duration::from_secs(1),
        };
        let response = build_response(&request);
        assert_eq!(response.ipaddr, resolve::FALLBACK_ADDR_TEXT);
        // The hostname falls back to whatever the numeric field holds.
        assert_eq!(response.hostname, response.ipaddr);
        assert_eq!(response.ident, "");
        assert_eq!(response.local_port, -1);
    }

    #[test]
    fn exhausted_budget_degrades_to_numeric() {
        let mut request = request_for("127.0.0.1:50000", true);
        request.want_ident = true;
        request.timeout = Duration::ZERO;
        let response = build_response(&request);
        assert_eq!(response.hostname, response.ipaddr);
        assert_eq!(response.ident, "");
    }
}
