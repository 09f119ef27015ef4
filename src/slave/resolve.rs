//! The blocking resolution steps behind one lookup.
//!
//! Everything here is allowed to block: it runs in the helper process or
//! one of its sub-workers, never in the main server. Each step degrades to
//! a documented fallback on failure so a response can always be produced.

use std::ffi::CStr;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Numeric-address text used when the peer address cannot be decoded.
///
/// Purely a wire-visible fallback; no client protocol depends on the
/// exact text.
pub const FALLBACK_ADDR_TEXT: &str = "unknown address";

/// Largest hostname getnameinfo may hand back, including the NUL.
const MAX_HOST: usize = 1025;

//------------ TimeBudget ----------------------------------------------------

/// Wall-clock budget shared by the blocking steps of one lookup.
///
/// The budget is a deadline: every step asks how much is left and gives
/// exactly that to its own socket timeout, so the cumulative time spent
/// never exceeds what the request asked for. A step that finds the budget
/// already spent is abandoned, not retried.
#[derive(Clone, Copy, Debug)]
pub struct TimeBudget {
    deadline: Instant,
}

impl TimeBudget {
    /// Starts a budget of the given length, from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    /// How much budget is left; zero once spent.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Has the budget been spent?
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

//------------ Resolution Steps ----------------------------------------------

/// Textual numeric form of an address, or the documented fallback.
pub fn numeric_host(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.ip().to_string(),
        None => FALLBACK_ADDR_TEXT.into(),
    }
}

/// The port of the local address, -1 when it cannot be determined.
pub fn local_port(addr: Option<SocketAddr>) -> i32 {
    match addr {
        Some(addr) => addr.port().into(),
        None => -1,
    }
}

/// Reverse-resolves an address to a hostname.
///
/// Returns `None` when no name exists, the budget is already spent, or
/// the resolver fails; the caller substitutes the numeric address. The
/// resolver call itself honors the system resolver's own timeouts; the
/// budget is checked before committing to the call.
pub fn reverse_dns(
    addr: &SocketAddr,
    budget: &TimeBudget,
) -> Option<String> {
    if budget.expired() {
        return None;
    }
    let sa = socket2::SockAddr::from(*addr);
    let mut host = [0 as libc::c_char; MAX_HOST];
    let rc = unsafe {
        libc::getnameinfo(
            sa.as_ptr(),
            sa.len(),
            host.as_mut_ptr(),
            host.len() as _,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    let name = name.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_host_formats_addresses() {
        let v4: SocketAddr = "127.0.0.1:4201".parse().unwrap();
        assert_eq!(numeric_host(Some(v4)), "127.0.0.1");
        let v6: SocketAddr = "[::1]:4201".parse().unwrap();
        assert_eq!(numeric_host(Some(v6)), "::1");
    }

    #[test]
    fn numeric_host_falls_back_on_garbage() {
        assert_eq!(numeric_host(None), FALLBACK_ADDR_TEXT);
    }

    #[test]
    fn local_port_reports_unknown_as_negative() {
        let addr: SocketAddr = "192.0.2.1:23".parse().unwrap();
        assert_eq!(local_port(Some(addr)), 23);
        assert_eq!(local_port(None), -1);
    }

    #[test]
    fn budget_expires_and_never_goes_negative() {
        let spent = TimeBudget::new(Duration::ZERO);
        assert!(spent.expired());
        assert_eq!(spent.remaining(), Duration::ZERO);

        let fresh = TimeBudget::new(Duration::from_secs(60));
        assert!(!fresh.expired());
        assert!(fresh.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn expired_budget_abandons_dns_step() {
        let addr: SocketAddr = "127.0.0.1:4201".parse().unwrap();
        let spent = TimeBudget::new(Duration::ZERO);
        assert_eq!(reverse_dns(&addr, &spent), None);
    }
}
