//! The name-lookup offload protocol, server side.
//!
//! Resolving the hostname behind a freshly accepted connection means
//! blocking in the resolver, and the main server loop must never block.
//! The server therefore farms every lookup out to a helper process and
//! reads the answers back asynchronously. Communication is by fixed-size
//! datagrams over a connected socketpair: one datagram per request, one
//! per response, no framing, no pipelining.
//!
//! [`wire`] defines the datagram layout shared with the helper. [`addr`]
//! defines the compact socket-address encoding carried inside requests.
//! [`channel`] is the server-side owner of the helper's lifecycle: it
//! spawns the helper (rate-limited on crash), tracks which requests are in
//! flight, resubmits requests that appear lost, and tears the helper down
//! at shutdown.
//!
//! The helper process itself lives in [`crate::slave`].

pub mod addr;
pub mod channel;
pub mod wire;

use std::fmt;

//------------ Handle --------------------------------------------------------

/// Correlation key for one lookup request.
///
/// Handles are allocated monotonically by the server and are distinct from
/// OS descriptor numbers; a side table maps a handle back to the accepted
/// socket it belongs to. A handle is therefore never reused while a request
/// referencing it is pending, without constraining descriptor reuse.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
