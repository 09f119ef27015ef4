//! Server related metrics.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

//------------ ServerMetrics -------------------------------------------------

/// Metrics describing the status of the server.
///
/// Updated by the multiplexer, readable from anywhere via a shared
/// handle.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    num_connections: AtomicUsize,

    num_pending_lookups: AtomicUsize,

    num_commands_processed: AtomicUsize,

    num_output_flushes: AtomicUsize,
}

impl ServerMetrics {
    /// Constructs zeroed metrics.
    pub fn new() -> Self {
        Default::default()
    }

    /// The number of established connections.
    pub fn num_connections(&self) -> usize {
        self.num_connections.load(Ordering::Relaxed)
    }

    /// The number of lookups submitted but not yet answered.
    pub fn num_pending_lookups(&self) -> usize {
        self.num_pending_lookups.load(Ordering::Relaxed)
    }

    /// The number of client commands processed since startup.
    pub fn num_commands_processed(&self) -> usize {
        self.num_commands_processed.load(Ordering::Relaxed)
    }

    /// How often an output queue hit its ceiling and was collapsed.
    pub fn num_output_flushes(&self) -> usize {
        self.num_output_flushes.load(Ordering::Relaxed)
    }

    pub(super) fn inc_num_connections(&self) {
        self.num_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dec_num_connections(&self) {
        self.num_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(super) fn set_num_pending_lookups(&self, value: usize) {
        self.num_pending_lookups.store(value, Ordering::Relaxed);
    }

    pub(super) fn inc_num_commands_processed(&self) {
        self.num_commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_num_output_flushes(&self) {
        self.num_output_flushes.fetch_add(1, Ordering::Relaxed);
    }
}
