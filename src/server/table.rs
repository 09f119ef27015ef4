//! The table of live connections.
//!
//! Owned and mutated exclusively by the multiplexer's thread; the
//! queueing calls here are the only way the rest of the system touches a
//! connection, and none of them can block.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::lookup::Handle;

use super::connection::Connection;
use super::metrics::ServerMetrics;

//------------ ConnectionTable -----------------------------------------------

/// All live connections, keyed by handle.
pub struct ConnectionTable {
    /// The connections. Ordered so per-tick iteration is deterministic.
    conns: BTreeMap<Handle, Connection>,

    /// Ceiling applied to every connection's output queue.
    output_ceiling: usize,

    /// Shared server metrics.
    metrics: Arc<ServerMetrics>,
}

impl ConnectionTable {
    /// Creates an empty table.
    pub fn new(output_ceiling: usize, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            conns: BTreeMap::new(),
            output_ceiling,
            metrics,
        }
    }

    /// The number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Adds a connection.
    pub fn insert(&mut self, conn: Connection) {
        self.metrics.inc_num_connections();
        self.conns.insert(conn.handle(), conn);
    }

    /// Removes a connection, handing its state back to the caller.
    pub fn remove(&mut self, handle: Handle) -> Option<Connection> {
        let conn = self.conns.remove(&handle);
        if conn.is_some() {
            self.metrics.dec_num_connections();
        }
        conn
    }

    /// Looks a connection up by its handle.
    pub fn get(&self, handle: Handle) -> Option<&Connection> {
        self.conns.get(&handle)
    }

    /// Looks a connection up by its handle, mutably.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        self.conns.get_mut(&handle)
    }

    /// All handles, in iteration order.
    ///
    /// Materialized so callers can mutate the table while walking.
    pub fn handles(&self) -> Vec<Handle> {
        self.conns.keys().copied().collect()
    }

    /// Iterates over the connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// The handles belonging to an authenticated identity.
    pub fn find_by_identity(&self, player: i64) -> Vec<Handle> {
        self.conns
            .values()
            .filter(|conn| conn.player() == Some(player))
            .map(|conn| conn.handle())
            .collect()
    }

    /// Queues raw bytes for a connection. Non-blocking, always queued.
    pub fn enqueue_output(&mut self, handle: Handle, data: &[u8]) {
        let ceiling = self.output_ceiling;
        if let Some(conn) = self.conns.get_mut(&handle) {
            if conn.enqueue_output(data, ceiling) {
                self.metrics.inc_num_output_flushes();
            }
        }
    }

    /// Queues a line of text for a connection, with line ending.
    pub fn notify(&mut self, handle: Handle, text: &str) {
        let mut data = Vec::with_capacity(text.len() + 2);
        data.extend_from_slice(text.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.enqueue_output(handle, &data);
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Table behaviour that needs real sockets is exercised with the
    // multiplexer's tests; identity lookup needs none.
    #[test]
    fn identity_lookup_on_empty_table() {
        let table =
            ConnectionTable::new(1024, Arc::new(ServerMetrics::new()));
        assert!(table.find_by_identity(42).is_empty());
        assert!(table.is_empty());
    }
}
