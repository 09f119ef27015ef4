//! The seam between the multiplexer and the game proper.
//!
//! Everything the loop knows about the game fits in one trait: it hands
//! over freshly resolved connections, completed command lines, and
//! per-tick queue budgets, and asks when the next scheduled action is
//! due. The game talks back exclusively through the connection table's
//! non-blocking queueing calls.

use std::time::Duration;

use crate::lookup::Handle;

use super::connection::ConnSource;
use super::table::ConnectionTable;

//------------ CommandOutcome ------------------------------------------------

/// What the game wants done with a connection after one command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandOutcome {
    /// Nothing special; keep going.
    Continue,

    /// Drop the authenticated identity but keep the connection, back at
    /// the login screen.
    Logout,

    /// Close the connection.
    Disconnect,

    /// Shut the whole server down.
    Shutdown,

    /// Restart the server in place, preserving connections.
    Reboot,
}

//------------ GameService ---------------------------------------------------

/// The game logic driven by the event multiplexer.
pub trait GameService {
    /// A connection finished its hostname lookup and is ready to play.
    ///
    /// The connection is already in the table; this is where the welcome
    /// screen gets queued.
    fn accept_new_player(
        &mut self,
        table: &mut ConnectionTable,
        handle: Handle,
        hostname: &str,
        ip: &str,
        source: ConnSource,
    );

    /// One complete command line from one connection.
    fn dispatch_command(
        &mut self,
        table: &mut ConnectionTable,
        handle: Handle,
        line: &str,
    ) -> CommandOutcome;

    /// Runs up to `budget` queued game actions; returns how many ran.
    fn process_queued_actions(
        &mut self,
        table: &mut ConnectionTable,
        budget: usize,
    ) -> usize;

    /// Time until the next queued game action is due, if any is queued.
    fn next_action_due(&self) -> Option<Duration>;

    /// A connection is gone, with the reason the server logged.
    fn connection_closed(&mut self, handle: Handle, reason: &str) {
        let _ = (handle, reason);
    }

    /// A checkpoint dump was requested from outside.
    fn dump_state(&mut self) {}
}
