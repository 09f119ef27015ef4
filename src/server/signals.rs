//! Process signals, turned into events the loop consumes at its own pace.
//!
//! Signal delivery is asynchronous, but nothing real happens inside a
//! handler: the runtime's signal driver just wakes the multiplexer's
//! readiness wait, and the actual work — closing sockets, writing dumps,
//! reaping the lookup helper — runs synchronously in the loop's own
//! iteration where it cannot race connection or allocator state.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

//------------ SignalEvent ---------------------------------------------------

/// A signal-driven request the loop should act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM: shut the server down.
    Shutdown,

    /// SIGUSR2: write a checkpoint dump.
    Dump,

    /// SIGCHLD: some child process exited; check on the lookup helper.
    ChildExited,
}

//------------ Signals -------------------------------------------------------

/// The signal streams the server listens on.
pub struct Signals {
    term: Signal,
    int: Signal,
    usr2: Signal,
    chld: Signal,
}

impl Signals {
    /// Installs the handlers.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            usr2: signal(SignalKind::user_defined2())?,
            chld: signal(SignalKind::child())?,
        })
    }

    /// Resolves when any watched signal arrives.
    pub async fn next(&mut self) -> SignalEvent {
        tokio::select! {
            Some(_) = self.term.recv() => SignalEvent::Shutdown,
            Some(_) = self.int.recv() => SignalEvent::Shutdown,
            Some(_) = self.usr2.recv() => SignalEvent::Dump,
            Some(_) = self.chld.recv() => SignalEvent::ChildExited,
            else => std::future::pending::<SignalEvent>().await,
        }
    }
}
