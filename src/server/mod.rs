//! The main server process.
//!
//! Everything here runs on one thread: the [`multiplexer`] is the sole
//! driver of network I/O, accepts, lookup responses, and timed game
//! ticks, suspending only inside its single readiness wait per
//! iteration. The [`connection`] and [`table`] modules hold per-client
//! state — buffered input and output queues, command-rate quotas, telnet
//! session capabilities — that nothing outside the loop mutates.
//!
//! Game logic stays on the far side of the [`service::GameService`]
//! trait: the loop hands it completed commands and tick budgets, and the
//! game hands back text via the connection table's queueing calls, which
//! never block.
//!
//! [`reboot`] persists the connection table across an in-place restart so
//! established sockets survive a server upgrade, and [`signals`] turns
//! asynchronous process signals into flags the loop acts on at a safe
//! point in its own iteration.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod multiplexer;
pub mod reboot;
pub mod service;
pub mod signals;
pub mod table;
pub mod telnet;
