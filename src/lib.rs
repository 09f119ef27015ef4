//! Networking core for a MUD-style server.
//!
//! This crate provides the pieces of a text game server that actually
//! constitute systems programming: a single-threaded readiness-driven
//! connection multiplexer, and a privilege-separated helper process that
//! performs blocking reverse-DNS and ident lookups so the main loop never
//! stalls on a slow resolver.
//!
//! # Modules
//!
//! * [lookup] contains the wire protocol spoken between the server and the
//!   lookup helper process, and the server-side channel that manages the
//!   helper's lifecycle and request correlation.
//! * [slave] contains the helper process itself: a portable event-wait
//!   abstraction, the blocking resolution routines, the ident client, and
//!   the bounded sub-worker pool. It is synchronous by design; all of its
//!   blocking happens outside the main server process.
//! * [server] contains the main process: the connection table with its
//!   buffered I/O queues and command-rate quotas, the event multiplexer
//!   loop, signal handling, and the reboot continuity file.
//!
//! The `mudnetd` binary wires these together with a minimal built-in game
//! service; real games implement [`server::service::GameService`] instead.
//!
//! # Process model
//!
//! The main server is cooperative and single-threaded: it runs the
//! multiplexer as one task on a current-thread Tokio runtime. The lookup
//! helper is a separate OS process communicating over a connected datagram
//! socketpair, itself single-threaded and free to block. The two never
//! share memory; everything crosses the boundary through the fixed-layout
//! datagrams in [`lookup::wire`].

#![cfg(unix)]

pub mod lookup;
pub mod server;
pub mod slave;
pub mod utils;
