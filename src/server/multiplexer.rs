//! The main server loop.
//!
//! One task drives everything: accepts, lookup responses, client reads
//! and writes, command-rate bookkeeping, and the timed game tick. Each
//! iteration refreshes quotas, processes at most one buffered command
//! per connection, acts on any signal flags, recomputes the wait
//! deadline, and then suspends in a single readiness wait over the
//! listener, the lookup channel, and every connection that wants
//! service.
//!
//! Fairness comes from two rules working together. A connection with a
//! complete command already buffered is left out of the read set — its
//! bytes are in memory, reading more would only grow the backlog — and
//! instead the wait deadline shrinks so the next iteration comes around
//! immediately while quota lasts. And since each iteration takes at most
//! one command from each connection, a client that pastes a hundred
//! commands shares every round with everyone else instead of hogging
//! the loop until its backlog drains.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::lookup::channel::{LookupChannel, SubmitOutcome};
use crate::lookup::wire::LookupResponse;
use crate::lookup::Handle;

use super::config::Config;
use super::connection::{ConnSource, Connection};
use super::metrics::ServerMetrics;
use super::service::{CommandOutcome, GameService};
use super::signals::{SignalEvent, Signals};
use super::table::ConnectionTable;

/// Longest the loop will sleep with nothing at all to wait for.
const IDLE_WAIT: Duration = Duration::from_secs(1);

//------------ ExitReason ----------------------------------------------------

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// Orderly shutdown; close everything.
    Shutdown,

    /// In-place restart; write the reboot file and re-exec.
    Reboot,
}

//------------ EventMultiplexer ----------------------------------------------

/// A socket accepted but still waiting on its hostname lookup.
struct PendingConn {
    stream: TcpStream,
    peer: SocketAddr,
}

/// What one readiness wait produced.
enum Tick {
    Signal(SignalEvent),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    LookupReady,
    ConnReady(Vec<(Handle, Ready)>),
    TimedOut,
}

/// The single-threaded driver of all server I/O.
pub struct EventMultiplexer<Svc> {
    /// User supplied settings that influence our behaviour.
    config: Config,

    /// The listening socket.
    listener: TcpListener,

    /// The port the listener actually bound, for source classification.
    listen_port: u16,

    /// The lookup offload channel.
    lookup: LookupChannel,

    /// All established connections.
    table: ConnectionTable,

    /// Accepted sockets whose hostname lookup is still in flight.
    awaiting_lookup: HashMap<Handle, PendingConn>,

    /// The next connection handle to allocate.
    next_handle: u32,

    /// Signal streams feeding the flag checks.
    signals: Signals,

    /// Shared server metrics.
    metrics: Arc<ServerMetrics>,

    /// The game.
    service: Svc,

    /// Start of the current command-rate slice.
    last_slice: Instant,

    /// Signal flags, acted on at the top of each iteration.
    shutdown_requested: bool,
    reboot_requested: bool,
    dump_requested: bool,
    child_exited: bool,
}

impl<Svc: GameService> EventMultiplexer<Svc> {
    /// Binds the listener and assembles a multiplexer around it.
    pub async fn bind(
        config: Config,
        lookup: LookupChannel,
        service: Svc,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Self::from_parts(config, listener, lookup, service)
    }

    /// Assembles a multiplexer around an existing listener.
    ///
    /// Used when resuming from a reboot file, where the listener came
    /// through the re-exec rather than a fresh bind.
    pub fn from_parts(
        config: Config,
        listener: TcpListener,
        lookup: LookupChannel,
        service: Svc,
    ) -> io::Result<Self> {
        let listen_port = listener.local_addr()?.port();
        let metrics = Arc::new(ServerMetrics::new());
        let table =
            ConnectionTable::new(config.output_ceiling(), metrics.clone());
        Ok(Self {
            config,
            listener,
            listen_port,
            lookup,
            table,
            awaiting_lookup: HashMap::new(),
            next_handle: 1,
            signals: Signals::new()?,
            metrics,
            service,
            last_slice: Instant::now(),
            shutdown_requested: false,
            reboot_requested: false,
            dump_requested: false,
            child_exited: false,
        })
    }

    //--- Access

    /// The configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The connection table, e.g. for restoring reboot-file records.
    pub fn table_mut(&mut self) -> &mut ConnectionTable {
        &mut self.table
    }

    /// The connection table.
    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Shared server metrics.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// The lookup channel.
    pub fn lookup_mut(&mut self) -> &mut LookupChannel {
        &mut self.lookup
    }

    /// The raw descriptor of the listening socket, for the reboot file.
    pub fn listener_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.listener.as_raw_fd()
    }

    /// Adds a restored connection and bumps the handle allocator past it.
    pub fn adopt_connection(&mut self, conn: Connection) {
        self.next_handle = self.next_handle.max(conn.handle().0 + 1);
        self.table.insert(conn);
    }

    //--- Control

    /// Runs until shutdown or reboot is requested, or a fatal error.
    ///
    /// Errors on the listening socket or the readiness wait itself are
    /// fatal; everything scoped to one connection or to the lookup
    /// subsystem is absorbed along the way.
    pub async fn run(&mut self) -> io::Result<ExitReason> {
        info!(
            "listening on port {}, lookups {}",
            self.listen_port,
            if self.lookup.is_halted() {
                "disabled"
            } else {
                "offloaded"
            },
        );
        loop {
            if let Some(reason) = self.tick().await? {
                self.lookup.shutdown().await;
                return Ok(reason);
            }
        }
    }

    /// One full iteration of the loop.
    async fn tick(&mut self) -> io::Result<Option<ExitReason>> {
        let now = Instant::now();
        self.update_quotas(now);
        self.process_buffered_commands();

        // Signal flags get acted on here, in loop context, never in a
        // handler.
        if self.child_exited {
            self.child_exited = false;
            self.lookup.handle_child_exit();
        }
        if self.dump_requested {
            self.dump_requested = false;
            info!("checkpoint dump requested");
            self.service.dump_state();
        }
        if self.shutdown_requested {
            return Ok(Some(ExitReason::Shutdown));
        }
        if self.reboot_requested {
            return Ok(Some(ExitReason::Reboot));
        }

        // Re-send anything the helper should have answered by now, and
        // give up numerically on handles that can no longer be served.
        for handle in self.lookup.resubmit_stale(now) {
            self.establish_without_lookup(handle);
        }
        self.metrics
            .set_num_pending_lookups(self.lookup.num_pending());

        let deadline = self.wait_deadline(now);
        let mut serviced_io = false;
        match self.wait_for_readiness(deadline).await {
            Tick::Signal(SignalEvent::Shutdown) => {
                info!("shutdown requested by signal");
                self.shutdown_requested = true;
            }
            Tick::Signal(SignalEvent::Dump) => {
                self.dump_requested = true;
            }
            Tick::Signal(SignalEvent::ChildExited) => {
                self.child_exited = true;
            }
            Tick::LookupReady => {
                if let Some(response) = self.lookup.drain_ready() {
                    self.establish_resolved(response);
                }
            }
            Tick::Accepted(Ok((stream, peer))) => {
                self.handle_accept(stream, peer, now);
            }
            Tick::Accepted(Err(err)) => {
                if is_transient_accept_error(&err) {
                    warn!("accept failed transiently: {err}");
                } else {
                    return Err(err);
                }
            }
            Tick::ConnReady(events) => {
                serviced_io = true;
                for (handle, ready) in events {
                    self.service_connection(handle, ready);
                }
            }
            Tick::TimedOut => {
                self.service.process_queued_actions(
                    &mut self.table,
                    self.config.queue_chunk(),
                );
            }
        }

        if serviced_io && self.config.active_queue_chunk() > 0 {
            self.service.process_queued_actions(
                &mut self.table,
                self.config.active_queue_chunk(),
            );
        }

        Ok(None)
    }

    //--- The readiness wait

    /// When the next iteration must happen even without I/O.
    fn wait_deadline(&self, now: Instant) -> Instant {
        let mut runnable = false;
        let mut starved = false;
        for conn in self.table.iter() {
            if conn.has_buffered_command() {
                if conn.quota_tokens() > 0 {
                    runnable = true;
                } else {
                    starved = true;
                }
            }
        }

        // Work is ready right now; only already-ready I/O may jump the
        // queue (the wait is biased toward it).
        if runnable {
            return now;
        }

        let mut deadline = now + IDLE_WAIT;
        if starved {
            // Wake when the slice rolls over and quota refreshes.
            deadline =
                deadline.min(self.last_slice + self.config.command_slice());
        }
        if let Some(due) = self.service.next_action_due() {
            deadline = deadline.min(now + due);
        }
        deadline
    }

    /// The single suspension point: waits for whatever comes first.
    async fn wait_for_readiness(&mut self, deadline: Instant) -> Tick {
        let accepting = self.table.len() + self.awaiting_lookup.len()
            < self.config.max_connections();

        // Readiness interest per connection: readable unless a command
        // is already buffered, writable when output is queued. The
        // futures own their handles so the table stays free to borrow.
        let mut readiness: FuturesUnordered<_> = self
            .table
            .iter()
            .filter_map(|conn| {
                let mut interest = if conn.has_buffered_command() {
                    None
                } else {
                    Some(Interest::READABLE)
                };
                if conn.has_queued_output() {
                    interest = Some(match interest {
                        Some(interest) => interest | Interest::WRITABLE,
                        None => Interest::WRITABLE,
                    });
                }
                let interest = interest?;
                let stream = conn.stream().clone();
                let handle = conn.handle();
                Some(async move {
                    (handle, stream.ready(interest).await)
                })
            })
            .collect();

        let mut decision = tokio::select! {
            // Poll in match arm order: commands and lookup responses
            // outrank accepts, accepts outrank established-connection
            // I/O, and the timeout comes last.
            biased;

            event = self.signals.next() => Tick::Signal(event),

            _ = self.lookup.readable(), if self.lookup.can_drain() => {
                Tick::LookupReady
            }

            result = self.listener.accept(), if accepting => {
                Tick::Accepted(result)
            }

            Some((handle, ready)) = readiness.next() => {
                Tick::ConnReady(vec![(handle, flatten_ready(ready))])
            }

            _ = sleep_until(deadline) => Tick::TimedOut,
        };

        // Everything else that is ready this instant gets serviced in
        // the same iteration.
        if let Tick::ConnReady(ref mut events) = decision {
            while let Some(Some((handle, ready))) =
                readiness.next().now_or_never()
            {
                events.push((handle, flatten_ready(ready)));
            }
        }

        decision
    }

    //--- Commands and quotas

    /// Credits quota tokens for every whole slice that has elapsed.
    fn update_quotas(&mut self, now: Instant) {
        let slice = self.config.command_slice();
        let elapsed = now.saturating_duration_since(self.last_slice);
        let slices = (elapsed.as_millis() / slice.as_millis()) as u32;
        if slices == 0 {
            return;
        }
        let per_slice = self.config.commands_per_slice();
        let ceiling = self.config.burst_ceiling();
        for handle in self.table.handles() {
            if let Some(conn) = self.table.get_mut(handle) {
                conn.refresh_quota(slices, per_slice, ceiling);
            }
        }
        self.last_slice += slice * slices;
    }

    /// Takes at most one buffered command from each connection.
    fn process_buffered_commands(&mut self) {
        for handle in self.table.handles() {
            let Some(conn) = self.table.get_mut(handle) else {
                continue;
            };
            let Some(line) = conn.take_command() else {
                continue;
            };
            self.metrics.inc_num_commands_processed();
            match self.service.dispatch_command(
                &mut self.table,
                handle,
                &line,
            ) {
                CommandOutcome::Continue => {}
                CommandOutcome::Logout => {
                    if let Some(conn) = self.table.get_mut(handle) {
                        conn.set_player(None);
                    }
                }
                CommandOutcome::Disconnect => {
                    self.close_connection(handle, "logout");
                }
                CommandOutcome::Shutdown => {
                    self.shutdown_requested = true;
                }
                CommandOutcome::Reboot => {
                    self.reboot_requested = true;
                }
            }
        }
    }

    //--- Accepts and lookup completion

    /// A fresh connection from the listener.
    fn handle_accept(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        now: Instant,
    ) {
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(err) => {
                warn!("accepted socket has no local address: {err}");
                return;
            }
        };
        let handle = Handle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        debug!("[{handle}] accepted connection from {peer}");

        if self.lookup.is_halted() {
            self.establish(handle, stream, peer.ip().to_string(), None);
            return;
        }
        match self.lookup.submit(handle, local, peer, now) {
            SubmitOutcome::Queued => {
                self.awaiting_lookup
                    .insert(handle, PendingConn { stream, peer });
            }
            SubmitOutcome::Degraded => {
                self.establish(
                    handle,
                    stream,
                    peer.ip().to_string(),
                    None,
                );
            }
        }
    }

    /// A lookup response arrived; finish setting its connection up.
    fn establish_resolved(&mut self, response: LookupResponse) {
        let Some(pending) = self.awaiting_lookup.remove(&response.handle)
        else {
            debug!(
                "response for handle {} has no waiting connection",
                response.handle
            );
            return;
        };
        let details = response_details(&response);
        self.establish(
            response.handle,
            pending.stream,
            response.ipaddr,
            Some(details),
        );
    }

    /// Lookup gave up on this handle; set its connection up numerically.
    fn establish_without_lookup(&mut self, handle: Handle) {
        let Some(pending) = self.awaiting_lookup.remove(&handle) else {
            return;
        };
        let ip = pending.peer.ip().to_string();
        self.establish(handle, pending.stream, ip, None);
    }

    /// Moves a socket into the connection table and tells the game.
    fn establish(
        &mut self,
        handle: Handle,
        stream: TcpStream,
        ip: String,
        resolved: Option<(String, i32)>,
    ) {
        let (hostname, local_port) = match resolved {
            Some((hostname, port)) => (hostname, port),
            None => {
                let port = stream
                    .local_addr()
                    .map(|addr| addr.port().into())
                    .unwrap_or(-1);
                (ip.clone(), port)
            }
        };
        let source = if local_port == i32::from(self.listen_port) {
            ConnSource::Plain
        } else {
            ConnSource::Unknown
        };

        info!(
            "[{handle}/{hostname}/{ip}] connection opened from {source}"
        );

        let conn = Connection::new(
            handle,
            Arc::new(stream),
            source,
            hostname.clone(),
            ip.clone(),
            self.config.burst_ceiling(),
        );
        self.table.insert(conn);
        self.service.accept_new_player(
            &mut self.table,
            handle,
            &hostname,
            &ip,
            source,
        );
    }

    //--- Established-connection I/O

    /// Services one connection the readiness wait reported.
    fn service_connection(&mut self, handle: Handle, ready: Ready) {
        if ready.is_readable() || ready.is_read_closed() {
            let ceiling = self.config.output_ceiling();
            let Some(conn) = self.table.get_mut(handle) else {
                return;
            };
            match conn.pump_input(ceiling) {
                Ok(_) => {}
                Err(err)
                    if err.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    self.close_connection(handle, "disconnect");
                    return;
                }
                Err(err) => {
                    debug!("[{handle}] read failed: {err}");
                    self.close_connection(handle, "socket error");
                    return;
                }
            }
        }
        if ready.is_writable() {
            if let Some(conn) = self.table.get_mut(handle) {
                if let Err(err) = conn.pump_output() {
                    debug!("[{handle}] write failed: {err}");
                    self.close_connection(handle, "socket error");
                }
            }
        }
    }

    /// Tears one connection down. Only ever this one; never the loop.
    fn close_connection(&mut self, handle: Handle, reason: &str) {
        if let Some(mut conn) = self.table.remove(handle) {
            // Best effort on whatever output is still queued.
            let _ = conn.pump_output();
            info!(
                "[{handle}/{}/{}] connection closed: {reason}",
                conn.hostname(),
                conn.ip()
            );
            self.service.connection_closed(handle, reason);
        }
        self.lookup.forget(handle);
    }
}

//------------ Helper Functions ----------------------------------------------

/// Pulls the fields connection setup needs out of a response.
fn response_details(response: &LookupResponse) -> (String, i32) {
    let hostname = if response.hostname.is_empty() {
        response.ipaddr.clone()
    } else {
        response.hostname.clone()
    };
    (hostname, response.local_port)
}

/// Folds a readiness error into "both directions ready".
///
/// The subsequent read attempt surfaces the real error and closes the
/// connection through the ordinary path.
fn flatten_ready(ready: io::Result<Ready>) -> Ready {
    ready.unwrap_or(Ready::READABLE | Ready::WRITABLE)
}

/// Accept errors that mean "this connection", not "the listener".
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::channel::Config as LookupConfig;
    use tokio::io::AsyncWriteExt;

    /// A game that records everything the loop tells it.
    #[derive(Default)]
    struct Recorder {
        accepted: Vec<Handle>,
        dispatched: Vec<(Handle, String)>,
        closed: Vec<(Handle, String)>,
    }

    impl GameService for Recorder {
        fn accept_new_player(
            &mut self,
            table: &mut ConnectionTable,
            handle: Handle,
            _hostname: &str,
            _ip: &str,
            _source: ConnSource,
        ) {
            self.accepted.push(handle);
            table.notify(handle, "welcome");
        }

        fn dispatch_command(
            &mut self,
            _table: &mut ConnectionTable,
            handle: Handle,
            line: &str,
        ) -> CommandOutcome {
            self.dispatched.push((handle, line.to_owned()));
            CommandOutcome::Continue
        }

        fn process_queued_actions(
            &mut self,
            _table: &mut ConnectionTable,
            _budget: usize,
        ) -> usize {
            0
        }

        fn next_action_due(&self) -> Option<Duration> {
            None
        }

        fn connection_closed(&mut self, handle: Handle, reason: &str) {
            self.closed.push((handle, reason.to_owned()));
        }
    }

    async fn test_mux() -> (EventMultiplexer<Recorder>, SocketAddr) {
        let mut config = Config::new();
        config.set_listen_addr("127.0.0.1:0".parse().unwrap());
        let mut lookup_config = LookupConfig::new();
        lookup_config.set_enabled(false);
        let mux = EventMultiplexer::bind(
            config,
            LookupChannel::new(lookup_config),
            Recorder::default(),
        )
        .await
        .unwrap();
        let port = mux.listen_port;
        (mux, format!("127.0.0.1:{port}").parse().unwrap())
    }

    async fn tick_until<S, F>(mux: &mut EventMultiplexer<S>, mut done: F)
    where
        S: GameService,
        F: FnMut(&EventMultiplexer<S>) -> bool,
    {
        for _ in 0..10_000 {
            if done(mux) {
                return;
            }
            mux.tick().await.unwrap();
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn accept_welcome_and_dispatch() {
        let (mut mux, addr) = test_mux().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut mux, |mux| !mux.service.accepted.is_empty())
            .await;

        client.write_all(b"look around\r\n").await.unwrap();
        tick_until(&mut mux, |mux| !mux.service.dispatched.is_empty())
            .await;

        assert_eq!(mux.service.dispatched[0].1, "look around");
        assert_eq!(mux.table.len(), 1);

        // The welcome text queued by the service eventually flushes.
        let handle = mux.service.accepted[0];
        tick_until(&mut mux, |mux| {
            mux.table
                .get(handle)
                .is_some_and(|conn| !conn.has_queued_output())
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn pasted_backlog_drains_one_per_iteration_without_starvation() {
        let (mut mux, addr) = test_mux().await;

        let mut chatty = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut mux, |mux| mux.service.accepted.len() == 1)
            .await;
        let mut quiet = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut mux, |mux| mux.service.accepted.len() == 2)
            .await;
        let chatty_handle = mux.service.accepted[0];
        let quiet_handle = mux.service.accepted[1];

        // One packet with a hundred commands, then one from the other
        // connection.
        let mut paste = String::new();
        for n in 0..100 {
            paste.push_str(&format!("cmd{n}\r\n"));
        }
        chatty.write_all(paste.as_bytes()).await.unwrap();
        quiet.write_all(b"hello\r\n").await.unwrap();

        tick_until(&mut mux, |mux| {
            mux.service
                .dispatched
                .iter()
                .filter(|(handle, _)| *handle == chatty_handle)
                .count()
                == 100
        })
        .await;

        // The quiet connection was not starved behind the backlog: its
        // command landed within the first few rounds.
        let quiet_pos = mux
            .service
            .dispatched
            .iter()
            .position(|(handle, _)| *handle == quiet_handle)
            .expect("quiet connection was serviced");
        assert!(
            quiet_pos < 5,
            "quiet command processed at position {quiet_pos}"
        );

        // The backlog drained in order, one per iteration.
        let chatty_lines: Vec<&str> = mux
            .service
            .dispatched
            .iter()
            .filter(|(handle, _)| *handle == chatty_handle)
            .map(|(_, line)| line.as_str())
            .collect();
        assert_eq!(chatty_lines[0], "cmd0");
        assert_eq!(chatty_lines[99], "cmd99");
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_closes_the_connection() {
        let (mut mux, addr) = test_mux().await;

        let client = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut mux, |mux| !mux.service.accepted.is_empty())
            .await;
        drop(client);

        tick_until(&mut mux, |mux| !mux.service.closed.is_empty()).await;
        assert_eq!(mux.table.len(), 0);
        assert_eq!(mux.service.closed[0].1, "disconnect");
    }
}
