//! The server-side owner of the lookup helper.
//!
//! [`LookupChannel`] spawns the helper process, correlates requests with
//! responses, resubmits requests that look lost, and recovers from helper
//! crashes — all without the rest of the server ever waiting on a lookup.
//! Its lifecycle state machine is Down → Ready → Pending → Ready → …:
//! Down while no helper process exists, Ready while one exists with
//! nothing outstanding, Pending while at least one request has no
//! response yet.
//!
//! The transport is a connected datagram socketpair with no delivery
//! guarantee assumed: a request that stays unanswered past the staleness
//! window is simply sent again. Responses are idempotent to receive —
//! one whose handle is no longer pending is dropped as a duplicate.
//!
//! Crash recovery is rate-limited: more than five spawns within a rolling
//! sixty-second window permanently disables the helper for the rest of
//! the process's life, and every lookup from then on degrades to
//! numeric-address-only connection setup. Availability wins over
//! hostnames.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::UnixDatagram;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::utils::config::DefMinMax;

use super::wire::{LookupRequest, LookupResponse, RESPONSE_SIZE};
use super::Handle;

/// How long a request may stay unanswered before it is resent.
///
/// The value has to be between 1 second and 10 minutes. The default of 30
/// seconds matches how long a full resolver timeout cascade can take; a
/// shorter window would resubmit requests that are merely slow.
const STALENESS_WINDOW: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_secs(1),
    Duration::from_secs(600),
);

/// The per-lookup wall-clock budget passed to the helper.
///
/// The value has to be between 1 and 60 seconds with a default of 5.
const LOOKUP_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(5),
    Duration::from_secs(1),
    Duration::from_secs(60),
);

/// How many helper spawns the rolling window tolerates.
const MAX_SPAWNS_PER_WINDOW: usize = 5;

/// The rolling window for the spawn rate cap.
const SPAWN_WINDOW: Duration = Duration::from_secs(60);

/// How long shutdown waits for the helper to honor SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

//----------- Config ---------------------------------------------------------

/// Configuration for the lookup channel.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the helper executable to spawn.
    slave_path: PathBuf,

    /// How long a request may stay unanswered before it is resent.
    staleness_window: Duration,

    /// The per-lookup wall-clock budget passed to the helper.
    lookup_timeout: Duration,

    /// Ask the helper for reverse-DNS resolution?
    want_dns: bool,

    /// Ask the helper for ident queries?
    want_ident: bool,

    /// Run the helper at all? When false the channel starts out in the
    /// permanently degraded state and every connection is set up with
    /// its numeric address.
    enabled: bool,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the path of the helper executable to spawn.
    pub fn set_slave_path(&mut self, value: PathBuf) {
        self.slave_path = value;
    }

    /// Sets how long a request may stay unanswered before it is resent.
    ///
    /// The value has to be between 1 second and 10 minutes. The default
    /// is 30 seconds.
    pub fn set_staleness_window(&mut self, value: Duration) {
        self.staleness_window = STALENESS_WINDOW.limit(value);
    }

    /// Sets the per-lookup wall-clock budget passed to the helper.
    ///
    /// The value has to be between 1 and 60 seconds. The default is 5
    /// seconds.
    pub fn set_lookup_timeout(&mut self, value: Duration) {
        self.lookup_timeout = LOOKUP_TIMEOUT.limit(value);
    }

    /// Sets whether the helper performs reverse-DNS resolution.
    ///
    /// When disabled, responses carry the numeric address as the
    /// hostname.
    pub fn set_want_dns(&mut self, value: bool) {
        self.want_dns = value;
    }

    /// Sets whether the helper performs ident queries.
    pub fn set_want_ident(&mut self, value: bool) {
        self.want_ident = value;
    }

    /// Sets whether lookup offload runs at all.
    pub fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            slave_path: PathBuf::from("./lookup-slave"),
            staleness_window: STALENESS_WINDOW.default(),
            lookup_timeout: LOOKUP_TIMEOUT.default(),
            want_dns: true,
            want_ident: false,
            enabled: true,
        }
    }
}

//------------ SlaveState ----------------------------------------------------

/// The lifecycle state of the helper process, as the server sees it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlaveState {
    /// No helper process exists.
    Down,

    /// A helper exists and nothing is outstanding.
    Ready,

    /// A helper exists and at least one request awaits its response.
    Pending,
}

//------------ SubmitOutcome -------------------------------------------------

/// What became of a submitted lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// The request is in flight; a response will arrive on the channel.
    Queued,

    /// Lookup is unavailable; set the connection up with its numeric
    /// address only.
    Degraded,
}

//------------ PendingSet ----------------------------------------------------

/// The requests sent but not yet answered.
///
/// At most one entry exists per handle: submitting an already-pending
/// handle refreshes its timestamp and addresses instead of duplicating
/// it. Removal is idempotent.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: HashMap<Handle, PendingLookup>,
}

/// What we need to resend one request from scratch.
#[derive(Clone, Copy, Debug)]
struct PendingLookup {
    local: SocketAddr,
    remote: SocketAddr,
    since: Instant,
}

impl PendingSet {
    /// Inserts or refreshes a pending entry.
    fn insert(
        &mut self,
        handle: Handle,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) {
        self.entries.insert(
            handle,
            PendingLookup {
                local,
                remote,
                since: now,
            },
        );
    }

    /// Removes an entry, reporting whether it was present.
    fn remove(&mut self, handle: Handle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    /// The handles whose entries are older than the staleness window.
    fn stale(&self, now: Instant, window: Duration) -> Vec<Handle> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.since) > window
            })
            .map(|(&handle, _)| handle)
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

//------------ SpawnGate -----------------------------------------------------

/// The rolling-window rate cap on helper spawns.
#[derive(Debug, Default)]
struct SpawnGate {
    attempts: Vec<Instant>,
}

impl SpawnGate {
    /// Records a spawn attempt; false means the cap is exceeded.
    fn allow(&mut self, now: Instant) -> bool {
        self.attempts.retain(|&at| {
            now.saturating_duration_since(at) <= SPAWN_WINDOW
        });
        if self.attempts.len() >= MAX_SPAWNS_PER_WINDOW {
            return false;
        }
        self.attempts.push(now);
        true
    }
}

//------------ SlaveLink -----------------------------------------------------

/// A live helper process and the channel to it.
struct SlaveLink {
    /// Our end of the datagram socketpair.
    sock: UnixDatagram,

    /// The helper process.
    child: Child,

    /// Its pid, for signalling and log lines.
    pid: u32,
}

//------------ LookupChannel -------------------------------------------------

/// The server side of the lookup offload protocol.
pub struct LookupChannel {
    /// User supplied settings that influence our behaviour.
    config: Config,

    /// The helper, while one exists.
    link: Option<SlaveLink>,

    /// Requests sent but not yet answered.
    pending: PendingSet,

    /// The spawn rate cap.
    gate: SpawnGate,

    /// Permanently degraded: no more spawns, ever.
    halted: bool,
}

impl LookupChannel {
    /// Creates a channel. No helper is spawned until the first submit.
    pub fn new(config: Config) -> Self {
        let halted = !config.enabled;
        Self {
            config,
            link: None,
            pending: PendingSet::default(),
            gate: SpawnGate::default(),
            halted,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SlaveState {
        match self.link {
            None => SlaveState::Down,
            Some(_) if self.pending.is_empty() => SlaveState::Ready,
            Some(_) => SlaveState::Pending,
        }
    }

    /// Has lookup offload been permanently disabled?
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// How many requests are outstanding.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// The helper's pid, while one is running.
    pub fn slave_pid(&self) -> Option<u32> {
        self.link.as_ref().map(|link| link.pid)
    }

    /// Is there a response channel worth watching right now?
    pub fn can_drain(&self) -> bool {
        self.link.is_some() && !self.pending.is_empty()
    }

    /// Resolves when the response channel has a datagram ready.
    ///
    /// Never resolves while no helper exists; gate the await on
    /// [`Self::can_drain`].
    pub async fn readable(&self) {
        match &self.link {
            Some(link) => {
                let _ = link.sock.readable().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Submits a lookup for a freshly accepted connection.
    ///
    /// Spawns the helper first if none exists, subject to the rate cap.
    /// [`SubmitOutcome::Degraded`] tells the caller to finish connection
    /// setup immediately with the numeric address; the handle is not
    /// pending in that case.
    pub fn submit(
        &mut self,
        handle: Handle,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> SubmitOutcome {
        if self.halted {
            return SubmitOutcome::Degraded;
        }

        self.pending.insert(handle, local, remote, now);

        if self.link.is_none() {
            if !self.respawn(now) {
                self.pending.remove(handle);
                return SubmitOutcome::Degraded;
            }
            // A fresh helper has seen nothing; resend covers this handle
            // along with anything that was pending across the crash.
            self.resend_pending(now);
            return SubmitOutcome::Queued;
        }

        if let Err(err) = self.send_request(handle, local, remote) {
            warn!("lookup request write failed: {err}");
            // Broken pipe: the helper is gone even if we have not reaped
            // it yet. Respawn and let the new one take over the backlog.
            self.link = None;
            if !self.respawn(now) {
                self.pending.remove(handle);
                return SubmitOutcome::Degraded;
            }
            self.resend_pending(now);
        }
        SubmitOutcome::Queued
    }

    /// Reads exactly one response off the channel, if one is there.
    ///
    /// Returns `None` for spurious wakeups, duplicates of already-drained
    /// handles, and protocol violations (the latter also tears the helper
    /// down for respawn; a helper that garbles a datagram cannot be
    /// trusted with the rest of its queue).
    pub fn drain_ready(&mut self) -> Option<LookupResponse> {
        let link = self.link.as_ref()?;

        // One byte over the contract size so truncation is detectable.
        let mut buf = [0; RESPONSE_SIZE + 1];
        let len = match link.sock.try_recv(&mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return None;
            }
            Err(err) => {
                warn!("reading lookup response: {err}");
                return None;
            }
        };

        match LookupResponse::parse(&buf[..len]) {
            Ok(response) => {
                if self.pending.remove(response.handle) {
                    Some(response)
                } else {
                    debug!(
                        "dropping duplicate response for handle {}",
                        response.handle
                    );
                    None
                }
            }
            Err(err) => {
                error!("lookup helper protocol violation: {err}");
                self.link = None;
                None
            }
        }
    }

    /// Resends requests that have been pending past the staleness window.
    ///
    /// Also the recovery point after a crash: with requests outstanding
    /// and no helper, this respawns and replays the whole backlog.
    /// Returns the handles that can no longer be served at all (the cap
    /// tripped); the caller must finish those connections numerically.
    pub fn resubmit_stale(&mut self, now: Instant) -> Vec<Handle> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        if self.halted {
            return self.drain_all_pending();
        }

        if self.link.is_none() {
            if !self.respawn(now) {
                return if self.halted {
                    self.drain_all_pending()
                } else {
                    // Spawn failed but the cap still has room; leave the
                    // backlog for the next cycle.
                    Vec::new()
                };
            }
            self.resend_pending(now);
            return Vec::new();
        }

        for handle in self.pending.stale(now, self.config.staleness_window)
        {
            let Some(entry) = self.pending.entries.get_mut(&handle) else {
                continue;
            };
            entry.since = now;
            let (local, remote) = (entry.local, entry.remote);
            if let Err(err) = self.send_request(handle, local, remote) {
                warn!("resubmitting lookup {handle}: {err}");
                self.link = None;
                break;
            }
            debug!("resubmitted stale lookup for handle {handle}");
        }
        Vec::new()
    }

    /// Forgets a pending lookup whose connection went away first.
    ///
    /// Idempotent; a late response for the handle will be dropped as a
    /// duplicate.
    pub fn forget(&mut self, handle: Handle) {
        self.pending.remove(handle);
    }

    /// Checks whether the helper is the child that exited.
    ///
    /// Call on child-exit notification. Harmless when the helper is fine;
    /// pending requests survive and are replayed onto the successor by
    /// [`Self::resubmit_stale`].
    pub fn handle_child_exit(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.child.try_wait() {
            Ok(Some(status)) => {
                error!(
                    "lookup helper (pid {}) {}",
                    link.pid,
                    exit_report(status)
                );
                self.link = None;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("checking lookup helper status: {err}");
                self.link = None;
            }
        }
    }

    /// Terminates the helper and waits for it to go.
    ///
    /// Called at server shutdown and before a reboot. SIGTERM first; the
    /// kill-on-drop escalation covers a helper that ignores it.
    pub async fn shutdown(&mut self) {
        self.pending.entries.clear();
        let Some(mut link) = self.link.take() else {
            return;
        };
        info!("terminating lookup helper pid {}", link.pid);
        unsafe {
            libc::kill(link.pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, link.child.wait())
            .await
            .is_err()
        {
            warn!("lookup helper ignored SIGTERM; killing it");
            let _ = link.child.kill().await;
        }
    }

    //--- Internal details

    /// Spawns a helper, honoring the rate cap. False means degraded.
    fn respawn(&mut self, now: Instant) -> bool {
        if !self.gate.allow(now) {
            error!(
                "disabling hostname lookups: helper respawned more than \
                 {MAX_SPAWNS_PER_WINDOW} times in {SPAWN_WINDOW:?}"
            );
            self.halted = true;
            return false;
        }
        match self.spawn_slave() {
            Ok(link) => {
                info!(
                    "spawned lookup helper, pid {}, communicating over a \
                     datagram socketpair",
                    link.pid
                );
                self.link = Some(link);
                true
            }
            Err(err) => {
                warn!("spawning lookup helper: {err}");
                false
            }
        }
    }

    /// The mechanics of one spawn.
    ///
    /// The helper inherits one end of a datagram socketpair as both its
    /// stdin (requests) and stdout (responses); stderr stays on ours so
    /// its log lines land with the server's.
    fn spawn_slave(&self) -> io::Result<SlaveLink> {
        let (ours, theirs) = std::os::unix::net::UnixDatagram::pair()?;
        ours.set_nonblocking(true)?;
        let theirs_out = theirs.try_clone()?;

        let child = Command::new(&self.config.slave_path)
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::from(OwnedFd::from(theirs_out)))
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or_default();

        Ok(SlaveLink {
            sock: UnixDatagram::from_std(ours)?,
            child,
            pid,
        })
    }

    /// Sends one request datagram.
    fn send_request(
        &self,
        handle: Handle,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> io::Result<()> {
        let link = self
            .link
            .as_ref()
            .expect("callers only send while a helper exists");
        let request = LookupRequest {
            handle,
            local: local.into(),
            remote: remote.into(),
            want_dns: self.config.want_dns,
            want_ident: self.config.want_ident,
            timeout: self.config.lookup_timeout,
        };
        let sent = link.sock.try_send(&request.compose())?;
        if sent != crate::lookup::wire::REQUEST_SIZE {
            return Err(io::Error::new(io::ErrorKind::Other, "short send"));
        }
        Ok(())
    }

    /// Replays every pending request, e.g. onto a fresh helper.
    fn resend_pending(&mut self, now: Instant) {
        let handles: Vec<Handle> =
            self.pending.entries.keys().copied().collect();
        for handle in handles {
            let Some(entry) = self.pending.entries.get_mut(&handle) else {
                continue;
            };
            entry.since = now;
            let (local, remote) = (entry.local, entry.remote);
            if let Err(err) = self.send_request(handle, local, remote) {
                warn!("replaying lookup {handle}: {err}");
                self.link = None;
                break;
            }
        }
    }

    /// Empties the pending set, returning everything that was in it.
    fn drain_all_pending(&mut self) -> Vec<Handle> {
        self.pending.entries.drain().map(|(handle, _)| handle).collect()
    }
}

//------------ Helper Functions ----------------------------------------------

/// Renders how a helper process ended, for the log.
fn exit_report(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with code {code}")
    } else if let Some(signal) = status.signal() {
        format!("exited with signal {signal}")
    } else {
        "exited in an unknown fashion".into()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn pending_set_keeps_one_entry_per_handle() {
        let mut pending = PendingSet::default();
        let now = Instant::now();
        pending.insert(Handle(5), addr("127.0.0.1:1"), addr("127.0.0.1:2"), now);
        pending.insert(
            Handle(5),
            addr("127.0.0.1:1"),
            addr("127.0.0.1:2"),
            now + Duration::from_secs(10),
        );
        assert_eq!(pending.len(), 1);

        // The refreshed timestamp counts, not the original.
        let probe = now + Duration::from_secs(35);
        assert!(pending.stale(probe, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn pending_removal_is_idempotent() {
        let mut pending = PendingSet::default();
        let now = Instant::now();
        pending.insert(Handle(7), addr("127.0.0.1:1"), addr("127.0.0.1:2"), now);
        assert!(pending.remove(Handle(7)));
        assert!(!pending.remove(Handle(7)));
        assert!(!pending.remove(Handle(8)));
    }

    #[test]
    fn stale_returns_only_old_entries() {
        let mut pending = PendingSet::default();
        let now = Instant::now();
        pending.insert(Handle(1), addr("127.0.0.1:1"), addr("127.0.0.1:2"), now);
        pending.insert(
            Handle(2),
            addr("127.0.0.1:1"),
            addr("127.0.0.1:3"),
            now + Duration::from_secs(25),
        );
        let probe = now + Duration::from_secs(31);
        let stale = pending.stale(probe, Duration::from_secs(30));
        assert_eq!(stale, vec![Handle(1)]);
    }

    #[test]
    fn spawn_gate_trips_after_the_cap() {
        let mut gate = SpawnGate::default();
        let now = Instant::now();
        for n in 0..MAX_SPAWNS_PER_WINDOW {
            assert!(gate.allow(now + Duration::from_secs(n as u64)));
        }
        assert!(!gate.allow(now + Duration::from_secs(10)));
    }

    #[test]
    fn spawn_gate_recovers_once_the_window_rolls() {
        let mut gate = SpawnGate::default();
        let now = Instant::now();
        for _ in 0..MAX_SPAWNS_PER_WINDOW {
            assert!(gate.allow(now));
        }
        assert!(!gate.allow(now + Duration::from_secs(30)));
        // Well past the window, the old attempts no longer count.
        assert!(gate.allow(now + Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn repeated_spawn_failure_permanently_degrades() {
        let mut config = Config::new();
        config.set_slave_path(PathBuf::from("/nonexistent/lookup-slave"));
        let mut chan = LookupChannel::new(config);

        let local = addr("127.0.0.1:4201");
        let remote = addr("127.0.0.1:50000");

        // Every submit burns one spawn attempt and degrades.
        for n in 0..MAX_SPAWNS_PER_WINDOW {
            let now = Instant::now();
            assert_eq!(
                chan.submit(Handle(n as u32), local, remote, now),
                SubmitOutcome::Degraded
            );
            assert!(!chan.is_halted());
        }

        // One past the cap trips the permanent halt.
        assert_eq!(
            chan.submit(Handle(99), local, remote, Instant::now()),
            SubmitOutcome::Degraded
        );
        assert!(chan.is_halted());
        assert_eq!(chan.state(), SlaveState::Down);
        assert_eq!(chan.num_pending(), 0);

        // And from here on, no spawn is even attempted.
        assert_eq!(
            chan.submit(Handle(100), local, remote, Instant::now()),
            SubmitOutcome::Degraded
        );
    }
}
