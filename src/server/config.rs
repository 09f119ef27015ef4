//! Configuration for the main server loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::config::DefMinMax;

/// Length of one command-rate time slice.
///
/// Each connection earns command tokens once per slice. The value has to
/// be between 100 milliseconds and 60 seconds with a default of one
/// second; a shorter slice makes rate limiting finer-grained at the cost
/// of more timer wakeups.
const COMMAND_SLICE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(100),
    Duration::from_secs(60),
);

/// Command tokens earned per slice.
///
/// The value has to be between 1 and 100 with a default of 1: a client
/// typing at a steady rate gets one command through per slice.
const COMMANDS_PER_SLICE: DefMinMax<u32> = DefMinMax::new(1, 1, 100);

/// Ceiling on accumulated command tokens.
///
/// An idle connection saves up at most this many tokens, so a burst of
/// pasted commands drains quickly at first and then settles to the
/// per-slice rate. The value has to be between 1 and 10,000 with a
/// default of 100.
const BURST_CEILING: DefMinMax<u32> = DefMinMax::new(100, 1, 10_000);

/// Ceiling on a connection's queued output, in bytes.
///
/// Past the ceiling the whole queue is discarded in favor of a short
/// marker message, bounding what a slow or stalled client can pin in
/// memory. The value has to be between 16 KiB and 16 MiB with a default
/// of 1 MiB.
const OUTPUT_CEILING: DefMinMax<usize> =
    DefMinMax::new(1024 * 1024, 16 * 1024, 16 * 1024 * 1024);

/// Game-queue budget for a tick that timed out with no I/O.
///
/// The value has to be between 1 and 1,000 with a default of 3.
const QUEUE_CHUNK: DefMinMax<usize> = DefMinMax::new(3, 1, 1000);

/// Game-queue budget for a tick that serviced I/O.
///
/// Zero skips queue processing entirely on busy ticks, giving network
/// traffic priority. The value has to be between 0 and 1,000 with a
/// default of 0.
const ACTIVE_QUEUE_CHUNK: DefMinMax<usize> = DefMinMax::new(0, 0, 1000);

/// Most connections the server will hold open at once.
///
/// The value has to be between 8 and 50,000 with a default of 512; the
/// listener is simply left out of the readiness set while the table is
/// full.
const MAX_CONNECTIONS: DefMinMax<usize> = DefMinMax::new(512, 8, 50_000);

//----------- Config ---------------------------------------------------------

/// Configuration for the event multiplexer.
#[derive(Clone, Debug)]
pub struct Config {
    /// The address the server listens on.
    listen_addr: SocketAddr,

    /// Length of one command-rate time slice.
    command_slice: Duration,

    /// Command tokens earned per slice.
    commands_per_slice: u32,

    /// Ceiling on accumulated command tokens.
    burst_ceiling: u32,

    /// Ceiling on a connection's queued output, in bytes.
    output_ceiling: usize,

    /// Game-queue budget for a tick that timed out with no I/O.
    queue_chunk: usize,

    /// Game-queue budget for a tick that serviced I/O.
    active_queue_chunk: usize,

    /// Most connections the server will hold open at once.
    max_connections: usize,

    /// Where the reboot continuity file lives.
    reboot_file: PathBuf,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the address the server listens on.
    pub fn set_listen_addr(&mut self, value: SocketAddr) {
        self.listen_addr = value;
    }

    /// Returns the address the server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Sets the length of one command-rate time slice.
    ///
    /// The value has to be between 100 milliseconds and 60 seconds. The
    /// default is one second.
    pub fn set_command_slice(&mut self, value: Duration) {
        self.command_slice = COMMAND_SLICE.limit(value);
    }

    /// Returns the length of one command-rate time slice.
    pub fn command_slice(&self) -> Duration {
        self.command_slice
    }

    /// Sets the command tokens earned per slice.
    ///
    /// The value has to be between 1 and 100. The default is 1.
    pub fn set_commands_per_slice(&mut self, value: u32) {
        self.commands_per_slice = COMMANDS_PER_SLICE.limit(value);
    }

    /// Returns the command tokens earned per slice.
    pub fn commands_per_slice(&self) -> u32 {
        self.commands_per_slice
    }

    /// Sets the ceiling on accumulated command tokens.
    ///
    /// The value has to be between 1 and 10,000. The default is 100.
    pub fn set_burst_ceiling(&mut self, value: u32) {
        self.burst_ceiling = BURST_CEILING.limit(value);
    }

    /// Returns the ceiling on accumulated command tokens.
    pub fn burst_ceiling(&self) -> u32 {
        self.burst_ceiling
    }

    /// Sets the ceiling on a connection's queued output in bytes.
    ///
    /// The value has to be between 16 KiB and 16 MiB. The default is
    /// 1 MiB.
    pub fn set_output_ceiling(&mut self, value: usize) {
        self.output_ceiling = OUTPUT_CEILING.limit(value);
    }

    /// Returns the ceiling on a connection's queued output in bytes.
    pub fn output_ceiling(&self) -> usize {
        self.output_ceiling
    }

    /// Sets the game-queue budget for a tick that timed out with no I/O.
    ///
    /// The value has to be between 1 and 1,000. The default is 3.
    pub fn set_queue_chunk(&mut self, value: usize) {
        self.queue_chunk = QUEUE_CHUNK.limit(value);
    }

    /// Returns the game-queue budget for an idle tick.
    pub fn queue_chunk(&self) -> usize {
        self.queue_chunk
    }

    /// Sets the game-queue budget for a tick that serviced I/O.
    ///
    /// The value has to be between 0 and 1,000. The default is 0, which
    /// skips queue processing on busy ticks.
    pub fn set_active_queue_chunk(&mut self, value: usize) {
        self.active_queue_chunk = ACTIVE_QUEUE_CHUNK.limit(value);
    }

    /// Returns the game-queue budget for a busy tick.
    pub fn active_queue_chunk(&self) -> usize {
        self.active_queue_chunk
    }

    /// Sets the most connections the server will hold open at once.
    ///
    /// The value has to be between 8 and 50,000. The default is 512.
    pub fn set_max_connections(&mut self, value: usize) {
        self.max_connections = MAX_CONNECTIONS.limit(value);
    }

    /// Returns the most connections the server will hold open at once.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Sets where the reboot continuity file lives.
    pub fn set_reboot_file(&mut self, value: PathBuf) {
        self.reboot_file = value;
    }

    /// Returns where the reboot continuity file lives.
    pub fn reboot_file(&self) -> &PathBuf {
        &self.reboot_file
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4201".parse().expect("valid literal"),
            command_slice: COMMAND_SLICE.default(),
            commands_per_slice: COMMANDS_PER_SLICE.default(),
            burst_ceiling: BURST_CEILING.default(),
            output_ceiling: OUTPUT_CEILING.default(),
            queue_chunk: QUEUE_CHUNK.default(),
            active_queue_chunk: ACTIVE_QUEUE_CHUNK.default(),
            max_connections: MAX_CONNECTIONS.default(),
            reboot_file: PathBuf::from("reboot.db"),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_clamped() {
        let mut config = Config::new();
        config.set_command_slice(Duration::from_millis(1));
        assert_eq!(config.command_slice(), Duration::from_millis(100));
        config.set_burst_ceiling(0);
        assert_eq!(config.burst_ceiling(), 1);
        config.set_output_ceiling(usize::MAX);
        assert_eq!(config.output_ceiling(), 16 * 1024 * 1024);
    }
}
