//! One client connection and its buffered I/O state.
//!
//! A connection owns its socket plus everything the loop needs to treat
//! the client fairly: a line-assembly input buffer, an output queue with
//! a hard byte ceiling, and a token-bucket command quota. Connections are
//! owned exclusively by the multiplexer's table; other subsystems only
//! ever queue text onto them, never hold references across suspension
//! points.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;

use crate::lookup::Handle;

use super::telnet::TelnetState;

/// What replaces a connection's output when it exceeds its ceiling.
pub const FLUSHED_MESSAGE: &str = "\r\n<Output flushed>\r\n";

/// Longest command line accepted; a longer one is split at this size.
const MAX_LINE: usize = 8192;

/// Read chunk size for draining a readable socket.
const READ_CHUNK: usize = 4096;

//------------ ConnSource ----------------------------------------------------

/// Which listener a connection arrived through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnSource {
    /// The ordinary player port.
    Plain,

    /// Anything we cannot classify, e.g. restored from an older reboot
    /// file.
    Unknown,
}

impl ConnSource {
    /// The stable number used in the reboot continuity file.
    pub fn as_u8(self) -> u8 {
        match self {
            ConnSource::Plain => 0,
            ConnSource::Unknown => 255,
        }
    }

    /// Decodes the reboot-file number, unknown on anything unexpected.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnSource::Plain,
            _ => ConnSource::Unknown,
        }
    }
}

impl fmt::Display for ConnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnSource::Plain => "normal port",
            ConnSource::Unknown => "unknown source",
        })
    }
}

//------------ CommandQuota --------------------------------------------------

/// A token-bucket limiter on how fast one client may issue commands.
///
/// Tokens accrue per elapsed time slice up to a burst ceiling and one is
/// spent per processed command, so a paste of a hundred commands drains
/// at a bounded rate no matter how fast the bytes arrived.
#[derive(Clone, Copy, Debug)]
pub struct CommandQuota {
    tokens: u32,
}

impl CommandQuota {
    /// Starts a quota off with the given token balance.
    pub fn new(tokens: u32) -> Self {
        Self { tokens }
    }

    /// Credits tokens for elapsed whole slices, capped at the ceiling.
    pub fn refresh(&mut self, slices: u32, per_slice: u32, ceiling: u32) {
        if slices > 0 {
            self.tokens = self
                .tokens
                .saturating_add(per_slice.saturating_mul(slices))
                .min(ceiling);
        }
    }

    /// Spends one token if one is available.
    pub fn try_consume(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// The current token balance.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

//------------ TextQueue -----------------------------------------------------

/// A byte-counted queue of output blocks awaiting the socket.
#[derive(Debug, Default)]
pub struct TextQueue {
    blocks: VecDeque<Bytes>,
    nbytes: usize,
}

impl TextQueue {
    /// Is there anything queued?
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes queued.
    pub fn len_bytes(&self) -> usize {
        self.nbytes
    }

    /// Appends a block, collapsing the queue if it passes the ceiling.
    ///
    /// On overflow everything queued — the new block included — is
    /// replaced by the flushed-marker message, so a client that stops
    /// reading costs a bounded amount of memory and sees an honest note
    /// about what happened. Returns true when the collapse fired.
    pub fn append_bounded(&mut self, data: &[u8], ceiling: usize) -> bool {
        if data.is_empty() {
            return false;
        }
        self.blocks.push_back(Bytes::copy_from_slice(data));
        self.nbytes += data.len();
        if self.nbytes > ceiling {
            self.blocks.clear();
            self.blocks.push_back(Bytes::from_static(
                FLUSHED_MESSAGE.as_bytes(),
            ));
            self.nbytes = FLUSHED_MESSAGE.len();
            return true;
        }
        false
    }

    /// The frontmost block, if any.
    pub fn front(&self) -> Option<Bytes> {
        self.blocks.front().cloned()
    }

    /// Drops `n` written bytes off the front of the queue.
    pub fn advance(&mut self, mut n: usize) {
        self.nbytes = self.nbytes.saturating_sub(n);
        while n > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            if n < front.len() {
                let _ = front.split_to(n);
                break;
            }
            n -= front.len();
            self.blocks.pop_front();
        }
    }

    /// The queued content, for tests and diagnostics.
    pub fn concatenated(&self) -> Vec<u8> {
        let mut all = Vec::with_capacity(self.nbytes);
        for block in &self.blocks {
            all.extend_from_slice(block);
        }
        all
    }
}

//------------ LineBuffer ----------------------------------------------------

/// Assembles raw input bytes into complete command lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    raw: BytesMut,
    lines: VecDeque<String>,
}

impl LineBuffer {
    /// Feeds in plain (already telnet-filtered) bytes.
    pub fn push(&mut self, plain: &[u8]) {
        self.raw.extend_from_slice(plain);
        loop {
            if let Some(pos) = self.raw.iter().position(|&b| b == b'\n') {
                let line = self.raw.split_to(pos + 1);
                self.queue_line(&line[..pos]);
            } else if self.raw.len() >= MAX_LINE {
                // No newline in sight; take it as a command anyway rather
                // than buffer without bound.
                let line = self.raw.split_to(MAX_LINE);
                self.queue_line(&line);
            } else {
                break;
            }
        }
    }

    fn queue_line(&mut self, bytes: &[u8]) {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes);
        if !text.is_empty() {
            self.lines.push_back(text.into_owned());
        }
    }

    /// Is a complete command waiting?
    pub fn has_line(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Takes the oldest complete command.
    pub fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

//------------ Connection ----------------------------------------------------

/// One live client connection.
pub struct Connection {
    /// The server-wide identity of this connection.
    handle: Handle,

    /// The socket. Shared only with the per-tick readiness futures.
    stream: Arc<TcpStream>,

    /// Which listener the connection came through.
    source: ConnSource,

    /// Resolved hostname, or the numeric address until/unless resolved.
    hostname: String,

    /// Numeric address text.
    ip: String,

    /// When the connection was accepted.
    connected_at: SystemTime,

    /// When the client last had a command processed.
    last_activity: SystemTime,

    /// The authenticated identity, once there is one.
    player: Option<i64>,

    /// Hidden from presence listings?
    hidden: bool,

    /// Commands processed on this connection.
    cmds: u64,

    /// Bytes received on this connection.
    input_bytes: u64,

    /// Bytes written to this connection.
    output_bytes: u64,

    /// The command-rate limiter.
    quota: CommandQuota,

    /// Telnet session state.
    telnet: TelnetState,

    /// Session flag bits, preserved across reboots.
    conn_flags: u32,

    /// User-set text sent before each command's output.
    output_prefix: Option<String>,

    /// User-set text sent after each command's output.
    output_suffix: Option<String>,

    /// Free-form status line shown in listings.
    status_line: Option<String>,

    /// Reported terminal type, when the client ever said.
    ttype: Option<String>,

    /// Session checksum string, preserved across reboots.
    checksum: String,

    /// Input bytes awaiting a newline plus completed lines.
    input: LineBuffer,

    /// Output awaiting the socket.
    output: TextQueue,
}

impl Connection {
    /// Creates the state for a freshly established connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Handle,
        stream: Arc<TcpStream>,
        source: ConnSource,
        hostname: String,
        ip: String,
        starting_quota: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            handle,
            stream,
            source,
            hostname,
            ip,
            connected_at: now,
            last_activity: now,
            player: None,
            hidden: false,
            cmds: 0,
            input_bytes: 0,
            output_bytes: 0,
            quota: CommandQuota::new(starting_quota),
            telnet: TelnetState::default(),
            conn_flags: 0,
            output_prefix: None,
            output_suffix: None,
            status_line: None,
            ttype: None,
            checksum: String::new(),
            input: LineBuffer::default(),
            output: TextQueue::default(),
        }
    }

    //--- Access

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    pub fn source(&self) -> ConnSource {
        self.source
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn last_activity(&self) -> SystemTime {
        self.last_activity
    }

    pub fn player(&self) -> Option<i64> {
        self.player
    }

    pub fn set_player(&mut self, player: Option<i64>) {
        self.player = player;
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn cmds(&self) -> u64 {
        self.cmds
    }

    pub fn telnet(&self) -> &TelnetState {
        &self.telnet
    }

    pub fn conn_flags(&self) -> u32 {
        self.conn_flags
    }

    pub fn output_prefix(&self) -> Option<&str> {
        self.output_prefix.as_deref()
    }

    pub fn set_output_prefix(&mut self, value: Option<String>) {
        self.output_prefix = value;
    }

    pub fn output_suffix(&self) -> Option<&str> {
        self.output_suffix.as_deref()
    }

    pub fn set_output_suffix(&mut self, value: Option<String>) {
        self.output_suffix = value;
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }

    pub fn set_status_line(&mut self, value: Option<String>) {
        self.status_line = value;
    }

    pub fn ttype(&self) -> Option<&str> {
        self.ttype.as_deref()
    }

    pub fn set_ttype(&mut self, value: Option<String>) {
        self.ttype = value;
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn output(&self) -> &TextQueue {
        &self.output
    }

    //--- Quota

    /// Credits quota tokens for elapsed slices.
    pub fn refresh_quota(
        &mut self,
        slices: u32,
        per_slice: u32,
        ceiling: u32,
    ) {
        self.quota.refresh(slices, per_slice, ceiling)
    }

    /// The current quota balance.
    pub fn quota_tokens(&self) -> u32 {
        self.quota.tokens()
    }

    //--- Input

    /// Is a complete command buffered and waiting?
    pub fn has_buffered_command(&self) -> bool {
        self.input.has_line()
    }

    /// Takes one buffered command if quota permits, spending a token.
    pub fn take_command(&mut self) -> Option<String> {
        if !self.input.has_line() || !self.quota.try_consume() {
            return None;
        }
        let line = self.input.next_line()?;
        self.cmds += 1;
        self.last_activity = SystemTime::now();
        Some(line)
    }

    /// Drains the readable socket into the input buffer.
    ///
    /// Telnet negotiation is filtered out on the way (any answers we owe
    /// are queued as output) and completed lines become buffered
    /// commands. An error return — end of stream included — means the
    /// connection is dead and should be closed.
    pub fn pump_input(
        &mut self,
        output_ceiling: usize,
    ) -> io::Result<usize> {
        let mut buf = [0; READ_CHUNK];
        let mut total = 0;
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => {
                    total += n;
                    self.input_bytes += n as u64;
                    self.ingest(&buf[..n], output_ceiling);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    fn ingest(&mut self, data: &[u8], output_ceiling: usize) {
        let mut plain = Vec::with_capacity(data.len());
        let mut replies = Vec::new();
        self.telnet.filter(data, &mut plain, &mut replies);
        if !replies.is_empty() {
            self.enqueue_output(&replies, output_ceiling);
        }
        self.input.push(&plain);
    }

    //--- Output

    /// Queues rendered text for the client. Never blocks, never writes.
    ///
    /// Returns true when the queue hit its ceiling and was collapsed to
    /// the flushed marker.
    pub fn enqueue_output(
        &mut self,
        data: &[u8],
        ceiling: usize,
    ) -> bool {
        self.output.append_bounded(data, ceiling)
    }

    /// Is output waiting for the socket?
    pub fn has_queued_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Writes as much queued output as the socket takes without blocking.
    pub fn pump_output(&mut self) -> io::Result<()> {
        while let Some(front) = self.output.front() {
            match self.stream.try_write(&front) {
                Ok(0) => {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    self.output.advance(n);
                    self.output_bytes += n as u64;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    //--- Reboot continuity

    /// Restores bookkeeping fields read back from the reboot file.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        &mut self,
        connected_at: SystemTime,
        last_activity: SystemTime,
        player: Option<i64>,
        hidden: bool,
        cmds: u64,
        conn_flags: u32,
        checksum: String,
    ) {
        self.connected_at = connected_at;
        self.last_activity = last_activity;
        self.player = player;
        self.hidden = hidden;
        self.cmds = cmds;
        self.conn_flags = conn_flags;
        self.checksum = checksum;
    }

    /// Overrides the negotiated window size, for reboot restore.
    pub fn set_window(&mut self, width: u16, height: u16) {
        self.telnet.set_window(width, height);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("hostname", &self.hostname)
            .field("ip", &self.ip)
            .field("player", &self.player)
            .finish_non_exhaustive()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_never_exceeds_the_ceiling() {
        let mut quota = CommandQuota::new(10);
        quota.refresh(1_000_000, 100, 100);
        assert_eq!(quota.tokens(), 100);
        quota.refresh(u32::MAX, u32::MAX, 100);
        assert_eq!(quota.tokens(), 100);
    }

    #[test]
    fn quota_accrues_per_slice_and_spends_per_command() {
        let mut quota = CommandQuota::new(0);
        assert!(!quota.try_consume());
        quota.refresh(3, 2, 100);
        assert_eq!(quota.tokens(), 6);
        assert!(quota.try_consume());
        assert_eq!(quota.tokens(), 5);
        // No elapsed slices, no credit.
        quota.refresh(0, 2, 100);
        assert_eq!(quota.tokens(), 5);
    }

    #[test]
    fn overflowing_queue_collapses_to_the_marker() {
        let mut queue = TextQueue::default();
        let ceiling = 64;
        assert!(!queue.append_bounded(&[b'a'; 40], ceiling));
        assert!(queue.append_bounded(&[b'b'; 40], ceiling));

        // Exactly the marker, nothing else, accounted exactly.
        assert_eq!(queue.len_bytes(), FLUSHED_MESSAGE.len());
        assert_eq!(queue.concatenated(), FLUSHED_MESSAGE.as_bytes());
        assert!(queue.len_bytes() <= ceiling);
    }

    #[test]
    fn queue_advance_crosses_block_boundaries() {
        let mut queue = TextQueue::default();
        queue.append_bounded(b"hello ", 1024);
        queue.append_bounded(b"world", 1024);
        assert_eq!(queue.len_bytes(), 11);

        queue.advance(8);
        assert_eq!(queue.len_bytes(), 3);
        assert_eq!(queue.concatenated(), b"rld");

        queue.advance(3);
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn lines_assemble_across_fragments() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"loo");
        assert!(!buffer.has_line());
        buffer.push(b"k\r\nsay hi\r\nwho");
        assert_eq!(buffer.next_line().as_deref(), Some("look"));
        assert_eq!(buffer.next_line().as_deref(), Some("say hi"));
        assert!(!buffer.has_line());
        buffer.push(b"\n");
        assert_eq!(buffer.next_line().as_deref(), Some("who"));
    }

    #[test]
    fn blank_lines_are_not_commands() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"\r\n\r\n\n");
        assert!(!buffer.has_line());
    }

    #[test]
    fn runaway_line_is_split_not_buffered_forever() {
        let mut buffer = LineBuffer::default();
        buffer.push(&vec![b'x'; MAX_LINE + 10]);
        assert!(buffer.has_line());
        assert_eq!(buffer.next_line().map(|l| l.len()), Some(MAX_LINE));
    }
}
