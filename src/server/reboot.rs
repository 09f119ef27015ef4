//! The reboot continuity file.
//!
//! An in-place restart re-execs the server binary without dropping
//! established sockets: descriptors survive exec, so all that has to
//! cross the gap is the bookkeeping. Before the exec the server writes
//! one record per live connection to a small sequential file; after it,
//! the new process reads the file back and rebuilds its connection table
//! around the still-open descriptors.
//!
//! The first line is a version tag, `V` followed by a bitmask naming
//! which optional fields the records carry. A reader honors the mask it
//! finds rather than the one it would write, so files from older builds
//! load with defaults for whatever they lack.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::lookup::Handle;

use super::connection::{ConnSource, Connection};

/// Records carry negotiated terminal width and height.
const FLAG_SCREEN_SIZE: u32 = 0x01;

/// Records carry the terminal type string.
const FLAG_TTYPE: u32 = 0x02;

/// Records carry the connection source.
const FLAG_SOURCE: u32 = 0x04;

/// Records carry the session checksum string.
const FLAG_CHECKSUM: u32 = 0x08;

/// Records carry the free-form status line.
const FLAG_STATUS_LINE: u32 = 0x10;

/// The mask this build writes.
const CURRENT_FLAGS: u32 = FLAG_SCREEN_SIZE
    | FLAG_TTYPE
    | FLAG_SOURCE
    | FLAG_CHECKSUM
    | FLAG_STATUS_LINE;

/// Stands in for an absent optional string.
const NO_VALUE: &str = "__none__";

//------------ RebootRecord --------------------------------------------------

/// Everything one connection needs to survive a re-exec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebootRecord {
    /// The raw socket descriptor, still open across the exec.
    pub descriptor: RawFd,

    /// The connection handle.
    pub handle: u32,

    /// Accept time, seconds since the epoch.
    pub connected_at: u64,

    /// Hidden from presence listings?
    pub hidden: bool,

    /// Commands processed so far.
    pub cmds: u64,

    /// Authenticated identity, -1 for none.
    pub player: i64,

    /// Last activity, seconds since the epoch.
    pub last_time: u64,

    /// User-set output prefix.
    pub output_prefix: Option<String>,

    /// User-set output suffix.
    pub output_suffix: Option<String>,

    /// Resolved hostname.
    pub addr: String,

    /// Numeric address.
    pub ip: String,

    /// Free-form status line.
    pub status_line: Option<String>,

    /// Session flag bits.
    pub conn_flags: u32,

    /// Negotiated terminal width.
    pub width: u16,

    /// Negotiated terminal height.
    pub height: u16,

    /// Terminal type string.
    pub ttype: Option<String>,

    /// Which listener the connection came through.
    pub source: ConnSource,

    /// Session checksum string.
    pub checksum: String,
}

impl RebootRecord {
    /// Captures a record from a live connection.
    pub fn from_connection(conn: &Connection) -> Self {
        use std::os::unix::io::AsRawFd;
        let (width, height) = conn.telnet().window();
        Self {
            descriptor: conn.stream().as_raw_fd(),
            handle: conn.handle().0,
            connected_at: unix_seconds(conn.connected_at()),
            hidden: conn.is_hidden(),
            cmds: conn.cmds(),
            player: conn.player().unwrap_or(-1),
            last_time: unix_seconds(conn.last_activity()),
            output_prefix: conn.output_prefix().map(str::to_owned),
            output_suffix: conn.output_suffix().map(str::to_owned),
            addr: conn.hostname().to_owned(),
            ip: conn.ip().to_owned(),
            status_line: conn.status_line().map(str::to_owned),
            conn_flags: conn.conn_flags(),
            width,
            height,
            ttype: conn.ttype().map(str::to_owned),
            source: conn.source(),
            checksum: conn.checksum().to_owned(),
        }
    }

    /// Applies the bookkeeping half of a record to a rebuilt connection.
    pub fn apply_to(&self, conn: &mut Connection) {
        conn.restore(
            epoch_time(self.connected_at),
            epoch_time(self.last_time),
            (self.player >= 0).then_some(self.player),
            self.hidden,
            self.cmds,
            self.conn_flags,
            self.checksum.clone(),
        );
        conn.set_output_prefix(self.output_prefix.clone());
        conn.set_output_suffix(self.output_suffix.clone());
        conn.set_status_line(self.status_line.clone());
        conn.set_ttype(self.ttype.clone());
        conn.set_window(self.width, self.height);
    }

    /// The handle this record belongs to.
    pub fn handle(&self) -> Handle {
        Handle(self.handle)
    }
}

//------------ RebootState ---------------------------------------------------

/// The whole continuity file: the listener and every live connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebootState {
    /// The raw descriptor of the listening socket.
    pub listener_fd: RawFd,

    /// One record per live connection.
    pub records: Vec<RebootRecord>,
}

impl RebootState {
    /// Writes the state out in the current format.
    pub fn save<W: Write>(&self, writer: W) -> io::Result<()> {
        let mut out = BufWriter::new(writer);
        writeln!(out, "V{CURRENT_FLAGS}")?;
        writeln!(out, "{}", self.listener_fd)?;
        for record in &self.records {
            writeln!(out, "{}", record.descriptor)?;
            writeln!(out, "{}", record.handle)?;
            writeln!(out, "{}", record.connected_at)?;
            writeln!(out, "{}", u8::from(record.hidden))?;
            writeln!(out, "{}", record.cmds)?;
            writeln!(out, "{}", record.player)?;
            writeln!(out, "{}", record.last_time)?;
            writeln!(out, "{}", escape_opt(&record.output_prefix))?;
            writeln!(out, "{}", escape_opt(&record.output_suffix))?;
            writeln!(out, "{}", escape(&record.addr))?;
            writeln!(out, "{}", escape(&record.ip))?;
            writeln!(out, "{}", escape_opt(&record.status_line))?;
            writeln!(out, "{}", record.conn_flags)?;
            writeln!(out, "{} {}", record.width, record.height)?;
            writeln!(out, "{}", escape_opt(&record.ttype))?;
            writeln!(out, "{}", record.source.as_u8())?;
            writeln!(out, "{}", escape(&record.checksum))?;
        }
        // Descriptor 0 terminates the record list; no socket is stdin.
        writeln!(out, "0")?;
        out.flush()
    }

    /// Reads a state back, honoring the version tag it finds.
    pub fn load<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut lines = Lines::new(reader);

        let tag = lines.next_line()?;
        let flags: u32 = match tag.strip_prefix('V') {
            Some(mask) => parse(mask)?,
            None => {
                return Err(bad_data("missing version tag"));
            }
        };

        let listener_fd: RawFd = parse(&lines.next_line()?)?;

        let mut records = Vec::new();
        loop {
            let descriptor: RawFd = parse(&lines.next_line()?)?;
            if descriptor == 0 {
                break;
            }
            let handle = parse(&lines.next_line()?)?;
            let connected_at = parse(&lines.next_line()?)?;
            let hidden = parse::<u8>(&lines.next_line()?)? != 0;
            let cmds = parse(&lines.next_line()?)?;
            let player = parse(&lines.next_line()?)?;
            let last_time = parse(&lines.next_line()?)?;
            let output_prefix = unescape_opt(&lines.next_line()?);
            let output_suffix = unescape_opt(&lines.next_line()?);
            let addr = unescape(&lines.next_line()?);
            let ip = unescape(&lines.next_line()?);

            let status_line = if flags & FLAG_STATUS_LINE != 0 {
                unescape_opt(&lines.next_line()?)
            } else {
                None
            };

            let conn_flags = parse(&lines.next_line()?)?;

            let (width, height) = if flags & FLAG_SCREEN_SIZE != 0 {
                let line = lines.next_line()?;
                let (w, h) = line
                    .split_once(' ')
                    .ok_or_else(|| bad_data("malformed screen size"))?;
                (parse(w)?, parse(h)?)
            } else {
                (78, 24)
            };

            let ttype = if flags & FLAG_TTYPE != 0 {
                unescape_opt(&lines.next_line()?)
            } else {
                None
            };

            let source = if flags & FLAG_SOURCE != 0 {
                ConnSource::from_u8(parse(&lines.next_line()?)?)
            } else {
                ConnSource::Unknown
            };

            let checksum = if flags & FLAG_CHECKSUM != 0 {
                unescape(&lines.next_line()?)
            } else {
                String::new()
            };

            records.push(RebootRecord {
                descriptor,
                handle,
                connected_at,
                hidden,
                cmds,
                player,
                last_time,
                output_prefix,
                output_suffix,
                addr,
                ip,
                status_line,
                conn_flags,
                width,
                height,
                ttype,
                source,
                checksum,
            });
        }

        Ok(Self {
            listener_fd,
            records,
        })
    }

    /// Writes the state to the named file.
    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        self.save(File::create(path)?)
    }

    /// Reads a state back from the named file.
    pub fn load_from_path(path: &Path) -> io::Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }
}

//------------ Helper Functions ----------------------------------------------

/// Line reader that treats early end-of-file as corruption.
struct Lines<R> {
    reader: R,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    fn next_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(bad_data("truncated reboot file"));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

fn parse<T: std::str::FromStr>(text: &str) -> io::Result<T> {
    text.trim()
        .parse()
        .map_err(|_| bad_data("malformed number in reboot file"))
}

fn bad_data(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_owned())
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

fn escape_opt(value: &Option<String>) -> String {
    match value {
        Some(text) => escape(text),
        None => NO_VALUE.to_owned(),
    }
}

fn unescape_opt(text: &str) -> Option<String> {
    if text == NO_VALUE {
        None
    } else {
        Some(unescape(text))
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn epoch_time(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RebootRecord {
        RebootRecord {
            descriptor: 7,
            handle: 12,
            connected_at: 1_700_000_000,
            hidden: true,
            cmds: 42,
            player: 1234,
            last_time: 1_700_000_600,
            output_prefix: Some("-- begin --".into()),
            output_suffix: None,
            addr: "mud.example.net".into(),
            ip: "203.0.113.5".into(),
            status_line: Some("exploring\nthe caves".into()),
            conn_flags: 0x42,
            width: 120,
            height: 40,
            ttype: Some("xterm-256color".into()),
            source: ConnSource::Plain,
            checksum: "abc123".into(),
        }
    }

    #[test]
    fn current_format_round_trips() {
        let state = RebootState {
            listener_fd: 3,
            records: vec![
                sample_record(),
                RebootRecord {
                    descriptor: 9,
                    handle: 13,
                    player: -1,
                    output_prefix: None,
                    status_line: None,
                    ttype: None,
                    ..sample_record()
                },
            ],
        };

        let mut buf = Vec::new();
        state.save(&mut buf).unwrap();
        let loaded = RebootState::load(buf.as_slice()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn older_file_without_optional_fields_gets_defaults() {
        // A file carrying only the screen-size extension.
        let input = "V1\n\
                     3\n\
                     7\n\
                     12\n\
                     1700000000\n\
                     0\n\
                     5\n\
                     -1\n\
                     1700000100\n\
                     __none__\n\
                     __none__\n\
                     host.example\n\
                     192.0.2.1\n\
                     0\n\
                     100 30\n\
                     0\n";
        let state = RebootState::load(input.as_bytes()).unwrap();
        assert_eq!(state.records.len(), 1);
        let record = &state.records[0];
        assert_eq!((record.width, record.height), (100, 30));
        assert_eq!(record.ttype, None);
        assert_eq!(record.source, ConnSource::Unknown);
        assert_eq!(record.checksum, "");
        assert_eq!(record.status_line, None);
    }

    #[test]
    fn truncated_file_is_invalid_data_not_a_panic() {
        let err = RebootState::load(b"V31\n3\n7\n".as_slice())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_version_tag_is_rejected() {
        let err = RebootState::load(b"3\n0\n".as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
