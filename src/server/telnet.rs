//! The slice of telnet needed to buffer client input correctly.
//!
//! Telnet control sequences arrive interleaved with command text and may
//! be split across reads, so the input path runs every byte through a
//! small state machine before line assembly. The machine strips
//! negotiation from the data stream, answers "won't/don't" to anything a
//! client proposes except window-size reporting, and records the two
//! things the rest of the server cares about: that the client speaks
//! telnet at all, and its negotiated window size. Everything else about
//! the protocol is someone else's problem.

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// The window-size reporting option.
const OPT_NAWS: u8 = 31;

/// Longest subnegotiation body kept; the rest is discarded.
const MAX_SUBNEG: usize = 128;

//------------ TelnetState ---------------------------------------------------

/// Per-connection telnet session state.
#[derive(Clone, Debug)]
pub struct TelnetState {
    /// Has the client ever sent a telnet command?
    aware: bool,

    /// Negotiated terminal width in columns.
    width: u16,

    /// Negotiated terminal height in rows.
    height: u16,

    /// Where the parser is between input chunks.
    parse: Parse,
}

#[derive(Clone, Debug)]
enum Parse {
    /// Plain data.
    Data,

    /// Seen an IAC.
    Command,

    /// Seen IAC plus a negotiation verb; the option byte is next.
    Negotiate(u8),

    /// Inside IAC SB, collecting the body.
    Subneg(Vec<u8>),

    /// Inside a subnegotiation, seen an IAC.
    SubnegCommand(Vec<u8>),
}

impl Default for TelnetState {
    fn default() -> Self {
        Self {
            aware: false,
            width: 78,
            height: 24,
            parse: Parse::Data,
        }
    }
}

impl TelnetState {
    /// Has the client ever sent a telnet command?
    pub fn is_aware(&self) -> bool {
        self.aware
    }

    /// The negotiated window size as (width, height).
    pub fn window(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Overrides the window size, e.g. when restoring from a reboot file.
    pub fn set_window(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
    }

    /// Runs a chunk of raw input through the state machine.
    ///
    /// Plain data bytes land in `plain`; any protocol answers we owe the
    /// client land in `replies` for the caller to queue as output. Safe
    /// to call with arbitrarily fragmented input.
    pub fn filter(
        &mut self,
        input: &[u8],
        plain: &mut Vec<u8>,
        replies: &mut Vec<u8>,
    ) {
        for &byte in input {
            self.parse = match std::mem::replace(&mut self.parse, Parse::Data)
            {
                Parse::Data => match byte {
                    IAC => Parse::Command,
                    _ => {
                        plain.push(byte);
                        Parse::Data
                    }
                },

                Parse::Command => match byte {
                    // Escaped literal 255; not a sign of telnet.
                    IAC => {
                        plain.push(IAC);
                        Parse::Data
                    }
                    WILL | WONT | DO | DONT => {
                        self.aware = true;
                        Parse::Negotiate(byte)
                    }
                    SB => {
                        self.aware = true;
                        Parse::Subneg(Vec::new())
                    }
                    // NOP, GA, and friends carry no payload.
                    _ => {
                        self.aware = true;
                        Parse::Data
                    }
                },

                Parse::Negotiate(verb) => {
                    match (verb, byte) {
                        // The one thing we do want: window size reports.
                        (WILL, OPT_NAWS) => {
                            replies.extend_from_slice(&[IAC, DO, OPT_NAWS]);
                        }
                        (WILL, option) => {
                            replies.extend_from_slice(&[IAC, DONT, option]);
                        }
                        (DO, option) => {
                            replies.extend_from_slice(&[IAC, WONT, option]);
                        }
                        // WONT/DONT need no answer; they are the answer.
                        _ => {}
                    }
                    Parse::Data
                }

                Parse::Subneg(mut body) => match byte {
                    IAC => Parse::SubnegCommand(body),
                    _ => {
                        if body.len() < MAX_SUBNEG {
                            body.push(byte);
                        }
                        Parse::Subneg(body)
                    }
                },

                Parse::SubnegCommand(mut body) => match byte {
                    SE => {
                        self.subnegotiation(&body);
                        Parse::Data
                    }
                    IAC => {
                        if body.len() < MAX_SUBNEG {
                            body.push(IAC);
                        }
                        Parse::Subneg(body)
                    }
                    // Malformed; drop the whole sequence.
                    _ => Parse::Data,
                },
            };
        }
    }

    /// Acts on a completed subnegotiation body.
    fn subnegotiation(&mut self, body: &[u8]) {
        if let [OPT_NAWS, w1, w2, h1, h2] = *body {
            let width = u16::from_be_bytes([w1, w2]);
            let height = u16::from_be_bytes([h1, h2]);
            // A zero from the client means "no opinion"; keep what we had.
            if width > 0 {
                self.width = width;
            }
            if height > 0 {
                self.height = height;
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut TelnetState, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut plain = Vec::new();
        let mut replies = Vec::new();
        state.filter(input, &mut plain, &mut replies);
        (plain, replies)
    }

    #[test]
    fn plain_text_passes_through() {
        let mut state = TelnetState::default();
        let (plain, replies) = run(&mut state, b"look\r\n");
        assert_eq!(plain, b"look\r\n");
        assert!(replies.is_empty());
        assert!(!state.is_aware());
    }

    #[test]
    fn escaped_iac_is_one_data_byte() {
        let mut state = TelnetState::default();
        let (plain, _) = run(&mut state, &[b'a', IAC, IAC, b'b']);
        assert_eq!(plain, [b'a', IAC, b'b']);
    }

    #[test]
    fn naws_offer_is_accepted_others_refused() {
        let mut state = TelnetState::default();
        let (_, replies) =
            run(&mut state, &[IAC, WILL, OPT_NAWS, IAC, WILL, 42]);
        assert_eq!(
            replies,
            [IAC, DO, OPT_NAWS, IAC, DONT, 42]
        );
        assert!(state.is_aware());
    }

    #[test]
    fn do_gets_wont() {
        let mut state = TelnetState::default();
        let (_, replies) = run(&mut state, &[IAC, DO, 1]);
        assert_eq!(replies, [IAC, WONT, 1]);
    }

    #[test]
    fn naws_subnegotiation_sets_window() {
        let mut state = TelnetState::default();
        let (plain, _) = run(
            &mut state,
            &[IAC, SB, OPT_NAWS, 0, 120, 0, 40, IAC, SE, b'x'],
        );
        assert_eq!(state.window(), (120, 40));
        assert_eq!(plain, b"x");
    }

    #[test]
    fn fragmented_sequences_survive_chunk_boundaries() {
        let mut state = TelnetState::default();
        let (plain_a, _) = run(&mut state, &[b'h', b'i', IAC]);
        let (plain_b, _) =
            run(&mut state, &[SB, OPT_NAWS, 0, 100, 0, 30, IAC]);
        let (plain_c, _) = run(&mut state, &[SE, b'!']);
        assert_eq!(plain_a, b"hi");
        assert!(plain_b.is_empty());
        assert_eq!(plain_c, b"!");
        assert_eq!(state.window(), (100, 30));
    }

    #[test]
    fn zero_window_dimensions_are_ignored() {
        let mut state = TelnetState::default();
        run(&mut state, &[IAC, SB, OPT_NAWS, 0, 0, 0, 50, IAC, SE]);
        assert_eq!(state.window(), (78, 50));
    }
}
