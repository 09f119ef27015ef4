//! An RFC 1413 ident client.
//!
//! Asks the remote host's ident service who owns the far end of a
//! connection. The query goes out from the same local interface the
//! original connection arrived on, since multihomed ident servers answer
//! for the address pair, not the host. Every step is bounded by the
//! request's time budget, and any failure anywhere degrades to "no
//! answer" — the caller sends an empty ident field, never no response.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use socket2::{Domain, Socket, Type};

use super::resolve::TimeBudget;

/// The well-known ident service port.
const IDENT_PORT: u16 = 113;

/// Longest reply line worth reading.
const MAX_REPLY: usize = 512;

//------------ query ---------------------------------------------------------

/// Runs one ident query for the connection `remote -> local`.
///
/// Returns the remote user identifier, or `None` on any failure or an
/// exhausted budget.
pub fn query(
    local: SocketAddr,
    remote: SocketAddr,
    budget: &TimeBudget,
) -> Option<String> {
    let reply = exchange(local, remote, budget)?;
    parse_reply(&reply, remote.port(), local.port())
}

/// The network half: connect, send the port pair, read the reply line.
fn exchange(
    local: SocketAddr,
    remote: SocketAddr,
    budget: &TimeBudget,
) -> Option<String> {
    if budget.expired() {
        return None;
    }

    let domain = Domain::for_address(remote);
    let socket = Socket::new(domain, Type::STREAM, None).ok()?;

    // Same interface the connection arrived on, any port.
    let bind_to = SocketAddr::new(local.ip(), 0);
    socket.bind(&bind_to.into()).ok()?;

    let target = SocketAddr::new(remote.ip(), IDENT_PORT);
    socket
        .connect_timeout(&target.into(), budget.remaining())
        .ok()?;

    let mut stream: TcpStream = socket.into();

    if budget.expired() {
        return None;
    }
    stream.set_write_timeout(Some(budget.remaining())).ok()?;
    let request = format!("{} , {}\r\n", remote.port(), local.port());
    stream.write_all(request.as_bytes()).ok()?;

    let mut buf = [0; MAX_REPLY];
    let mut filled = 0;
    loop {
        if budget.expired() {
            return None;
        }
        stream.set_read_timeout(Some(budget.remaining())).ok()?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if buf[..filled].contains(&b'\n') || filled == buf.len() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => return None,
        }
    }

    let line = String::from_utf8_lossy(&buf[..filled]);
    Some(line.lines().next().unwrap_or_default().to_owned())
}

//------------ parse_reply ---------------------------------------------------

/// Parses an ident reply line.
///
/// The reply format is
/// `<port>,<port>:USERID:<opsys>[,<charset>]:<identifier>` for a positive
/// answer and `<port>,<port>:ERROR:<reason>` for a refusal. The echoed
/// port pair has to match the one we asked about; a server answering for
/// some other connection is no answer at all.
fn parse_reply(
    line: &str,
    their_port: u16,
    our_port: u16,
) -> Option<String> {
    let mut fields = line.splitn(3, ':');

    let ports = fields.next()?;
    let mut ports = ports.splitn(2, ',');
    let echoed_theirs: u16 = ports.next()?.trim().parse().ok()?;
    let echoed_ours: u16 = ports.next()?.trim().parse().ok()?;
    if echoed_theirs != their_port || echoed_ours != our_port {
        return None;
    }

    if fields.next()?.trim() != "USERID" {
        return None;
    }

    // What remains is `<opsys>[,<charset>]:<identifier>`; the identifier
    // itself may contain further colons.
    let rest = fields.next()?;
    let (_opsys, identifier) = rest.split_once(':')?;
    let identifier = identifier.trim();
    if identifier.is_empty() {
        None
    } else {
        Some(identifier.to_owned())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_reply_yields_identifier() {
        assert_eq!(
            parse_reply("6193, 23 : USERID : UNIX : stjohns", 6193, 23),
            Some("stjohns".to_owned())
        );
    }

    #[test]
    fn charset_tagged_reply_is_accepted() {
        assert_eq!(
            parse_reply(
                "6195, 23 : USERID : UNIX , US-ASCII : dgm",
                6195,
                23
            ),
            Some("dgm".to_owned())
        );
    }

    #[test]
    fn identifier_may_contain_colons() {
        assert_eq!(
            parse_reply("413, 22 : USERID : OTHER : a:b:c", 413, 22),
            Some("a:b:c".to_owned())
        );
    }

    #[test]
    fn error_reply_yields_nothing() {
        assert_eq!(
            parse_reply("6191, 23 : ERROR : NO-USER", 6191, 23),
            None
        );
    }

    #[test]
    fn mismatched_port_pair_is_rejected() {
        assert_eq!(
            parse_reply("9999, 23 : USERID : UNIX : intruder", 6193, 23),
            None
        );
    }

    #[test]
    fn garbage_yields_nothing() {
        assert_eq!(parse_reply("", 1, 2), None);
        assert_eq!(parse_reply("not an ident reply", 1, 2), None);
        assert_eq!(parse_reply("1,2:USERID:UNIX:", 1, 2), None);
    }
}
