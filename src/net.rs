//! Non-blocking TCP transport for a single exchange.
//!
//! Sockets are created through `socket2` so a local bind and the address
//! family can be applied before the non-blocking connect is initiated,
//! then handed to `mio` for readiness monitoring. Queries travel as a
//! two-octet big-endian length prefix followed by the template payload
//! with the exchange's ID patched in. Responses are read with a single
//! `recv` and validated against the query length, the ID, and the QR bit.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};

use crate::template::{Template, FLAG_QR, OFF_FLAGS, OFF_ID, RCODE_MASK};

/// Size of the receive buffer: prefix plus a maximum-size message.
pub const RECV_BUF_LEN: usize = 4098;

/// A response must at least cover the prefix, the ID, and the flags.
const MIN_RESPONSE: usize = 2 + OFF_FLAGS + 2;

//------------ Socket Setup --------------------------------------------------

/// Opens a non-blocking TCP socket and initiates a connect.
///
/// The socket is bound to `local` when one is given. A connect still in
/// progress when this returns is the normal case; completion is observed
/// through writability and `SO_ERROR`.
pub fn open_socket(
    server: SocketAddr,
    local: Option<SocketAddr>,
) -> io::Result<TcpStream> {
    let domain = if server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(addr) = local {
        socket.bind(&addr.into())?;
    }
    match socket.connect(&server.into()) {
        Ok(()) => {}
        Err(err) if connect_in_progress(&err) => {}
        Err(err) => return Err(err),
    }
    Ok(TcpStream::from_std(socket.into()))
}

/// Returns whether a connect error merely reports "in progress".
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.kind() == io::ErrorKind::WouldBlock
}

/// Returns whether an error signals exhaustion of local resources.
///
/// These are counted and survived rather than treated as failures of the
/// exchange: the pool simply initiates fewer connections for a while.
pub fn is_local_limit(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

//------------ Sending -------------------------------------------------------

/// Fills `buf` with the wire form of one query.
///
/// The payload is preceded by the two-octet length prefix and carries
/// `id` at the ID offset.
pub fn fill_query(buf: &mut BytesMut, template: &Template, id: u16) {
    buf.clear();
    buf.put_u16(template.len() as u16);
    buf.put_slice(template.as_slice());
    buf[2 + OFF_ID..2 + OFF_ID + 2].copy_from_slice(&id.to_be_bytes());
}

/// Sends a query in a single attempt.
///
/// A partial write counts as a failure; on a fresh connection the kernel
/// send buffer comfortably holds any template-size query, so a short
/// write means the connection is unusable.
pub fn send_query(sock: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    let n = sock.write(buf)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "partial query write",
        ));
    }
    Ok(())
}

//------------ Receiving -----------------------------------------------------

/// The result of reading a response for a sent exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecvOutcome {
    /// A valid response carrying this response code.
    Response {
        /// The low four bits of the flags field.
        rcode: u8,
    },

    /// Reading would block or was interrupted; the exchange stays put.
    Again,

    /// The read delivered fewer octets than prefix plus query.
    TooShort,

    /// The response ID does not match the query ID.
    WrongId,

    /// The QR bit is clear: not a response at all.
    NotResponse,
}

/// Reads and validates a response.
///
/// Transient conditions and validation failures are reported through the
/// outcome; only errors fatal to the whole run surface as `Err`.
pub fn recv_response(
    sock: &mut TcpStream,
    buf: &mut [u8],
    query_len: usize,
    id: u16,
) -> io::Result<RecvOutcome> {
    let n = match sock.read(buf) {
        Ok(n) => n,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            return Ok(RecvOutcome::Again)
        }
        Err(err) => return Err(err),
    };
    Ok(parse_response(&buf[..n], query_len, id))
}

/// Validates a prefixed response message.
///
/// A response shorter than the query is unreasonable for this tool's
/// traffic and is dropped without further inspection.
pub fn parse_response(msg: &[u8], query_len: usize, id: u16) -> RecvOutcome {
    if msg.len() < (query_len + 2).max(MIN_RESPONSE) {
        return RecvOutcome::TooShort;
    }
    if msg[2 + OFF_ID..2 + OFF_ID + 2] != id.to_be_bytes() {
        return RecvOutcome::WrongId;
    }
    let flags = u16::from_be_bytes([msg[2 + OFF_FLAGS], msg[3 + OFF_FLAGS]]);
    if flags & FLAG_QR == 0 {
        return RecvOutcome::NotResponse;
    }
    RecvOutcome::Response {
        rcode: (flags & RCODE_MASK) as u8,
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Family;

    #[test]
    fn query_wire_layout() {
        let template = Template::build(Family::V4, false, false);
        let mut buf = BytesMut::new();
        fill_query(&mut buf, &template, 0xbeef);
        assert_eq!(buf.len(), template.len() + 2);
        assert_eq!(&buf[..2], &(template.len() as u16).to_be_bytes());
        assert_eq!(&buf[2..4], &[0xbe, 0xef]);
        // The rest of the payload is untouched.
        assert_eq!(&buf[4..], &template.as_slice()[2..]);
    }

    #[test]
    fn fill_query_is_reusable() {
        let template = Template::build(Family::V4, false, false);
        let mut buf = BytesMut::new();
        fill_query(&mut buf, &template, 0x1111);
        fill_query(&mut buf, &template, 0x2222);
        assert_eq!(buf.len(), template.len() + 2);
        assert_eq!(&buf[2..4], &[0x22, 0x22]);
    }

    fn response_for(template: &Template, id: u16) -> Vec<u8> {
        let mut buf = BytesMut::new();
        fill_query(&mut buf, template, id);
        let mut msg = buf.to_vec();
        msg[2 + OFF_FLAGS] |= 0x80; // QR
        msg
    }

    #[test]
    fn accepts_matching_response() {
        let template = Template::build(Family::V4, false, false);
        let msg = response_for(&template, 0x0102);
        assert_eq!(
            parse_response(&msg, template.len(), 0x0102),
            RecvOutcome::Response { rcode: 0 }
        );
    }

    #[test]
    fn captures_rcode() {
        let template = Template::build(Family::V4, false, false);
        let mut msg = response_for(&template, 7);
        msg[3 + OFF_FLAGS] |= 3; // NXDOMAIN
        assert_eq!(
            parse_response(&msg, template.len(), 7),
            RecvOutcome::Response { rcode: 3 }
        );
    }

    #[test]
    fn rejects_wrong_id() {
        let template = Template::build(Family::V4, false, false);
        let msg = response_for(&template, 0x0102);
        assert_eq!(
            parse_response(&msg, template.len(), 0x0201),
            RecvOutcome::WrongId
        );
    }

    #[test]
    fn rejects_query_echo() {
        let template = Template::build(Family::V4, false, false);
        let mut buf = BytesMut::new();
        fill_query(&mut buf, &template, 9);
        // QR still clear.
        assert_eq!(
            parse_response(&buf, template.len(), 9),
            RecvOutcome::NotResponse
        );
    }

    #[test]
    fn rejects_short_read() {
        let template = Template::build(Family::V4, false, false);
        let msg = response_for(&template, 4);
        assert_eq!(
            parse_response(&msg[..msg.len() - 1], template.len(), 4),
            RecvOutcome::TooShort
        );
        assert_eq!(parse_response(&[], template.len(), 4), RecvOutcome::TooShort);
    }
}
