//! The TCP DNS query template.
//!
//! Every exchange sends the same query payload; only the 16-bit message ID
//! varies per connection. The payload either is the built-in single
//! question for `icann.link.` (or `ixann.link.` for the NXDOMAIN variant)
//! or comes from a file containing the message as hexadecimal digits.
//!
//! The message starts with the twelve octet header laid out as defined in
//! section 4.1.1 of [RFC 1035]:
//!
//! ```text
//!                                 1  1  1  1  1  1
//!   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA|Z |AD|CD|   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```
//!
//! The ID sits at offset zero of the message; both the sender and the
//! response validation rely on that.
//!
//! [RFC 1035]: https://tools.ietf.org/html/rfc1035

use std::{error, fmt, fs, io};
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::Family;

//------------ Wire Format Constants -----------------------------------------

/// Offset of the message ID in a DNS message.
pub const OFF_ID: usize = 0;

/// Offset of the flags field in a DNS message.
pub const OFF_FLAGS: usize = 2;

/// Offset of the question section in a DNS message.
pub const OFF_QUESTION: usize = 12;

/// The QR bit of the flags field: clear for a query, set for a response.
pub const FLAG_QR: u16 = 0x8000;

/// The RD bit of the flags field: recursion desired.
pub const FLAG_RD: u16 = 0x0100;

/// Mask of the response code in the flags field.
pub const RCODE_MASK: u16 = 0x000f;

/// QTYPE for an IPv4 host address.
const QTYPE_A: u16 = 1;

/// QTYPE for an IPv6 host address.
const QTYPE_AAAA: u16 = 28;

/// Pseudo RR type of the EDNS0 OPT record.
const TYPE_OPT: u16 = 41;

/// QCLASS IN.
const CLASS_IN: u16 = 1;

/// UDP payload size advertised in the EDNS0 OPT record.
const EDNS_UDP_SIZE: u16 = 4096;

/// The DO bit of the extended EDNS0 flags.
const EDNS_FLAG_DO: u16 = 0x8000;

/// Largest acceptable template, in file bytes and in payload bytes.
pub const MAX_TEMPLATE_LEN: usize = 4096;

/// Smallest acceptable template file: a header plus a minimal question.
const MIN_TEMPLATE_FILE: usize = OFF_QUESTION + 6;

//------------ Template ------------------------------------------------------

/// The immutable query payload shared by all exchanges.
#[derive(Clone, Debug)]
pub struct Template {
    /// The payload in wire format with a zero message ID.
    bytes: Bytes,

    /// Offset of the last octet to randomize, when configured.
    ///
    /// Kept for reporting; payload randomization itself stays disabled and
    /// only the message ID varies between exchanges.
    random_offset: Option<usize>,
}

impl Template {
    /// Builds the default query.
    ///
    /// The message carries the RD flag and a single question for the A or
    /// AAAA record of `icann.link.`, or of `ixann.link.` when `nxdomain`
    /// is requested. With `edns0`, an OPT record advertising a 4096 octet
    /// UDP size with the DO bit set is appended and counted in ARCOUNT.
    pub fn build(family: Family, edns0: bool, nxdomain: bool) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(0); // ID, patched per exchange
        buf.put_u16(FLAG_RD);
        buf.put_u16(1); // QDCOUNT
        buf.put_u16(0); // ANCOUNT
        buf.put_u16(0); // NSCOUNT
        buf.put_u16(u16::from(edns0)); // ARCOUNT
        if nxdomain {
            buf.put_slice(b"\x05ixann\x04link\x00");
        } else {
            buf.put_slice(b"\x05icann\x04link\x00");
        }
        buf.put_u16(match family {
            Family::V4 => QTYPE_A,
            Family::V6 => QTYPE_AAAA,
        });
        buf.put_u16(CLASS_IN);
        if edns0 {
            buf.put_u8(0); // root name
            buf.put_u16(TYPE_OPT);
            buf.put_u16(EDNS_UDP_SIZE);
            buf.put_u8(0); // extended rcode
            buf.put_u8(0); // version
            buf.put_u16(EDNS_FLAG_DO);
            buf.put_u16(0); // rdlength
        }
        Template {
            bytes: buf.freeze(),
            random_offset: None,
        }
    }

    /// Loads a template from a file of hexadecimal digits.
    pub fn from_file(
        path: &Path,
        random_offset: Option<usize>,
    ) -> Result<Self, TemplateError> {
        let raw = fs::read(path).map_err(TemplateError::Read)?;
        Self::from_hex(&raw, random_offset)
    }

    /// Decodes a template from raw file content.
    ///
    /// The raw size is checked before whitespace is discarded; what
    /// remains must be an even number of hexadecimal digits. A configured
    /// random offset must fall within the decoded payload.
    pub fn from_hex(
        raw: &[u8],
        random_offset: Option<usize>,
    ) -> Result<Self, TemplateError> {
        if raw.len() < MIN_TEMPLATE_FILE {
            return Err(TemplateError::TooSmall(raw.len()));
        }
        if raw.len() > MAX_TEMPLATE_LEN {
            return Err(TemplateError::TooLarge(raw.len()));
        }
        let mut digits = Vec::with_capacity(raw.len());
        for (pos, &ch) in raw.iter().enumerate() {
            if ch.is_ascii_whitespace() {
                continue;
            }
            if !ch.is_ascii_hexdigit() {
                return Err(TemplateError::BadChar { pos, ch: ch as char });
            }
            digits.push(ch);
        }
        if digits.len() % 2 != 0 {
            return Err(TemplateError::OddDigits);
        }
        let mut buf = BytesMut::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            buf.put_u8(hex_value(pair[0]) << 4 | hex_value(pair[1]));
        }
        let bytes = buf.freeze();
        if let Some(offset) = random_offset {
            if offset > bytes.len() {
                return Err(TemplateError::OffsetOutside {
                    offset,
                    len: bytes.len(),
                });
            }
        }
        Ok(Template {
            bytes,
            random_offset,
        })
    }

    /// Returns the payload length in octets.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the payload in wire format.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Returns the configured random offset, if any.
    pub fn random_offset(&self) -> Option<usize> {
        self.random_offset
    }
}

/// Converts a single hex digit. The caller has checked it is one.
fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

//------------ TemplateError -------------------------------------------------

/// A template file was unusable.
#[derive(Debug)]
pub enum TemplateError {
    /// The file could not be read.
    Read(io::Error),

    /// The file is too small to hold a header and a question.
    TooSmall(usize),

    /// The file exceeds the template size limit.
    TooLarge(usize),

    /// The file contains a character that is neither hex nor whitespace.
    BadChar {
        /// Position of the offending character in the file.
        pos: usize,
        /// The offending character.
        ch: char,
    },

    /// The file holds an odd number of hexadecimal digits.
    OddDigits,

    /// The random offset points outside the decoded payload.
    OffsetOutside {
        /// The configured offset.
        offset: usize,
        /// The decoded payload length.
        len: usize,
    },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Read(err) => {
                write!(f, "reading template file: {}", err)
            }
            TemplateError::TooSmall(len) => {
                write!(f, "template file too small ({} bytes)", len)
            }
            TemplateError::TooLarge(len) => {
                write!(f, "template file too large ({} bytes)", len)
            }
            TemplateError::BadChar { pos, ch } => {
                write!(f, "illegal char[{}]='{}' in template file", pos, ch)
            }
            TemplateError::OddDigits => {
                write!(f, "odd number of hexadecimal digits in template file")
            }
            TemplateError::OffsetOutside { offset, len } => {
                write!(
                    f,
                    "random offset (at {}) outside the template (length {})",
                    offset, len
                )
            }
        }
    }
}

impl error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TemplateError::Read(err) => Some(err),
            _ => None,
        }
    }
}

//============ Testing =======================================================
