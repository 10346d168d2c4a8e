//! Locates the cipher suite list inside an outbound TLS ClientHello record.
//!
//! The walk is strict and stops at the cipher suites: extensions and
//! compression methods are never looked at. Any buffer that does not start
//! with a complete, well-formed prefix up to and including the cipher suite
//! list is reported as a [`Mismatch`].

use modcipher_traits::CipherSuite;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;

pub const VERSION_TLS10: u16 = 0x0301;
pub const VERSION_TLS12: u16 = 0x0303;

const RANDOM_LEN: usize = 32;

/// Wire fields walked by the locator, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    ContentType,
    RecordVersion,
    RecordLength,
    HandshakeType,
    HandshakeLength,
    ClientVersion,
    Random,
    SessionIdLength,
    SessionId,
    CipherSuitesLength,
    CipherSuites,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::ContentType => "content type",
            Field::RecordVersion => "record version",
            Field::RecordLength => "record length",
            Field::HandshakeType => "handshake type",
            Field::HandshakeLength => "handshake length",
            Field::ClientVersion => "client version",
            Field::Random => "random",
            Field::SessionIdLength => "session id length",
            Field::SessionId => "session id",
            Field::CipherSuitesLength => "cipher suites length",
            Field::CipherSuites => "cipher suites",
        };
        f.write_str(name)
    }
}

/// Why a buffer was not recognised as a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("not a handshake record (content type {0})")]
    NotHandshake(u8),
    #[error("unexpected record version 0x{0:04x}")]
    RecordVersion(u16),
    #[error("not a ClientHello (handshake type {0})")]
    NotClientHello(u8),
    #[error("unexpected client version 0x{0:04x}")]
    ClientVersion(u16),
    #[error("truncated at {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: Field,
        needed: usize,
        available: usize,
    },
}

/// The cipher suites of a recognised ClientHello and where they start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloView {
    pub cipher_suites: Vec<CipherSuite>,
    /// Byte offset of the first suite within the inspected buffer.
    pub offset: usize,
}

impl ClientHelloView {
    /// Size in bytes of the suite list that will be rewritten.
    pub fn len_bytes(&self) -> usize {
        self.cipher_suites.len() * 2
    }

    /// The validated byte range holding the suite list.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len_bytes()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize, field: Field) -> Result<&'a [u8], Mismatch> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(Mismatch::Truncated {
                field,
                needed: n,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self, field: Field) -> Result<u8, Mismatch> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: Field) -> Result<u16, Mismatch> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, field: Field) -> Result<u32, Mismatch> {
        let b = self.take(3, field)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Walks `buf` and reports either the cipher suite list or the reason it
/// could not be reached.
pub fn inspect(buf: &[u8]) -> Result<ClientHelloView, Mismatch> {
    let mut r = Cursor::new(buf);

    let content_type = r.u8(Field::ContentType)?;
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return Err(Mismatch::NotHandshake(content_type));
    }

    let record_version = r.u16(Field::RecordVersion)?;
    if record_version != VERSION_TLS10 && record_version != VERSION_TLS12 {
        return Err(Mismatch::RecordVersion(record_version));
    }

    r.u16(Field::RecordLength)?;

    let handshake_type = r.u8(Field::HandshakeType)?;
    if handshake_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Mismatch::NotClientHello(handshake_type));
    }

    r.u24(Field::HandshakeLength)?;

    let client_version = r.u16(Field::ClientVersion)?;
    if client_version != VERSION_TLS12 {
        return Err(Mismatch::ClientVersion(client_version));
    }

    r.take(RANDOM_LEN, Field::Random)?;

    let session_id_len = r.u8(Field::SessionIdLength)?;
    r.take(usize::from(session_id_len), Field::SessionId)?;

    // An odd length leaves its last byte outside the rewritten range.
    let count = usize::from(r.u16(Field::CipherSuitesLength)?) / 2;
    let offset = r.position();

    let cipher_suites = r
        .take(count * 2, Field::CipherSuites)?
        .chunks_exact(2)
        .map(|pair| CipherSuite(u16::from_be_bytes([pair[0], pair[1]])))
        .collect();

    Ok(ClientHelloView {
        cipher_suites,
        offset,
    })
}

/// Returns the cipher suites of `buf` if it starts with a ClientHello record.
pub fn locate(buf: &[u8]) -> Option<ClientHelloView> {
    inspect(buf).ok()
}
