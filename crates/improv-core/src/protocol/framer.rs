//! Stream framing
//!
//! Splits the raw serial byte stream into candidate Improv frames. The stream
//! is shared with the firmware's human-readable log output, so anything that
//! does not start with the magic is skipped up to the next newline.
//!
//! ```text
//! +--------+---------+------+-----+-------------+----------+
//! | IMPROV | version | type | len | payload[len]| checksum |
//! +--------+---------+------+-----+-------------+----------+
//!     6         1        1     1       len           1
//! ```
//!
//! Under [`ChecksumScheme::Payload`] RPC and RPC_RESULT frames count the
//! checksum in `len`, so the frame ends one byte earlier.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{
    ChecksumScheme, DecodeError, HexBytes, ProtocolError, CHECKSUM_SIZE, HEADER_SIZE, MAGIC,
};

/// One complete frame as it appeared on the wire, checksum included.
///
/// Only the length is guaranteed consistent with the declared payload length;
/// magic, version and checksum are checked by [`decode`](super::decode).
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap raw bytes, checking that the length matches the header.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, DecodeError> {
        Self::new_with(bytes, ChecksumScheme::Frame)
    }

    /// Like [`new`](Self::new), with the length rule of `scheme`
    pub fn new_with(bytes: impl Into<Bytes>, scheme: ChecksumScheme) -> Result<Self, DecodeError> {
        let bytes = bytes.into();
        let minimum = HEADER_SIZE + CHECKSUM_SIZE;
        if bytes.len() < minimum {
            return Err(DecodeError::FrameTooShort {
                expected: minimum,
                actual: bytes.len(),
            });
        }
        let declared = bytes[HEADER_SIZE - 1];
        if bytes.len() != scheme.frame_len(bytes[7], declared) {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    pub(crate) fn from_framed(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// The first six bytes
    pub fn magic(&self) -> [u8; 6] {
        let mut magic = [0u8; 6];
        magic.copy_from_slice(&self.0[..6]);
        magic
    }

    /// Protocol version byte
    pub fn version(&self) -> u8 {
        self.0[6]
    }

    /// Raw message type byte
    pub fn message_type_byte(&self) -> u8 {
        self.0[7]
    }

    /// Length byte as declared in the header
    pub fn declared_len(&self) -> u8 {
        self.0[HEADER_SIZE - 1]
    }

    /// Bytes between the header and the checksum
    pub fn payload(&self) -> &[u8] {
        &self.0[HEADER_SIZE..self.0.len() - CHECKSUM_SIZE]
    }

    /// Checksum byte carried by the frame
    pub fn checksum(&self) -> u8 {
        self.0[self.0.len() - 1]
    }

    /// Everything before the checksum byte
    pub fn checksummed_bytes(&self) -> &[u8] {
        &self.0[..self.0.len() - CHECKSUM_SIZE]
    }

    /// The whole frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wire length, header and checksum included
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a frame built by this crate
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwrap the underlying buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame{}", HexBytes(&self.0))
    }
}

/// Whether the bytes accumulated so far belong to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSync {
    /// Still collecting the 9 header bytes
    Unknown,
    /// Header matched; collect until `expected` bytes are buffered
    Protocol { expected: usize },
    /// Not a frame; drop everything through the next newline
    NonProtocol,
}

/// Incremental frame extractor.
///
/// Works byte by byte, so chunk boundaries from the transport do not matter.
/// Implements [`Decoder`] so it can drive a `FramedRead` or be fed straight
/// from a read buffer.
#[derive(Debug)]
pub struct Framer {
    line: BytesMut,
    sync: LineSync,
    scheme: ChecksumScheme,
    discarded_lines: u64,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create a framer with an empty buffer
    pub fn new() -> Self {
        Self::with_scheme(ChecksumScheme::Frame)
    }

    /// Create a framer that measures frames the way `scheme` lays them out
    pub fn with_scheme(scheme: ChecksumScheme) -> Self {
        Self {
            line: BytesMut::with_capacity(HEADER_SIZE + u8::MAX as usize + CHECKSUM_SIZE),
            sync: LineSync::Unknown,
            scheme,
            discarded_lines: 0,
        }
    }

    /// Feed a single byte, returning a frame when this byte completes one.
    pub fn push_byte(&mut self, byte: u8) -> Option<Frame> {
        match self.sync {
            LineSync::NonProtocol => {
                if byte == b'\n' {
                    self.sync = LineSync::Unknown;
                }
                None
            }
            LineSync::Protocol { expected } => {
                self.line.put_u8(byte);
                if self.line.len() < expected {
                    return None;
                }
                self.sync = LineSync::Unknown;
                Some(Frame::from_framed(self.line.split().freeze()))
            }
            LineSync::Unknown => {
                // A 0x0A right after magic, version and type is a payload
                // length of 10; anywhere else in the header it ends the line.
                if byte == b'\n' && !self.awaiting_length() {
                    self.line.clear();
                    return None;
                }
                self.line.put_u8(byte);
                if self.line.len() < HEADER_SIZE {
                    return None;
                }
                if &self.line[..MAGIC.len()] != MAGIC {
                    trace!(prefix = %HexBytes(&self.line), "skipping non-Improv line");
                    self.line.clear();
                    self.sync = LineSync::NonProtocol;
                    self.discarded_lines += 1;
                    return None;
                }
                let expected = self
                    .scheme
                    .frame_len(self.line[7], self.line[HEADER_SIZE - 1]);
                self.sync = LineSync::Protocol { expected };
                None
            }
        }
    }

    /// Magic, version and type are in; the next byte is the length
    fn awaiting_length(&self) -> bool {
        self.line.len() == HEADER_SIZE - 1 && &self.line[..MAGIC.len()] == MAGIC
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Consume bytes from `src` up to and including the end of the next
    /// complete frame. Bytes that complete nothing are consumed as well.
    pub fn next_frame(&mut self, src: &mut BytesMut) -> Option<Frame> {
        let mut consumed = 0;
        let mut frame = None;
        for &byte in src.iter() {
            consumed += 1;
            if let Some(complete) = self.push_byte(byte) {
                frame = Some(complete);
                break;
            }
        }
        src.advance(consumed);
        frame
    }

    /// Number of non-protocol lines skipped so far
    pub fn discarded_lines(&self) -> u64 {
        self.discarded_lines
    }

    /// Bytes held for a frame in progress
    pub fn buffered_len(&self) -> usize {
        self.line.len()
    }

    /// Drop any partial frame and resynchronise on the next byte.
    pub fn reset(&mut self) {
        self.line.clear();
        self.sync = LineSync::Unknown;
    }
}

impl Decoder for Framer {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        Ok(self.next_frame(src))
    }
}
