//! Packet encoding/decoding
//!
//! Turns raw frames into typed packets and back.
//!
//! Checksum: 8-bit truncated sum of every byte preceding the checksum byte
//! (magic through payload). Older firmware summed only the payload of RPC and
//! RPC_RESULT frames and counted the checksum byte in the declared length;
//! [`ChecksumScheme::Payload`] speaks that dialect.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{
    DecodeError, DeviceState, ErrorCode, Frame, MessageType, ProtocolError, RpcCommand,
    CHECKSUM_SIZE, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

/// Which bytes the checksum covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumScheme {
    /// Every byte before the checksum, for every message type
    #[default]
    Frame,
    /// Older firmware. RPC and RPC_RESULT frames sum only their payload and
    /// declare `payload + 1` bytes, the checksum being the last of them. State
    /// and error frames are unchanged.
    Payload,
}

impl ChecksumScheme {
    /// Whether frames of `message_type` count the checksum in their declared
    /// length
    pub fn embeds_checksum(self, message_type: u8) -> bool {
        self == ChecksumScheme::Payload
            && MessageType::from_u8(message_type).is_some_and(MessageType::is_rpc)
    }

    /// Total wire length of a frame whose header declares `declared` bytes
    pub fn frame_len(self, message_type: u8, declared: u8) -> usize {
        if self.embeds_checksum(message_type) {
            // A zero length leaves no room for the checksum; take one byte anyway
            HEADER_SIZE + (declared as usize).max(CHECKSUM_SIZE)
        } else {
            HEADER_SIZE + declared as usize + CHECKSUM_SIZE
        }
    }

    fn covered<'a>(self, message_type: u8, frame_body: &'a [u8]) -> &'a [u8] {
        if self.embeds_checksum(message_type) {
            &frame_body[HEADER_SIZE..]
        } else {
            frame_body
        }
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Device reports its provisioning state
    CurrentState(DeviceState),
    /// Device reports an error code (`NoError` clears it)
    ErrorState(ErrorCode),
    /// Client request
    Rpc {
        /// Command to run
        command: RpcCommand,
        /// Command data, without its length byte
        data: Vec<u8>,
    },
    /// Device answer; an empty field list ends a streamed answer
    RpcResult {
        /// Command being answered
        command: RpcCommand,
        /// Length-prefixed strings from the result
        fields: Vec<String>,
    },
}

impl Packet {
    /// Message type this packet is framed as
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::CurrentState(_) => MessageType::CurrentState,
            Packet::ErrorState(_) => MessageType::ErrorState,
            Packet::Rpc { .. } => MessageType::Rpc,
            Packet::RpcResult { .. } => MessageType::RpcResult,
        }
    }

    /// Encode into a frame using the given checksum scheme
    pub fn encode(&self, scheme: ChecksumScheme) -> Result<Frame, ProtocolError> {
        match self {
            Packet::CurrentState(state) => {
                encode_with(MessageType::CurrentState, &[state.as_u8()], scheme)
            }
            Packet::ErrorState(code) => encode_with(MessageType::ErrorState, &[code.as_u8()], scheme),
            Packet::Rpc { command, data } => {
                encode_with(MessageType::Rpc, &rpc_payload(*command, data)?, scheme)
            }
            Packet::RpcResult { command, fields } => encode_with(
                MessageType::RpcResult,
                &rpc_result_payload(*command, fields)?,
                scheme,
            ),
        }
    }
}

/// 8-bit truncated sum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Frame a payload with the whole-frame checksum
pub fn encode(message_type: MessageType, payload: &[u8]) -> Result<Frame, ProtocolError> {
    encode_with(message_type, payload, ChecksumScheme::Frame)
}

/// Frame a payload: header, payload, checksum.
///
/// The frame is the same length under both schemes; only the declared length
/// and the checksum coverage differ.
pub fn encode_with(
    message_type: MessageType,
    payload: &[u8],
    scheme: ChecksumScheme,
) -> Result<Frame, ProtocolError> {
    let embedded = scheme.embeds_checksum(message_type.as_u8());
    let declared = if embedded {
        payload.len() + CHECKSUM_SIZE
    } else {
        payload.len()
    };
    if declared > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FieldTooLong {
            field: "payload",
            len: payload.len(),
        });
    }

    let mut bytes = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    bytes.put_slice(MAGIC);
    bytes.put_u8(PROTOCOL_VERSION);
    bytes.put_u8(message_type.as_u8());
    bytes.put_u8(declared as u8);
    bytes.put_slice(payload);

    let sum = checksum(scheme.covered(message_type.as_u8(), &bytes));
    bytes.put_u8(sum);

    Ok(Frame::from_framed(bytes.freeze()))
}

/// RPC frame: payload is `[command, len(data), data...]`
pub fn encode_rpc(command: RpcCommand, data: &[u8]) -> Result<Frame, ProtocolError> {
    encode(MessageType::Rpc, &rpc_payload(command, data)?)
}

/// RPC_RESULT frame: payload is `[command, total, (len, bytes)...]`.
///
/// This is what a device sends; the engine uses it for simulation and tests.
pub fn encode_rpc_result<S: AsRef<str>>(
    command: RpcCommand,
    fields: &[S],
) -> Result<Frame, ProtocolError> {
    encode(MessageType::RpcResult, &rpc_result_payload(command, fields)?)
}

pub(crate) fn rpc_payload(command: RpcCommand, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_PAYLOAD_SIZE - 2 {
        return Err(ProtocolError::FieldTooLong {
            field: "RPC data",
            len: data.len(),
        });
    }
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.push(command.as_u8());
    payload.push(data.len() as u8);
    payload.extend_from_slice(data);
    Ok(payload)
}

fn rpc_result_payload<S: AsRef<str>>(
    command: RpcCommand,
    fields: &[S],
) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    for field in fields {
        let bytes = field.as_ref().as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(ProtocolError::FieldTooLong {
                field: "result field",
                len: bytes.len(),
            });
        }
        body.push(bytes.len() as u8);
        body.extend_from_slice(bytes);
    }
    rpc_payload(command, &body)
}

/// Validate and decode a frame using the whole-frame checksum
pub fn decode(frame: &Frame) -> Result<Packet, DecodeError> {
    decode_with(frame, ChecksumScheme::Frame)
}

/// Validate and decode a frame.
///
/// Checks, in order: magic, declared length, checksum, version, message type,
/// payload shape.
pub fn decode_with(frame: &Frame, scheme: ChecksumScheme) -> Result<Packet, DecodeError> {
    let magic = frame.magic();
    if &magic != MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }

    let type_byte = frame.message_type_byte();
    if frame.len() != scheme.frame_len(type_byte, frame.declared_len()) {
        return Err(DecodeError::LengthMismatch {
            declared: frame.declared_len(),
            actual: frame.len(),
        });
    }
    let expected = checksum(scheme.covered(type_byte, frame.checksummed_bytes()));
    if expected != frame.checksum() {
        return Err(DecodeError::ChecksumMismatch {
            expected,
            actual: frame.checksum(),
        });
    }

    if frame.version() != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(frame.version()));
    }

    let message_type =
        MessageType::from_u8(type_byte).ok_or(DecodeError::UnknownMessageType(type_byte))?;
    let payload = frame.payload();

    match message_type {
        MessageType::CurrentState => {
            let byte = *payload
                .first()
                .ok_or(DecodeError::Truncated("missing state byte"))?;
            DeviceState::from_u8(byte)
                .map(Packet::CurrentState)
                .ok_or(DecodeError::UnknownState(byte))
        }
        MessageType::ErrorState => {
            let byte = *payload
                .first()
                .ok_or(DecodeError::Truncated("missing error byte"))?;
            Ok(Packet::ErrorState(ErrorCode::from_u8(byte)))
        }
        MessageType::Rpc => {
            let (command, data) = split_rpc(payload)?;
            Ok(Packet::Rpc {
                command,
                data: data.to_vec(),
            })
        }
        MessageType::RpcResult => {
            let (command, body) = split_rpc(payload)?;
            Ok(Packet::RpcResult {
                command,
                fields: parse_fields(body)?,
            })
        }
    }
}

/// `[command, len, body...]` -> (command, body[..len])
fn split_rpc(payload: &[u8]) -> Result<(RpcCommand, &[u8]), DecodeError> {
    if payload.len() < 2 {
        return Err(DecodeError::Truncated("missing RPC command or length"));
    }
    let command = RpcCommand::from_u8(payload[0]).ok_or(DecodeError::UnknownCommand(payload[0]))?;
    let len = payload[1] as usize;
    let body = payload
        .get(2..2 + len)
        .ok_or(DecodeError::Truncated("RPC length exceeds payload"))?;
    Ok((command, body))
}

fn parse_fields(mut body: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut fields = Vec::new();
    while let Some((&len, rest)) = body.split_first() {
        let len = len as usize;
        if rest.len() < len {
            return Err(DecodeError::Truncated("field length exceeds RPC data"));
        }
        let (text, rest) = rest.split_at(len);
        fields.push(String::from_utf8_lossy(text).into_owned());
        body = rest;
    }
    Ok(fields)
}

/// Formats bytes as `[0x49, 0x4D, ...]` for logs
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "0x{byte:02X}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
