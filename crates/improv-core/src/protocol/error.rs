//! Protocol errors

use thiserror::Error;

use super::commands::ErrorCode;

/// Reasons a raw frame is rejected by the codec.
///
/// These never tear down a session: the reader logs them and drops the frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the smallest possible frame
    #[error("frame too short: need at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum frame length
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// Header length byte disagrees with the frame size
    #[error("declared length {declared} does not match a {actual}-byte frame")]
    LengthMismatch {
        /// Length byte from the header
        declared: u8,
        /// Frame size in bytes
        actual: usize,
    },

    /// First six bytes are not "IMPROV"
    #[error("invalid magic: {0:02X?}")]
    InvalidMagic([u8; 6]),

    /// Version byte other than 1
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Checksum byte does not match the computed sum
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Computed sum
        expected: u8,
        /// Byte carried by the frame
        actual: u8,
    },

    /// Message type byte outside 1..=4
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// State byte outside 2..=4
    #[error("unknown device state {0:#04x}")]
    UnknownState(u8),

    /// RPC command byte outside 1..=4
    #[error("unknown RPC command {0:#04x}")]
    UnknownCommand(u8),

    /// A length field points past the end of the payload
    #[error("payload truncated: {0}")]
    Truncated(&'static str),
}

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Another call that expects feedback is outstanding
    #[error("only one RPC command that requires feedback can be active")]
    CallInProgress,

    /// The device answered with ERROR_STATE, or the call timed out
    #[error("device reported {0}")]
    Device(ErrorCode),

    /// No state report before the handshake deadline
    #[error("Improv Wi-Fi Serial not detected")]
    DeviceNotDetected,

    /// The reader stopped before the call resolved
    #[error("connection closed while waiting for the device")]
    Disconnected,

    /// The session is not reading (never initialized, or closed)
    #[error("Not connected to device")]
    NotConnected,

    /// `initialize` was already called on this session
    #[error("Already connected")]
    AlreadyConnected,

    /// A value does not fit in its length byte
    #[error("{field} is {len} bytes, at most 255 fit in a field")]
    FieldTooLong {
        /// What was being encoded
        field: &'static str,
        /// Its length in bytes
        len: usize,
    },

    /// The device answered with something unusable
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// A frame failed validation
    #[error("Undecodable frame: {0}")]
    Decode(#[from] DecodeError),

    /// Opening or configuring the serial port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Transport read or write failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Device-reported error code, when the failure came from the device
    /// (or from a synthesized timeout).
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::Device(code) => Some(*code),
            _ => None,
        }
    }

    /// True for failures that leave the session unusable
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::DeviceNotDetected
                | ProtocolError::Disconnected
                | ProtocolError::NotConnected
                | ProtocolError::SerialError(_)
                | ProtocolError::IoError(_)
        )
    }
}
