//! Improv Serial Protocol
//!
//! Implements the Improv Wi-Fi serial protocol used to detect, query and
//! provision microcontrollers over a raw duplex byte stream.
//!
//! The stream may carry ordinary log lines from the device firmware; the
//! [`Framer`] picks protocol frames out of it and discards everything else.

pub mod command_builder;
pub mod commands;
mod connection;
mod error;
mod events;
mod framer;
mod packet;
mod rpc;
#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
pub mod serial;
pub mod stream;

pub use command_builder::CommandBuilder;
pub use commands::{DeviceState, ErrorCode, MessageType, RpcCommand};
pub use connection::{Connection, ConnectionConfig, ConnectionState, DeviceInfo, NetworkEntry};
pub use error::{DecodeError, ProtocolError};
pub use events::SessionEvent;
pub use framer::{Frame, Framer};
pub use packet::{
    checksum, decode, decode_with, encode, encode_rpc, encode_rpc_result, encode_with,
    ChecksumScheme, HexBytes, Packet,
};
pub use rpc::{CallId, RpcCorrelator, RpcOutcome, RpcReceiver, RpcReply};
pub use stream::{ByteSink, ByteSource, Transport};

/// Frame magic ("IMPROV")
pub const MAGIC: &[u8; 6] = b"IMPROV";

/// The single protocol version this engine speaks
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Magic + version + message type + payload length
pub const HEADER_SIZE: usize = 9;

/// Trailing checksum byte
pub const CHECKSUM_SIZE: usize = 1;

/// Largest payload a single frame can declare
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Baud rate Improv firmware listens on
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// How long `initialize` waits for the first state report
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// Bytes requested from the source per read
pub const READ_CHUNK_SIZE: usize = 256;
