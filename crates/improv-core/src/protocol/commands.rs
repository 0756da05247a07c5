//! Protocol enumerations
//!
//! Message types, device states, error codes and RPC commands as they appear
//! on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame message type (byte 7 of every frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Device to client: current provisioning state
    CurrentState = 0x01,
    /// Device to client: error code
    ErrorState = 0x02,
    /// Client to device: remote procedure call
    Rpc = 0x03,
    /// Device to client: result of an RPC
    RpcResult = 0x04,
}

impl MessageType {
    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::CurrentState),
            0x02 => Some(Self::ErrorState),
            0x03 => Some(Self::Rpc),
            0x04 => Some(Self::RpcResult),
            _ => None,
        }
    }

    /// Convert to the wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this type carry an RPC sub-payload
    pub const fn is_rpc(self) -> bool {
        matches!(self, Self::Rpc | Self::RpcResult)
    }
}

/// Provisioning state reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceState {
    /// Ready to accept Wi-Fi credentials
    Ready = 0x02,
    /// Trying to join the network
    Provisioning = 0x03,
    /// Joined the network
    Provisioned = 0x04,
}

impl DeviceState {
    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::Ready),
            0x03 => Some(Self::Provisioning),
            0x04 => Some(Self::Provisioned),
            _ => None,
        }
    }

    /// Convert to the wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Provisioning => "PROVISIONING",
            Self::Provisioned => "PROVISIONED",
        };
        f.write_str(name)
    }
}

/// Error code reported by the device.
///
/// `Timeout` never comes from the device; the engine synthesizes it when a
/// caller-supplied deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// Rest state
    #[default]
    NoError = 0x00,
    /// The RPC frame could not be parsed
    InvalidRpcPacket = 0x01,
    /// The firmware does not implement the command
    UnknownRpcCommand = 0x02,
    /// Joining the network failed
    UnableToConnect = 0x03,
    /// No answer before the caller's deadline
    Timeout = 0xFE,
    /// Any other code
    UnknownError = 0xFF,
}

impl ErrorCode {
    /// Convert from the wire byte. Codes this engine does not know collapse
    /// into `UnknownError`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::InvalidRpcPacket,
            0x02 => Self::UnknownRpcCommand,
            0x03 => Self::UnableToConnect,
            0xFE => Self::Timeout,
            _ => Self::UnknownError,
        }
    }

    /// Convert to the wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Anything other than `NoError` fails the pending RPC
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NO_ERROR",
            Self::InvalidRpcPacket => "INVALID_RPC_PACKET",
            Self::UnknownRpcCommand => "UNKNOWN_RPC_COMMAND",
            Self::UnableToConnect => "UNABLE_TO_CONNECT",
            Self::Timeout => "TIMEOUT",
            Self::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(name)
    }
}

/// Commands the client can invoke on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RpcCommand {
    /// Send SSID and password
    SendWifiSettings = 0x01,
    /// Ask for the current state (and next URL when provisioned)
    RequestCurrentState = 0x02,
    /// Firmware name, version, chip family, device name
    RequestInfo = 0x03,
    /// Stream of visible networks, terminated by an empty result
    RequestWifiNetworks = 0x04,
}

impl RpcCommand {
    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SendWifiSettings),
            0x02 => Some(Self::RequestCurrentState),
            0x03 => Some(Self::RequestInfo),
            0x04 => Some(Self::RequestWifiNetworks),
            _ => None,
        }
    }

    /// Convert to the wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the device answers with a stream of results rather than one
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::RequestWifiNetworks)
    }
}

impl fmt::Display for RpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SendWifiSettings => "SEND_WIFI_SETTINGS",
            Self::RequestCurrentState => "REQUEST_CURRENT_STATE",
            Self::RequestInfo => "REQUEST_INFO",
            Self::RequestWifiNetworks => "REQUEST_WIFI_NETWORKS",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_bytes() {
        for ty in [
            MessageType::CurrentState,
            MessageType::ErrorState,
            MessageType::Rpc,
            MessageType::RpcResult,
        ] {
            assert_eq!(MessageType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(MessageType::from_u8(0x05), None);
        assert!(MessageType::RpcResult.is_rpc());
        assert!(!MessageType::ErrorState.is_rpc());
    }

    #[test]
    fn test_device_state_bytes() {
        assert_eq!(DeviceState::from_u8(0x02), Some(DeviceState::Ready));
        assert_eq!(DeviceState::from_u8(0x04), Some(DeviceState::Provisioned));
        assert_eq!(DeviceState::from_u8(0x01), None);
    }

    #[test]
    fn test_unknown_error_codes_collapse() {
        assert_eq!(ErrorCode::from_u8(0xFE), ErrorCode::Timeout);
        assert_eq!(ErrorCode::from_u8(0x42), ErrorCode::UnknownError);
        assert!(!ErrorCode::NoError.is_error());
        assert!(ErrorCode::UnknownRpcCommand.is_error());
    }

    #[test]
    fn test_only_network_scan_streams() {
        assert!(RpcCommand::RequestWifiNetworks.is_streaming());
        assert!(!RpcCommand::RequestInfo.is_streaming());
        assert_eq!(RpcCommand::SendWifiSettings.to_string(), "SEND_WIFI_SETTINGS");
    }
}
