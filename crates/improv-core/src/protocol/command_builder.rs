//! Command Builder
//!
//! Builds RPC frames for each Improv command.
//!
//! RPC data layouts:
//! - SEND_WIFI_SETTINGS    : len(ssid) ssid len(password) password
//! - REQUEST_CURRENT_STATE : (empty)
//! - REQUEST_INFO          : (empty)
//! - REQUEST_WIFI_NETWORKS : (empty)

use super::packet::{encode_with, rpc_payload, ChecksumScheme};
use super::{Frame, MessageType, ProtocolError, RpcCommand};

/// Build RPC frames with a fixed checksum scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder {
    scheme: ChecksumScheme,
}

impl CommandBuilder {
    /// Builder producing frames for `scheme`
    pub fn new(scheme: ChecksumScheme) -> Self {
        Self { scheme }
    }

    /// Checksum scheme in use
    pub fn scheme(&self) -> ChecksumScheme {
        self.scheme
    }

    /// Frame `command` with arbitrary RPC data
    pub fn build(&self, command: RpcCommand, data: &[u8]) -> Result<Frame, ProtocolError> {
        encode_with(MessageType::Rpc, &rpc_payload(command, data)?, self.scheme)
    }

    /// REQUEST_CURRENT_STATE frame
    pub fn request_current_state(&self) -> Result<Frame, ProtocolError> {
        self.build(RpcCommand::RequestCurrentState, &[])
    }

    /// REQUEST_INFO frame
    pub fn request_info(&self) -> Result<Frame, ProtocolError> {
        self.build(RpcCommand::RequestInfo, &[])
    }

    /// REQUEST_WIFI_NETWORKS frame
    pub fn request_wifi_networks(&self) -> Result<Frame, ProtocolError> {
        self.build(RpcCommand::RequestWifiNetworks, &[])
    }

    /// SEND_WIFI_SETTINGS frame for the given credentials
    pub fn send_wifi_settings(&self, ssid: &str, password: &str) -> Result<Frame, ProtocolError> {
        let data = wifi_settings_data(ssid, password)?;
        self.build(RpcCommand::SendWifiSettings, &data)
    }
}

/// Encode SSID and password as two length-prefixed byte strings.
pub fn wifi_settings_data(ssid: &str, password: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut data = Vec::with_capacity(2 + ssid.len() + password.len());
    push_field(&mut data, "SSID", ssid.as_bytes())?;
    push_field(&mut data, "password", password.as_bytes())?;
    Ok(data)
}

fn push_field(data: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), ProtocolError> {
    let len = u8::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    data.push(len);
    data.extend_from_slice(bytes);
    Ok(())
}
