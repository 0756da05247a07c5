//! Simulated Improv device on the far end of an in-memory pipe

#![allow(dead_code)]

use bytes::BytesMut;
use improv_core::protocol::{
    decode_with, ChecksumScheme, Connection, ConnectionConfig, DeviceInfo, DeviceState,
    ErrorCode, Frame, Framer, Packet, RpcCommand, Transport,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const INFO_FIELDS: &[&str] = &["ESPHome", "2024.6.0", "ESP32-C3", "kitchen-light"];
pub const NEXT_URL: &str = "http://192.168.1.50/setup";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct FakeDevice {
    stream: DuplexStream,
    framer: Framer,
    buf: BytesMut,
    scheme: ChecksumScheme,
}

/// A session and the device it talks to
pub fn pair() -> (Connection, FakeDevice) {
    pair_with(ConnectionConfig::default())
}

pub fn pair_with(config: ConnectionConfig) -> (Connection, FakeDevice) {
    init_tracing();
    let (local, remote) = tokio::io::duplex(1024);
    let device = FakeDevice {
        stream: remote,
        framer: Framer::with_scheme(config.checksum),
        buf: BytesMut::new(),
        scheme: config.checksum,
    };
    (Connection::new(Transport::from_stream(local), config), device)
}

impl FakeDevice {
    /// Next frame written by the session, or `None` once it hangs up
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.framer.next_frame(&mut self.buf) {
                return Some(frame);
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    pub async fn next_rpc(&mut self) -> (RpcCommand, Vec<u8>) {
        let frame = self.next_frame().await.expect("session hung up");
        match decode_with(&frame, self.scheme).unwrap() {
            Packet::Rpc { command, data } => (command, data),
            other => panic!("expected an RPC, got {other:?}"),
        }
    }

    /// True if nothing arrives within `wait`
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.next_frame()).await.is_err()
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn send(&mut self, packet: Packet) {
        let frame = packet.encode(self.scheme).unwrap();
        self.send_raw(frame.as_bytes()).await;
    }

    pub async fn send_state(&mut self, state: DeviceState) {
        self.send(Packet::CurrentState(state)).await;
    }

    pub async fn send_error(&mut self, code: ErrorCode) {
        self.send(Packet::ErrorState(code)).await;
    }

    pub async fn send_result(&mut self, command: RpcCommand, fields: &[&str]) {
        let fields = fields.iter().map(|f| f.to_string()).collect();
        self.send(Packet::RpcResult { command, fields }).await;
    }
}

/// Run `initialize` against the device answering as `state`
pub async fn handshake(
    session: &mut Connection,
    device: &mut FakeDevice,
    state: DeviceState,
) -> DeviceInfo {
    let (info, ()) = tokio::join!(session.initialize(None), async {
        let (command, data) = device.next_rpc().await;
        assert_eq!(command, RpcCommand::RequestCurrentState);
        assert!(data.is_empty());

        device.send_state(state).await;
        if state == DeviceState::Provisioned {
            device
                .send_result(RpcCommand::RequestCurrentState, &[NEXT_URL])
                .await;
        }

        let (command, _) = device.next_rpc().await;
        assert_eq!(command, RpcCommand::RequestInfo);
        device.send_result(RpcCommand::RequestInfo, INFO_FIELDS).await;
    });
    info.expect("handshake failed")
}
