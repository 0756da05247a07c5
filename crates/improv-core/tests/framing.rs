//! Framer and codec behaviour over realistic serial traffic

use improv_core::protocol::{
    decode, encode, encode_rpc_result, DecodeError, DeviceState, ErrorCode, Frame, Framer,
    MessageType, Packet, RpcCommand,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

/// Boot log of an ESPHome device with Improv frames interleaved
fn boot_capture() -> (Vec<u8>, Vec<Frame>) {
    let frames = vec![
        encode(MessageType::CurrentState, &[DeviceState::Ready.as_u8()]).unwrap(),
        encode(MessageType::ErrorState, &[ErrorCode::NoError.as_u8()]).unwrap(),
        encode_rpc_result(
            RpcCommand::RequestInfo,
            &["ESPHome", "2024.6.0", "ESP32", "porch"],
        )
        .unwrap(),
    ];

    let mut stream = Vec::new();
    stream.extend_from_slice(b"ets Jun  8 2016 00:22:57\r\n");
    stream.extend_from_slice(b"rst:0x1 (POWERON_RESET),boot:0x13 (SPI_FAST_FLASH_BOOT)\r\n");
    stream.extend_from_slice(frames[0].as_bytes());
    stream.extend_from_slice(b"[I][logger:034]: Log initialized\n");
    stream.extend_from_slice(frames[1].as_bytes());
    stream.extend_from_slice(b"\n");
    stream.extend_from_slice(frames[2].as_bytes());
    (stream, frames)
}

#[test]
fn test_boot_capture_yields_every_frame() {
    let (stream, frames) = boot_capture();
    let mut framer = Framer::new();
    assert_eq!(framer.feed(&stream), frames);
    assert_eq!(framer.discarded_lines(), 3);
}

#[test]
fn test_decode_boot_capture() {
    let (stream, _) = boot_capture();
    let packets: Vec<Packet> = Framer::new()
        .feed(&stream)
        .iter()
        .map(|frame| decode(frame).unwrap())
        .collect();

    assert_eq!(
        packets,
        vec![
            Packet::CurrentState(DeviceState::Ready),
            Packet::ErrorState(ErrorCode::NoError),
            Packet::RpcResult {
                command: RpcCommand::RequestInfo,
                fields: vec![
                    "ESPHome".to_string(),
                    "2024.6.0".to_string(),
                    "ESP32".to_string(),
                    "porch".to_string(),
                ],
            },
        ]
    );
}

#[test]
fn test_invalid_utf8_is_replaced() {
    let frame = encode(
        MessageType::RpcResult,
        &[0x04, 0x05, 0x01, b'A', 0x02, 0xFF, b'B'],
    )
    .unwrap();
    assert_eq!(
        decode(&frame).unwrap(),
        Packet::RpcResult {
            command: RpcCommand::RequestWifiNetworks,
            fields: vec!["A".to_string(), "\u{FFFD}B".to_string()],
        }
    );
}

#[test]
fn test_unknown_rpc_command_in_result() {
    let frame = encode(MessageType::RpcResult, &[0x09, 0x00]).unwrap();
    assert_eq!(decode(&frame), Err(DecodeError::UnknownCommand(0x09)));
}

proptest! {
    /// Chunk boundaries never change what the framer produces
    #[test]
    fn prop_chunking_is_irrelevant(cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12)) {
        let (stream, frames) = boot_capture();
        let mut offsets: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len())).collect();
        offsets.push(stream.len());
        offsets.sort_unstable();

        let mut framer = Framer::new();
        let mut produced = Vec::new();
        let mut start = 0;
        for end in offsets {
            produced.extend(framer.feed(&stream[start..end]));
            start = end;
        }
        prop_assert_eq!(produced, frames);
    }

    /// A newline-terminated line that does not start with the magic never
    /// hides the frame after it
    #[test]
    fn prop_resync_after_noise(noise in "[ -~]{9,80}") {
        prop_assume!(!noise.starts_with("IMPROV"));
        let frame = encode(MessageType::CurrentState, &[DeviceState::Provisioned.as_u8()]).unwrap();

        let mut stream = noise.into_bytes();
        stream.push(b'\n');
        stream.extend_from_slice(frame.as_bytes());

        prop_assert_eq!(Framer::new().feed(&stream), vec![frame]);
    }
}
