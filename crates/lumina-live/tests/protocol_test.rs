//! MoQ wire-format integration tests.
//!
//! These exercise the public codec surface the way a transport adapter uses
//! it: frame bytes arrive in arbitrary chunks, messages are decoded through
//! [`MoqMessage`], and objects are reassembled from media-stream bytes.
//!
//! ```bash
//! cargo test --package lumina-live --test protocol_test
//! ```

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use lumina_live::moq::message::message_type;
use lumina_live::moq::{
    decode_varint, encode_varint, frame_control_message, parse_control_message, varint_len,
    ControlMessage, ControlMessageFramer, GroupOrder, Location, MediaObject, MoqError, MoqMessage,
    ObjectExtensions, ProtocolErrorClass, SubscribeOk, MAX_VARINT,
};

/// Values straddling every varint length boundary.
const BOUNDARY_VALUES: &[(u64, usize)] = &[
    (0, 1),
    (63, 1),
    (64, 2),
    (16_383, 2),
    (16_384, 4),
    (1_073_741_823, 4),
    (1_073_741_824, 8),
    (MAX_VARINT, 8),
];

#[test]
fn test_varint_minimal_length_at_boundaries() {
    for &(value, len) in BOUNDARY_VALUES {
        let mut buf = BytesMut::new();
        encode_varint(value, &mut buf).unwrap();
        assert_eq!(buf.len(), len, "encoded length of {value}");
        assert_eq!(varint_len(value), len);

        let (decoded, consumed) = decode_varint(&buf, 0).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, len);
    }
}

#[test]
fn test_varint_sweep() {
    // Multiplicative walk covers every magnitude without a full grid
    let mut value = 1u64;
    while value <= MAX_VARINT {
        let mut buf = BytesMut::new();
        encode_varint(value, &mut buf).unwrap();
        assert_eq!(decode_varint(&buf, 0).unwrap(), (value, varint_len(value)));
        value = value * 3 + 1;
    }
}

#[test]
fn test_varint_out_of_range_and_truncation() {
    let mut buf = BytesMut::new();
    assert_eq!(
        encode_varint(MAX_VARINT + 1, &mut buf),
        Err(MoqError::VarintOutOfRange(MAX_VARINT + 1))
    );
    assert!(buf.is_empty());

    // 4-byte prefix with only two bytes present
    assert!(matches!(
        decode_varint(&[0x80, 0x01], 0),
        Err(MoqError::Underflow { needed: 4, available: 2 })
    ));
}

#[test]
fn test_control_frame_payload_lengths() {
    for len in [0usize, 1, 63, 64, 255, 256, 4096, 65_534, 65_535] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let framed = frame_control_message(message_type::SUBSCRIBE_OK, &payload).unwrap();
        assert_eq!(framed.len(), 1 + 2 + len);

        let (msg, consumed) = parse_control_message(&framed).unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(msg.msg_type, message_type::SUBSCRIBE_OK);
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    let too_big = vec![0u8; 65_536];
    assert_eq!(
        frame_control_message(message_type::SUBSCRIBE, &too_big),
        Err(MoqError::PayloadTooLarge(65_536))
    );
}

#[test]
fn test_framer_reassembles_byte_at_a_time() {
    let mut wire = BytesMut::new();
    for (msg_type, payload) in [(0x21u64, &b"abc"[..]), (0x04, &b""[..]), (0x1234, &b"xyz!"[..])] {
        wire.put(frame_control_message(msg_type, payload).unwrap());
    }
    let chunks: VecDeque<Bytes> = wire.iter().map(|&b| Bytes::copy_from_slice(&[b])).collect();

    let mut framer = ControlMessageFramer::new(chunks);
    assert_eq!(
        framer.read().unwrap(),
        Some(ControlMessage::new(0x21, &b"abc"[..]))
    );
    assert_eq!(framer.read().unwrap(), Some(ControlMessage::new(0x04, Bytes::new())));
    assert_eq!(
        framer.read().unwrap(),
        Some(ControlMessage::new(0x1234, &b"xyz!"[..]))
    );
    assert_eq!(framer.read().unwrap(), None);
}

#[test]
fn test_framer_truncated_stream_is_framing_error() {
    let framed = frame_control_message(0x03, b"hello").unwrap();
    let chunks: VecDeque<Bytes> = VecDeque::from([framed.slice(..4)]);
    let mut framer = ControlMessageFramer::new(chunks);
    let err = framer.read().unwrap_err();
    assert_eq!(err.class(), ProtocolErrorClass::Framing);
}

#[test]
fn test_subscribe_ok_without_content_reads_nothing_past_flag() {
    let ok = SubscribeOk {
        request_id: 2,
        track_alias: 7,
        expires: 0,
        group_order: GroupOrder::Ascending,
        largest: None,
    };
    let encoded = MoqMessage::SubscribeOk(ok.clone()).encode().unwrap();

    // Trailing bytes after the flag must be left alone, not parsed as a location
    let mut payload = BytesMut::from(&encoded.payload[..]);
    payload.put_slice(&[0xff, 0xff]);
    let mut buf = payload.freeze();
    let decoded = SubscribeOk::decode(&mut buf).unwrap();
    assert_eq!(decoded, ok);
    assert_eq!(&buf[..], &[0xff, 0xff]);

    let with_content = SubscribeOk {
        largest: Some(Location { group: 10, object: 3 }),
        ..ok
    };
    let msg = MoqMessage::SubscribeOk(with_content.clone()).encode().unwrap();
    assert_eq!(
        MoqMessage::decode(&msg).unwrap(),
        MoqMessage::SubscribeOk(with_content)
    );
}

#[test]
fn test_unknown_message_type_passes_through() {
    let msg = ControlMessage::new(0x7777, &b"opaque"[..]);
    assert_eq!(
        MoqMessage::decode(&msg).unwrap(),
        MoqMessage::Unknown { msg_type: 0x7777 }
    );
}

#[test]
fn test_media_objects_back_to_back() {
    let objects = [
        MediaObject {
            object_id: 0,
            extensions: ObjectExtensions {
                capture_timestamp_us: Some(1_000_000),
                is_keyframe: true,
                video_config: Some(Bytes::from_static(b"avcC")),
            },
            payload: Bytes::from_static(b"idr"),
        },
        MediaObject {
            object_id: 1,
            extensions: ObjectExtensions {
                capture_timestamp_us: Some(1_033_333),
                ..Default::default()
            },
            payload: Bytes::from_static(b"p-frame"),
        },
    ];

    let mut wire = BytesMut::new();
    for object in &objects {
        object.encode(&mut wire).unwrap();
    }
    let mut wire = wire.freeze();
    for expected in &objects {
        assert_eq!(&MediaObject::decode(&mut wire).unwrap(), expected);
    }
    assert!(wire.is_empty());
}
