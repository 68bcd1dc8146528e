//! Media objects and their header extensions.
//!
//! Objects arrive on per-group media streams as
//!
//! ```text
//! [varint object_id][varint ext_len][ext_len bytes extensions][varint payload_len][payload]
//! ```
//!
//! The extension block is a tag-length-value list: odd tags carry a
//! length-prefixed byte string, even tags a single varint.

use bytes::{Buf, Bytes, BytesMut};

use super::error::MoqError;
use super::message::{read_bytes, write_bytes};
use super::varint::{encode_varint, read_varint};

/// Capture timestamp in microseconds (even tag, varint).
pub const EXT_CAPTURE_TIMESTAMP: u64 = 0x02;
/// Video frame marking flags (even tag, varint).
pub const EXT_VIDEO_FRAME_MARKING: u64 = 0x04;
/// Opaque decoder configuration record (odd tag, bytes).
pub const EXT_VIDEO_CONFIG: u64 = 0x0d;

/// Frame-marking bit set on independently decodable frames.
pub const FRAME_MARKING_KEYFRAME: u64 = 0x20;

/// Extensions attached to a single media object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectExtensions {
    /// Sender capture time in microseconds.
    pub capture_timestamp_us: Option<u64>,
    /// Whether frame marking flagged this object as a keyframe.
    pub is_keyframe: bool,
    /// Decoder configuration (e.g. avcC) carried in-band.
    pub video_config: Option<Bytes>,
}

impl ObjectExtensions {
    /// Parses an extension block. Unrecognized tags of either parity are skipped.
    pub fn parse(mut block: Bytes) -> Result<Self, MoqError> {
        let mut ext = Self::default();
        while block.has_remaining() {
            let tag = read_varint(&mut block).map_err(|e| e.in_field("extension tag"))?;
            if tag % 2 == 1 {
                let value = read_bytes(&mut block).map_err(|e| e.in_field("extension value"))?;
                match tag {
                    EXT_VIDEO_CONFIG => ext.video_config = Some(value),
                    _ => tracing::trace!("MoQ: skipping object extension 0x{:x}", tag),
                }
            } else {
                let value = read_varint(&mut block).map_err(|e| e.in_field("extension value"))?;
                match tag {
                    EXT_CAPTURE_TIMESTAMP => ext.capture_timestamp_us = Some(value),
                    EXT_VIDEO_FRAME_MARKING => {
                        ext.is_keyframe = value & FRAME_MARKING_KEYFRAME != 0;
                    }
                    _ => tracing::trace!("MoQ: skipping object extension 0x{:x}", tag),
                }
            }
        }
        Ok(ext)
    }

    /// Serializes the present extensions in tag order.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        if let Some(ts) = self.capture_timestamp_us {
            encode_varint(EXT_CAPTURE_TIMESTAMP, buf)?;
            encode_varint(ts, buf)?;
        }
        if self.is_keyframe {
            encode_varint(EXT_VIDEO_FRAME_MARKING, buf)?;
            encode_varint(FRAME_MARKING_KEYFRAME, buf)?;
        }
        if let Some(config) = &self.video_config {
            encode_varint(EXT_VIDEO_CONFIG, buf)?;
            write_bytes(buf, config)?;
        }
        Ok(())
    }
}

/// One object read from a media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaObject {
    pub object_id: u64,
    pub extensions: ObjectExtensions,
    pub payload: Bytes,
}

impl MediaObject {
    /// Decodes one object from the front of `buf`, advancing it.
    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let object_id = read_varint(buf).map_err(|e| e.in_field("object id"))?;
        let ext_block = read_bytes(buf).map_err(|e| e.in_field("object extensions"))?;
        let extensions = ObjectExtensions::parse(ext_block)?;
        let payload = read_bytes(buf).map_err(|e| e.in_field("object payload"))?;
        Ok(Self {
            object_id,
            extensions,
            payload,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.object_id, buf)?;
        let mut ext = BytesMut::new();
        self.extensions.encode(&mut ext)?;
        write_bytes(buf, &ext)?;
        write_bytes(buf, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_extensions() {
        let mut block = BytesMut::new();
        encode_varint(EXT_CAPTURE_TIMESTAMP, &mut block).unwrap();
        encode_varint(1_700_000_000_123_456, &mut block).unwrap();
        encode_varint(EXT_VIDEO_FRAME_MARKING, &mut block).unwrap();
        encode_varint(0x20 | 0x01, &mut block).unwrap();
        encode_varint(EXT_VIDEO_CONFIG, &mut block).unwrap();
        write_bytes(&mut block, &[0x01, 0x64, 0x00, 0x1f]).unwrap();

        let ext = ObjectExtensions::parse(block.freeze()).unwrap();
        assert_eq!(ext.capture_timestamp_us, Some(1_700_000_000_123_456));
        assert!(ext.is_keyframe);
        assert_eq!(ext.video_config.as_deref(), Some(&[0x01, 0x64, 0x00, 0x1f][..]));
    }

    #[test]
    fn test_frame_marking_without_keyframe_bit() {
        let mut block = BytesMut::new();
        encode_varint(EXT_VIDEO_FRAME_MARKING, &mut block).unwrap();
        encode_varint(0x01, &mut block).unwrap();
        let ext = ObjectExtensions::parse(block.freeze()).unwrap();
        assert!(!ext.is_keyframe);
        assert_eq!(ext.capture_timestamp_us, None);
    }

    #[test]
    fn test_unknown_tags_skipped() {
        let mut block = BytesMut::new();
        // Unknown odd tag with a payload that looks like a timestamp extension
        encode_varint(0x21, &mut block).unwrap();
        write_bytes(&mut block, &[0x02, 0x05]).unwrap();
        // Unknown even tag
        encode_varint(0x40, &mut block).unwrap();
        encode_varint(99_999, &mut block).unwrap();
        encode_varint(EXT_CAPTURE_TIMESTAMP, &mut block).unwrap();
        encode_varint(42, &mut block).unwrap();

        let ext = ObjectExtensions::parse(block.freeze()).unwrap();
        assert_eq!(ext.capture_timestamp_us, Some(42));
        assert!(ext.video_config.is_none());
    }

    #[test]
    fn test_truncated_extension() {
        let mut block = BytesMut::new();
        encode_varint(EXT_VIDEO_CONFIG, &mut block).unwrap();
        encode_varint(10, &mut block).unwrap();
        block.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            ObjectExtensions::parse(block.freeze()),
            Err(MoqError::Field(_))
        ));
    }

    #[test]
    fn test_media_object_stream() {
        let objects = [
            MediaObject {
                object_id: 0,
                extensions: ObjectExtensions {
                    capture_timestamp_us: Some(1_000),
                    is_keyframe: true,
                    video_config: Some(Bytes::from_static(b"avcC")),
                },
                payload: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            },
            MediaObject {
                object_id: 1,
                extensions: ObjectExtensions {
                    capture_timestamp_us: Some(17_666),
                    ..Default::default()
                },
                payload: Bytes::from_static(&[0, 0, 0, 1, 0x41]),
            },
        ];

        let mut stream = BytesMut::new();
        for object in &objects {
            object.encode(&mut stream).unwrap();
        }
        let mut stream = stream.freeze();
        for expected in &objects {
            assert_eq!(&MediaObject::decode(&mut stream).unwrap(), expected);
        }
        assert!(stream.is_empty());
    }
}
