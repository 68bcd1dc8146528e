//! Session-setup and subscription control messages.
//!
//! Each message knows how to encode its payload and decode it from a framed
//! [`ControlMessage`]. Decoding consumes only the bytes the layout declares;
//! trailing bytes are left in the cursor and ignored by [`MoqMessage::decode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::MoqError;
use super::framer::{ControlMessage, MAX_CONTROL_PAYLOAD};
use super::varint::{encode_varint, read_varint};

/// Control message type codes.
pub mod message_type {
    pub const SUBSCRIBE: u64 = 0x03;
    pub const SUBSCRIBE_OK: u64 = 0x04;
    pub const SUBSCRIBE_ERROR: u64 = 0x05;
    pub const UNSUBSCRIBE: u64 = 0x0a;
    pub const CLIENT_SETUP: u64 = 0x20;
    pub const SERVER_SETUP: u64 = 0x21;
}

/// Setup parameter: connection path (odd key, byte string).
pub const PARAM_PATH: u64 = 0x01;
/// Setup parameter: maximum request ID the peer accepts (even key, varint).
pub const PARAM_MAX_REQUEST_ID: u64 = 0x02;

// ============================================================================
// Field helpers
// ============================================================================

pub(crate) fn write_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), MoqError> {
    encode_varint(data.len() as u64, buf)?;
    buf.put_slice(data);
    Ok(())
}

pub(crate) fn read_bytes(buf: &mut Bytes) -> Result<Bytes, MoqError> {
    let len = read_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(MoqError::Underflow {
            needed: len,
            available: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, what: &str) -> Result<String, MoqError> {
    let raw = read_bytes(buf).map_err(|e| e.in_field(what))?;
    String::from_utf8(raw.to_vec()).map_err(|_| MoqError::Field(format!("{what}: invalid UTF-8")))
}

fn read_u8(buf: &mut Bytes, what: &str) -> Result<u8, MoqError> {
    if !buf.has_remaining() {
        return Err(MoqError::Field(format!("{what}: missing")));
    }
    Ok(buf.get_u8())
}

fn read_field(buf: &mut Bytes, what: &str) -> Result<u64, MoqError> {
    read_varint(buf).map_err(|e| e.in_field(what))
}

fn read_flag(buf: &mut Bytes, what: &str) -> Result<bool, MoqError> {
    match read_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(MoqError::Field(format!("{what}: invalid flag {other}"))),
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Key/value parameters carried by the setup messages.
///
/// Odd keys carry length-prefixed bytes, even keys a varint. Keys we do not
/// understand are skipped using that self-describing length and recorded in
/// `unknown_keys`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupParameters {
    /// Connection path (key 0x01).
    pub path: Option<String>,
    /// Maximum request ID (key 0x02).
    pub max_request_id: Option<u64>,
    /// Keys that were present but not recognized.
    pub unknown_keys: Vec<u64>,
}

impl SetupParameters {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        let count = self.path.is_some() as u64 + self.max_request_id.is_some() as u64;
        encode_varint(count, buf)?;
        if let Some(path) = &self.path {
            encode_varint(PARAM_PATH, buf)?;
            write_bytes(buf, path.as_bytes())?;
        }
        if let Some(max) = self.max_request_id {
            encode_varint(PARAM_MAX_REQUEST_ID, buf)?;
            encode_varint(max, buf)?;
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let count = read_field(buf, "parameter count")?;
        let mut params = Self::default();
        for _ in 0..count {
            let key = read_field(buf, "parameter key")?;
            if key % 2 == 1 {
                let value = read_bytes(buf).map_err(|e| e.in_field("parameter value"))?;
                match key {
                    PARAM_PATH => {
                        let path = String::from_utf8(value.to_vec())
                            .map_err(|_| MoqError::Field("path: invalid UTF-8".into()))?;
                        params.path = Some(path);
                    }
                    _ => params.skip(key),
                }
            } else {
                let value = read_field(buf, "parameter value")?;
                match key {
                    PARAM_MAX_REQUEST_ID => params.max_request_id = Some(value),
                    _ => params.skip(key),
                }
            }
        }
        Ok(params)
    }

    fn skip(&mut self, key: u64) {
        tracing::debug!("MoQ: skipping unknown parameter 0x{:x}", key);
        self.unknown_keys.push(key);
    }
}

// ============================================================================
// Messages
// ============================================================================

/// CLIENT_SETUP (0x20).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSetup {
    pub versions: Vec<u64>,
    pub params: SetupParameters,
}

impl ClientSetup {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.versions.len() as u64, buf)?;
        for &version in &self.versions {
            encode_varint(version, buf)?;
        }
        self.params.encode(buf)
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let count = read_field(buf, "version count")?;
        // Each version is at least one byte; don't trust the count for allocation.
        let mut versions = Vec::with_capacity((count as usize).min(buf.remaining()));
        for _ in 0..count {
            versions.push(read_field(buf, "version")?);
        }
        let params = SetupParameters::decode(buf)?;
        Ok(Self { versions, params })
    }
}

/// SERVER_SETUP (0x21).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSetup {
    pub version: u64,
    pub params: SetupParameters,
}

impl ServerSetup {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.version, buf)?;
        self.params.encode(buf)
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let version = read_field(buf, "selected version")?;
        let params = SetupParameters::decode(buf)?;
        Ok(Self { version, params })
    }
}

/// Delivery order of groups within a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    /// Use the publisher's preference.
    Publisher = 0x0,
    Ascending = 0x1,
    Descending = 0x2,
}

impl GroupOrder {
    fn from_u8(value: u8) -> Result<Self, MoqError> {
        match value {
            0x0 => Ok(GroupOrder::Publisher),
            0x1 => Ok(GroupOrder::Ascending),
            0x2 => Ok(GroupOrder::Descending),
            other => Err(MoqError::Field(format!("group order: invalid value {other}"))),
        }
    }
}

/// Where a subscription starts delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Start at the next group boundary.
    NextGroupStart = 0x1,
    /// Start at the latest object.
    LatestObject = 0x2,
}

impl FilterType {
    fn from_u64(value: u64) -> Result<Self, MoqError> {
        match value {
            0x1 => Ok(FilterType::NextGroupStart),
            0x2 => Ok(FilterType::LatestObject),
            other => Err(MoqError::Field(format!("filter type: unsupported value {other}"))),
        }
    }
}

/// SUBSCRIBE (0x03).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub request_id: u64,
    pub namespace: Vec<String>,
    pub track_name: String,
    pub priority: u8,
    pub group_order: GroupOrder,
    pub forward: bool,
    pub filter_type: FilterType,
}

impl Subscribe {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.request_id, buf)?;
        encode_varint(self.namespace.len() as u64, buf)?;
        for part in &self.namespace {
            write_bytes(buf, part.as_bytes())?;
        }
        write_bytes(buf, self.track_name.as_bytes())?;
        buf.put_u8(self.priority);
        buf.put_u8(self.group_order as u8);
        buf.put_u8(self.forward as u8);
        encode_varint(self.filter_type as u64, buf)?;
        // No subscribe parameters
        encode_varint(0, buf)
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let request_id = read_field(buf, "request id")?;
        let parts = read_field(buf, "namespace length")?;
        let mut namespace = Vec::with_capacity((parts as usize).min(buf.remaining()));
        for _ in 0..parts {
            namespace.push(read_string(buf, "namespace")?);
        }
        let track_name = read_string(buf, "track name")?;
        let priority = read_u8(buf, "priority")?;
        let group_order = GroupOrder::from_u8(read_u8(buf, "group order")?)?;
        let forward = read_flag(buf, "forward")?;
        let filter_type = FilterType::from_u64(read_field(buf, "filter type")?)?;
        // Subscribe parameters carry nothing we act on, but must be consumed.
        let params = SetupParameters::decode(buf)?;
        if !params.unknown_keys.is_empty() {
            tracing::debug!(
                "MoQ: SUBSCRIBE {} carried {} ignored parameter(s)",
                request_id,
                params.unknown_keys.len()
            );
        }
        Ok(Self {
            request_id,
            namespace,
            track_name,
            priority,
            group_order,
            forward,
            filter_type,
        })
    }
}

/// A (group, object) position within a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub group: u64,
    pub object: u64,
}

/// SUBSCRIBE_OK (0x04).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOk {
    pub request_id: u64,
    pub track_alias: u64,
    pub expires: u64,
    pub group_order: GroupOrder,
    /// Largest published location, present only when content exists.
    pub largest: Option<Location>,
}

impl SubscribeOk {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.request_id, buf)?;
        encode_varint(self.track_alias, buf)?;
        encode_varint(self.expires, buf)?;
        buf.put_u8(self.group_order as u8);
        match self.largest {
            Some(largest) => {
                buf.put_u8(1);
                encode_varint(largest.group, buf)?;
                encode_varint(largest.object, buf)?;
            }
            None => buf.put_u8(0),
        }
        Ok(())
    }

    /// Decodes a SUBSCRIBE_OK payload.
    ///
    /// With `content_exists == 0` nothing after the flag is consumed.
    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let request_id = read_field(buf, "request id")?;
        let track_alias = read_field(buf, "track alias")?;
        let expires = read_field(buf, "expires")?;
        let group_order = GroupOrder::from_u8(read_u8(buf, "group order")?)?;
        let largest = if read_flag(buf, "content exists")? {
            let group = read_field(buf, "largest group")?;
            let object = read_field(buf, "largest object")?;
            Some(Location { group, object })
        } else {
            None
        };
        Ok(Self {
            request_id,
            track_alias,
            expires,
            group_order,
            largest,
        })
    }
}

/// SUBSCRIBE_ERROR (0x05).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeError {
    pub request_id: u64,
    pub error_code: u64,
    pub reason: String,
}

impl SubscribeError {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.request_id, buf)?;
        encode_varint(self.error_code, buf)?;
        write_bytes(buf, self.reason.as_bytes())
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let request_id = read_field(buf, "request id")?;
        let error_code = read_field(buf, "error code")?;
        let reason = read_string(buf, "reason")?;
        Ok(Self {
            request_id,
            error_code,
            reason,
        })
    }
}

/// UNSUBSCRIBE (0x0a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribe {
    pub request_id: u64,
}

impl Unsubscribe {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), MoqError> {
        encode_varint(self.request_id, buf)
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, MoqError> {
        let request_id = read_field(buf, "request id")?;
        Ok(Self { request_id })
    }
}

/// Any control message this client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoqMessage {
    ClientSetup(ClientSetup),
    ServerSetup(ServerSetup),
    Subscribe(Subscribe),
    SubscribeOk(SubscribeOk),
    SubscribeError(SubscribeError),
    Unsubscribe(Unsubscribe),
    /// A well-framed message of a type we don't handle.
    Unknown { msg_type: u64 },
}

impl MoqMessage {
    /// Returns the wire type code.
    pub fn msg_type(&self) -> u64 {
        match self {
            MoqMessage::ClientSetup(_) => message_type::CLIENT_SETUP,
            MoqMessage::ServerSetup(_) => message_type::SERVER_SETUP,
            MoqMessage::Subscribe(_) => message_type::SUBSCRIBE,
            MoqMessage::SubscribeOk(_) => message_type::SUBSCRIBE_OK,
            MoqMessage::SubscribeError(_) => message_type::SUBSCRIBE_ERROR,
            MoqMessage::Unsubscribe(_) => message_type::UNSUBSCRIBE,
            MoqMessage::Unknown { msg_type } => *msg_type,
        }
    }

    /// Serializes into a control message ready for framing.
    pub fn encode(&self) -> Result<ControlMessage, MoqError> {
        let mut buf = BytesMut::new();
        match self {
            MoqMessage::ClientSetup(m) => m.encode(&mut buf)?,
            MoqMessage::ServerSetup(m) => m.encode(&mut buf)?,
            MoqMessage::Subscribe(m) => m.encode(&mut buf)?,
            MoqMessage::SubscribeOk(m) => m.encode(&mut buf)?,
            MoqMessage::SubscribeError(m) => m.encode(&mut buf)?,
            MoqMessage::Unsubscribe(m) => m.encode(&mut buf)?,
            MoqMessage::Unknown { msg_type } => {
                return Err(MoqError::Field(format!(
                    "cannot encode unknown message type 0x{msg_type:x}"
                )))
            }
        }
        if buf.len() > MAX_CONTROL_PAYLOAD {
            return Err(MoqError::PayloadTooLarge(buf.len()));
        }
        Ok(ControlMessage {
            msg_type: self.msg_type(),
            payload: buf.freeze(),
        })
    }

    /// Parses a framed control message.
    pub fn decode(msg: &ControlMessage) -> Result<Self, MoqError> {
        let mut buf = msg.payload.clone();
        let decoded = match msg.msg_type {
            message_type::CLIENT_SETUP => MoqMessage::ClientSetup(ClientSetup::decode(&mut buf)?),
            message_type::SERVER_SETUP => MoqMessage::ServerSetup(ServerSetup::decode(&mut buf)?),
            message_type::SUBSCRIBE => MoqMessage::Subscribe(Subscribe::decode(&mut buf)?),
            message_type::SUBSCRIBE_OK => MoqMessage::SubscribeOk(SubscribeOk::decode(&mut buf)?),
            message_type::SUBSCRIBE_ERROR => {
                MoqMessage::SubscribeError(SubscribeError::decode(&mut buf)?)
            }
            message_type::UNSUBSCRIBE => MoqMessage::Unsubscribe(Unsubscribe::decode(&mut buf)?),
            other => {
                tracing::debug!("MoQ: ignoring control message type 0x{:x}", other);
                return Ok(MoqMessage::Unknown { msg_type: other });
            }
        };
        if buf.has_remaining() {
            tracing::trace!(
                "MoQ: {} trailing byte(s) after message 0x{:x}",
                buf.remaining(),
                msg.msg_type
            );
        }
        Ok(decoded)
    }
}
