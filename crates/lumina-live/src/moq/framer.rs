//! Control-message framing over a chunked byte source.
//!
//! Wire layout of one control message:
//!
//! ```text
//! [varint type][u16 BE length][length bytes payload]
//! ```
//!
//! The transport hands us bytes in arbitrary chunks. [`ChunkedReader`]
//! accumulates them and serves exact-length reads, keeping any remainder for
//! the next call.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::MoqError;
use super::varint::{decode_varint, encode_varint, varint_len};

/// Maximum control payload size (u16 length prefix).
pub const MAX_CONTROL_PAYLOAD: usize = u16::MAX as usize;

/// A framed control message: type plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message type (varint on the wire).
    pub msg_type: u64,
    /// Message payload, at most [`MAX_CONTROL_PAYLOAD`] bytes.
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn new(msg_type: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }
}

/// A source of byte chunks from the control stream.
///
/// `Ok(None)` means the stream ended cleanly.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, MoqError>;
}

/// Chunks pushed by the network task; a disconnected sender is end-of-stream.
impl ChunkSource for crossbeam_channel::Receiver<Bytes> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, MoqError> {
        Ok(self.recv().ok())
    }
}

impl ChunkSource for VecDeque<Bytes> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, MoqError> {
        Ok(self.pop_front())
    }
}

/// Buffers partial chunks and serves exact-length reads.
pub struct ChunkedReader<S> {
    source: S,
    pending: BytesMut,
    eof: bool,
}

impl<S: ChunkSource> ChunkedReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pending: BytesMut::new(),
            eof: false,
        }
    }

    /// Pulls chunks until at least `n` bytes are buffered.
    ///
    /// Returns false if the source ended first.
    fn fill(&mut self, n: usize) -> Result<bool, MoqError> {
        while self.pending.len() < n {
            if self.eof {
                return Ok(false);
            }
            match self.source.next_chunk()? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
        Ok(true)
    }

    /// Reads exactly `n` bytes, or returns `None` if the source ends first.
    ///
    /// On `None` the partial bytes stay buffered.
    pub fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, MoqError> {
        if !self.fill(n)? {
            return Ok(None);
        }
        Ok(Some(self.pending.split_to(n).freeze()))
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Returns the underlying source.
    pub fn into_inner(self) -> S {
        self.source
    }
}

/// Reads and writes framed control messages.
pub struct ControlMessageFramer<S> {
    reader: ChunkedReader<S>,
    outbound: BytesMut,
}

impl<S: ChunkSource> ControlMessageFramer<S> {
    pub fn new(source: S) -> Self {
        Self {
            reader: ChunkedReader::new(source),
            outbound: BytesMut::new(),
        }
    }

    /// Reads the next control message.
    ///
    /// Returns `Ok(None)` only when the stream ends before the first byte of
    /// a message; ending anywhere inside a message is a framing error.
    pub fn read(&mut self) -> Result<Option<ControlMessage>, MoqError> {
        let Some(first) = self.reader.read_exact(1)? else {
            return Ok(None);
        };

        let type_len = 1usize << (first[0] >> 6);
        let rest = self
            .reader
            .read_exact(type_len - 1)?
            .ok_or_else(|| truncated("message type"))?;
        let mut type_bytes = [0u8; 8];
        type_bytes[0] = first[0];
        type_bytes[1..type_len].copy_from_slice(&rest);
        let (msg_type, _) = decode_varint(&type_bytes[..type_len], 0)?;

        let len_bytes = self
            .reader
            .read_exact(2)?
            .ok_or_else(|| truncated("length"))?;
        let length = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;

        let payload = self
            .reader
            .read_exact(length)?
            .ok_or_else(|| truncated("payload"))?;

        tracing::trace!(
            "control message: type=0x{:x} len={}",
            msg_type,
            payload.len()
        );
        Ok(Some(ControlMessage { msg_type, payload }))
    }

    /// Frames a message into the outbound buffer.
    pub fn write(&mut self, msg_type: u64, payload: &[u8]) -> Result<(), MoqError> {
        write_control_message(msg_type, payload, &mut self.outbound)
    }

    /// Takes everything written so far for handing to the transport.
    pub fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Bytes received but not yet consumed by a complete message.
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }
}

fn truncated(what: &str) -> MoqError {
    MoqError::Framing(format!("stream ended inside control message {what}"))
}

/// Appends one framed control message to `out`.
pub fn write_control_message(
    msg_type: u64,
    payload: &[u8],
    out: &mut impl BufMut,
) -> Result<(), MoqError> {
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(MoqError::PayloadTooLarge(payload.len()));
    }
    encode_varint(msg_type, out)?;
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    Ok(())
}

/// Frames a single control message into a new buffer.
pub fn frame_control_message(msg_type: u64, payload: &[u8]) -> Result<Bytes, MoqError> {
    let mut buf = BytesMut::with_capacity(varint_len(msg_type) + 2 + payload.len());
    write_control_message(msg_type, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Parses one control message from the front of `buf`.
///
/// Returns the message and the number of bytes consumed.
pub fn parse_control_message(buf: &[u8]) -> Result<(ControlMessage, usize), MoqError> {
    let (msg_type, type_len) = decode_varint(buf, 0)?;
    let header_len = type_len + 2;
    if buf.len() < header_len {
        return Err(MoqError::Underflow {
            needed: header_len,
            available: buf.len(),
        });
    }
    let length = u16::from_be_bytes([buf[type_len], buf[type_len + 1]]) as usize;
    let total = header_len + length;
    if buf.len() < total {
        return Err(MoqError::Underflow {
            needed: total,
            available: buf.len(),
        });
    }
    let payload = Bytes::copy_from_slice(&buf[header_len..total]);
    Ok((ControlMessage { msg_type, payload }, total))
}
