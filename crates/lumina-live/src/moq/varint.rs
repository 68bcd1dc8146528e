//! QUIC-style variable-length integers (RFC 9000 §16).
//!
//! Encoding:
//! - `0x00..0x3F` → 1 byte (6 bits), prefix `00`
//! - `0x40..0x3FFF` → 2 bytes (14 bits), prefix `01`
//! - `0x4000..0x3FFF_FFFF` → 4 bytes (30 bits), prefix `10`
//! - `0x4000_0000..0x3FFF_FFFF_FFFF_FFFF` → 8 bytes (62 bits), prefix `11`

use bytes::{Buf, BufMut};

use super::error::MoqError;

/// Maximum representable value: 2^62 - 1.
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `value` encodes to. Values above [`MAX_VARINT`] report 8.
#[inline]
pub fn varint_len(value: u64) -> usize {
    if value < 0x40 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x4000_0000 {
        4
    } else {
        8
    }
}

/// Encodes `value` with the minimal length class.
pub fn encode_varint(value: u64, buf: &mut impl BufMut) -> Result<(), MoqError> {
    if value > MAX_VARINT {
        return Err(MoqError::VarintOutOfRange(value));
    }
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xC000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Decodes a varint from `buffer` starting at `offset`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(buffer: &[u8], offset: usize) -> Result<(u64, usize), MoqError> {
    let rest = buffer.get(offset..).unwrap_or(&[]);
    let Some(&first) = rest.first() else {
        return Err(MoqError::Underflow {
            needed: 1,
            available: 0,
        });
    };

    let len = 1usize << (first >> 6);
    if rest.len() < len {
        return Err(MoqError::Underflow {
            needed: len,
            available: rest.len(),
        });
    }

    let mut value = u64::from(first & 0x3F);
    for &byte in &rest[1..len] {
        value = (value << 8) | u64::from(byte);
    }
    Ok((value, len))
}

/// Reads a varint from a cursor, advancing it past the encoded bytes.
pub fn read_varint(buf: &mut impl Buf) -> Result<u64, MoqError> {
    if !buf.has_remaining() {
        return Err(MoqError::Underflow {
            needed: 1,
            available: 0,
        });
    }

    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(MoqError::Underflow {
            needed: len,
            available: buf.remaining(),
        });
    }

    let value = match len {
        1 => {
            buf.advance(1);
            u64::from(first & 0x3F)
        }
        2 => u64::from(buf.get_u16() & 0x3FFF),
        4 => u64::from(buf.get_u32() & 0x3FFF_FFFF),
        _ => buf.get_u64() & MAX_VARINT,
    };
    Ok(value)
}
