//! MoQ-specific error types.
//!
//! Every [`MoqError`] is a protocol error and ends the control session. The
//! [`ProtocolErrorClass`] distinguishes malformed framing (the byte stream can
//! no longer be trusted) from inconsistent fields inside a well-framed
//! message.

/// Classification of a protocol error for diagnostics and session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorClass {
    /// Malformed or truncated control message framing.
    Framing,
    /// A well-framed message carried an inconsistent or invalid field.
    Field,
}

/// Errors that can occur while encoding, framing or interpreting MoQ
/// control traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoqError {
    /// Fewer bytes remain than a declared length requires.
    #[error("MoQ underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },
    /// Control payload larger than the u16 length prefix can carry.
    #[error("MoQ control payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),
    /// Attempted to encode a value above 2^62 - 1.
    #[error("MoQ varint out of range: {0}")]
    VarintOutOfRange(u64),
    /// Byte stream ended or broke in the middle of a message.
    #[error("MoQ framing error: {0}")]
    Framing(String),
    /// Message field inconsistent with the protocol.
    #[error("MoQ field error: {0}")]
    Field(String),
    /// Request ID space granted by the server is exhausted.
    #[error("MoQ request IDs exhausted (max {0})")]
    RequestIdsExhausted(u64),
    /// The control session was already closed by an earlier protocol error.
    #[error("MoQ session closed")]
    SessionClosed,
}

impl MoqError {
    /// Returns the protocol error class used for teardown decisions.
    pub fn class(&self) -> ProtocolErrorClass {
        match self {
            MoqError::Framing(_) | MoqError::PayloadTooLarge(_) | MoqError::SessionClosed => {
                ProtocolErrorClass::Framing
            }
            MoqError::Underflow { .. }
            | MoqError::VarintOutOfRange(_)
            | MoqError::Field(_)
            | MoqError::RequestIdsExhausted(_) => ProtocolErrorClass::Field,
        }
    }

    /// Maps a payload-level underflow into a field error naming `what`.
    ///
    /// Inside an already framed payload, running out of bytes means a field
    /// was declared but not present.
    pub(crate) fn in_field(self, what: &str) -> Self {
        match self {
            MoqError::Underflow { needed, available } => MoqError::Field(format!(
                "{what}: truncated (needed {needed} bytes, {available} available)"
            )),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MoqError::PayloadTooLarge(70_000);
        assert!(err.to_string().contains("70000"));

        let err = MoqError::Underflow {
            needed: 4,
            available: 1,
        };
        assert!(err.to_string().contains("needed 4"));
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            MoqError::Framing("eof".into()).class(),
            ProtocolErrorClass::Framing
        );
        assert_eq!(
            MoqError::PayloadTooLarge(65536).class(),
            ProtocolErrorClass::Framing
        );
        assert_eq!(
            MoqError::Field("bad flag".into()).class(),
            ProtocolErrorClass::Field
        );
    }

    #[test]
    fn test_underflow_in_field() {
        let err = MoqError::Underflow {
            needed: 2,
            available: 0,
        }
        .in_field("largest_group");
        match err {
            MoqError::Field(msg) => assert!(msg.contains("largest_group")),
            other => panic!("expected Field, got {other:?}"),
        }
    }
}
