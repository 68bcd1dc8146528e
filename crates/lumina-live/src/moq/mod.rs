//! Media over QUIC (MoQ) control protocol and object codec.
//!
//! The transport itself lives outside this crate; it hands us the control
//! stream as byte chunks and media streams as object bytes.
//!
//! # Architecture
//!
//! ```text
//! control bytes → ControlMessageFramer → MoqMessage → SubscriptionManager
//! media bytes   → MediaObject (+ ObjectExtensions) → decode supervisors
//! ```

pub mod error;
pub mod framer;
pub mod message;
pub mod object;
pub mod subscription;
pub mod varint;

pub use error::{MoqError, ProtocolErrorClass};
pub use framer::{
    frame_control_message, parse_control_message, write_control_message, ChunkSource,
    ChunkedReader, ControlMessage, ControlMessageFramer, MAX_CONTROL_PAYLOAD,
};
pub use message::{
    ClientSetup, FilterType, GroupOrder, Location, MoqMessage, ServerSetup, SetupParameters,
    Subscribe, SubscribeError, SubscribeOk, Unsubscribe,
};
pub use object::{MediaObject, ObjectExtensions};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionState};
pub use varint::{decode_varint, encode_varint, read_varint, varint_len, MAX_VARINT};
