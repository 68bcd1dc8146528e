//! lumina-live: Live playout core for Media over QUIC (MoQ) broadcasts.
//!
//! This crate contains the transport-agnostic half of a live player:
//!
//! - Wire protocol: [`moq`] (varints, control framing, setup/subscribe messages, objects)
//! - Video presentation: [`frame_queue`]
//! - Audio playout: [`audio_ring_buffer`], [`audio_playout`], [`metering`]
//! - Decoder lifecycle: [`decode_supervisor`]
//! - Health reporting: [`diagnostics`]
//! - Wiring: [`session`]
//!
//! QUIC/WebTransport connectivity, platform codecs and audio output devices
//! are supplied by the embedder through [`moq::ChunkSource`],
//! [`decode_supervisor::DecoderFactory`] and the pull-based
//! [`audio_playout::AudioPlayoutConsumer`].

pub mod audio_playout;
pub mod audio_ring_buffer;
pub mod decode_supervisor;
pub mod diagnostics;
pub mod frame_queue;
pub mod metering;
pub mod moq;
pub mod session;

pub use audio_playout::{
    audio_playout, AudioPlayoutConsumer, AudioPlayoutProducer, DecodedAudioBlock, PlayoutConfig,
    PlayoutControls, PlayoutError,
};
pub use decode_supervisor::{
    DecodeError, DecodeSupervisor, DecoderConfig, DecoderFactory, EncodedUnit, MediaDecoder,
    SupervisorConfig, SupervisorError, SupervisorState,
};
pub use diagnostics::{DiagnosticsAggregator, DiagnosticsSnapshot, HealthStatus, Subsystem};
pub use frame_queue::{DecodedVideoFrame, FrameLookup, VideoFrameQueue, VideoQueueConfig};
pub use moq::MoqError;
pub use session::{LiveSession, SessionConfig, SessionState};
