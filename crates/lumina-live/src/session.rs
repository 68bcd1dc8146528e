//! Live playout session.
//!
//! A [`LiveSession`] owns everything one MoQ playback needs: the control
//! exchange and subscriptions, a decode supervisor per track, the video frame
//! queue, the audio playout engine and diagnostics. Nothing is global;
//! dropping the session joins every thread it started.
//!
//! The transport stays outside. The embedding code feeds control messages
//! and media-stream bytes in, ships [`LiveSession::take_outbound`] to the
//! peer, calls [`LiveSession::pump_decoded`] from its decode-side loop, and
//! hands the audio consumer to the output callback.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::audio_playout::{
    audio_playout, AudioPlayoutConsumer, AudioPlayoutProducer, DecodedAudioBlock, PlayoutConfig,
    PlayoutControls,
};
use crate::decode_supervisor::{
    DecodeSupervisor, DecoderConfig, DecoderFactory, EncodedUnit, MediaDecoder, SendResult,
    SupervisorConfig, SupervisorError,
};
use crate::diagnostics::{
    AggregateSnapshot, DiagnosticsAggregator, HealthStatus, Subsystem, TimestampStep,
};
use crate::frame_queue::{DecodedVideoFrame, FrameLookup, VideoFrameQueue, VideoQueueConfig};
use crate::moq::{
    write_control_message, ChunkSource, ClientSetup, ControlMessage, ControlMessageFramer,
    MediaObject, MoqError, MoqMessage, ServerSetup, SetupParameters, SubscriptionManager,
};

/// MoQ transport draft 14.
pub const MOQ_DRAFT_14: u64 = 0xff00_000e;

/// Nominal video frame step used when an object carries no capture timestamp.
const FALLBACK_VIDEO_STEP_US: i64 = 33_333;

/// Samples per AAC frame, used for the audio timestamp fallback.
const FALLBACK_AUDIO_FRAME_SAMPLES: i64 = 1024;

/// Configuration for a [`LiveSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Versions offered in CLIENT_SETUP, in preference order.
    pub versions: Vec<u64>,
    /// Path parameter sent in CLIENT_SETUP.
    pub path: Option<String>,
    /// Request IDs we allow the peer to use.
    pub max_request_id: Option<u64>,
    /// Broadcast namespace tuple.
    pub namespace: Vec<String>,
    pub video_track: String,
    pub audio_track: String,
    pub video_priority: u8,
    pub audio_priority: u8,
    /// Initial video decoder config. In-band video configs replace its
    /// description.
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_description: Option<Bytes>,
    pub video_queue: VideoQueueConfig,
    pub playout: PlayoutConfig,
    pub video_supervisor: SupervisorConfig,
    pub audio_supervisor: SupervisorConfig,
}

impl SessionConfig {
    /// Creates config for a broadcast with default tracks and timing.
    pub fn for_broadcast(namespace: Vec<String>) -> Self {
        Self {
            namespace,
            ..Self::default()
        }
    }

    fn video_decoder_config(&self, description: Option<Bytes>) -> DecoderConfig {
        DecoderConfig::video(self.video_codec.clone(), description)
    }

    fn audio_decoder_config(&self) -> DecoderConfig {
        DecoderConfig::audio(
            self.audio_codec.clone(),
            self.playout.sample_rate,
            self.playout.channels,
            self.audio_description.clone(),
        )
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            versions: vec![MOQ_DRAFT_14],
            path: None,
            max_request_id: Some(64),
            namespace: Vec::new(),
            video_track: "video".into(),
            audio_track: "audio".into(),
            video_priority: 1,
            audio_priority: 0,
            video_codec: "avc1".into(),
            audio_codec: "mp4a.40.2".into(),
            audio_description: None,
            video_queue: VideoQueueConfig::default(),
            playout: PlayoutConfig::default(),
            video_supervisor: SupervisorConfig::named("lumina-video-decode"),
            audio_supervisor: SupervisorConfig::named("lumina-audio-decode"),
        }
    }
}

/// Lifecycle of the control exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet.
    Idle,
    /// CLIENT_SETUP sent, waiting for SERVER_SETUP.
    SetupSent,
    /// Version agreed; subscriptions may be in flight.
    Established { version: u64 },
    /// Ended by a protocol error or an explicit close.
    Closed { reason: String },
}

/// Which session track a media object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    fn subsystem(self) -> Subsystem {
        match self {
            TrackKind::Video => Subsystem::Video,
            TrackKind::Audio => Subsystem::Audio,
        }
    }
}

/// Result of one [`LiveSession::pump_decoded`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub video_frames: usize,
    pub audio_blocks: usize,
}

/// One live playout session.
pub struct LiveSession<VF, AF>
where
    VF: DecoderFactory,
    AF: DecoderFactory,
{
    config: SessionConfig,
    state: SessionState,
    outbound: BytesMut,
    subscriptions: SubscriptionManager,
    video_request: Option<u64>,
    audio_request: Option<u64>,
    video: DecodeSupervisor<VF>,
    audio: DecodeSupervisor<AF>,
    video_queue: Arc<VideoFrameQueue<DecodedVideoFrame>>,
    audio_producer: AudioPlayoutProducer,
    audio_consumer: Option<AudioPlayoutConsumer>,
    diagnostics: DiagnosticsAggregator,
    /// Last in-band video decoder description
    video_description: Option<Bytes>,
    last_video_ts: Option<i64>,
    last_audio_ts: Option<i64>,
}

impl<VF, AF> LiveSession<VF, AF>
where
    VF: DecoderFactory,
    VF::Decoder: MediaDecoder<Output = DecodedVideoFrame>,
    AF: DecoderFactory,
    AF::Decoder: MediaDecoder<Output = DecodedAudioBlock>,
{
    pub fn new(config: SessionConfig, video_factory: VF, audio_factory: AF) -> Self {
        let diagnostics =
            DiagnosticsAggregator::with_thresholds(config.playout.timestamp_thresholds());
        let video = DecodeSupervisor::new(
            video_factory,
            config.video_supervisor.clone(),
            diagnostics.subsystem(Subsystem::Video).clone(),
        );
        let audio = DecodeSupervisor::new(
            audio_factory,
            config.audio_supervisor.clone(),
            diagnostics.subsystem(Subsystem::Audio).clone(),
        );
        let (audio_producer, audio_consumer) = audio_playout(
            &config.playout,
            diagnostics.subsystem(Subsystem::Audio).clone(),
        );
        let video_queue = Arc::new(VideoFrameQueue::with_config(&config.video_queue));

        Self {
            config,
            state: SessionState::Idle,
            outbound: BytesMut::new(),
            subscriptions: SubscriptionManager::new(),
            video_request: None,
            audio_request: None,
            video,
            audio,
            video_queue,
            audio_producer,
            audio_consumer: Some(audio_consumer),
            diagnostics,
            video_description: None,
            last_video_ts: None,
            last_audio_ts: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed { .. })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Sends CLIENT_SETUP.
    pub fn start(&mut self) -> Result<(), MoqError> {
        self.ensure_open()?;
        let setup = MoqMessage::ClientSetup(ClientSetup {
            versions: self.config.versions.clone(),
            params: SetupParameters {
                path: self.config.path.clone(),
                max_request_id: self.config.max_request_id,
                unknown_keys: Vec::new(),
            },
        });
        self.send(&setup)?;
        self.state = SessionState::SetupSent;
        tracing::info!(
            "MoQ session: CLIENT_SETUP sent (versions {:x?})",
            self.config.versions
        );
        Ok(())
    }

    /// Takes framed control bytes queued for the peer.
    pub fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Reads and handles one control message from `framer`.
    ///
    /// Returns `Ok(false)` when the control stream ended cleanly.
    pub fn process_control<S: ChunkSource>(
        &mut self,
        framer: &mut ControlMessageFramer<S>,
    ) -> Result<bool, MoqError> {
        self.ensure_open()?;
        match framer.read() {
            Ok(Some(msg)) => self.handle_control_message(&msg).map(|()| true),
            Ok(None) => {
                tracing::debug!("MoQ session: control stream ended");
                Ok(false)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Handles one framed control message from the peer.
    ///
    /// Any protocol error closes the session.
    pub fn handle_control_message(&mut self, msg: &ControlMessage) -> Result<(), MoqError> {
        self.ensure_open()?;
        let result = MoqMessage::decode(msg).and_then(|decoded| self.dispatch(decoded));
        result.map_err(|e| self.fail(e))
    }

    fn dispatch(&mut self, msg: MoqMessage) -> Result<(), MoqError> {
        match msg {
            MoqMessage::ServerSetup(setup) => self.on_server_setup(setup),
            MoqMessage::SubscribeOk(ok) => {
                let sub = self.subscriptions.on_subscribe_ok(&ok)?;
                let request_id = sub.request_id;
                tracing::info!(
                    "MoQ session: subscribed to {} (alias {})",
                    sub.track_name,
                    ok.track_alias
                );
                self.on_track_active(request_id);
                Ok(())
            }
            MoqMessage::SubscribeError(err) => {
                let sub = self.subscriptions.on_subscribe_error(&err)?;
                tracing::warn!(
                    "MoQ session: subscription to {} rejected: {} (code {})",
                    sub.track_name,
                    err.reason,
                    err.error_code
                );
                if self.video_request == Some(err.request_id) {
                    self.video_request = None;
                }
                if self.audio_request == Some(err.request_id) {
                    self.audio_request = None;
                }
                Ok(())
            }
            MoqMessage::ClientSetup(_) | MoqMessage::Subscribe(_) | MoqMessage::Unsubscribe(_) => {
                Err(MoqError::Field(format!(
                    "unexpected control message 0x{:x} from server",
                    msg.msg_type()
                )))
            }
            MoqMessage::Unknown { .. } => Ok(()),
        }
    }

    fn on_server_setup(&mut self, setup: ServerSetup) -> Result<(), MoqError> {
        if self.state != SessionState::SetupSent {
            return Err(MoqError::Field("unexpected SERVER_SETUP".into()));
        }
        if !self.config.versions.contains(&setup.version) {
            return Err(MoqError::Field(format!(
                "SERVER_SETUP: version 0x{:x} was not offered",
                setup.version
            )));
        }
        if let Some(max) = setup.params.max_request_id {
            self.subscriptions.set_max_request_id(max);
        }
        self.state = SessionState::Established {
            version: setup.version,
        };
        tracing::info!("MoQ session: established (version 0x{:x})", setup.version);

        let namespace = self.config.namespace.clone();
        let video = self.subscriptions.subscribe(
            namespace.clone(),
            self.config.video_track.clone(),
            self.config.video_priority,
        )?;
        self.video_request = Some(video.request_id);
        self.send(&MoqMessage::Subscribe(video))?;

        let audio = self.subscriptions.subscribe(
            namespace,
            self.config.audio_track.clone(),
            self.config.audio_priority,
        )?;
        self.audio_request = Some(audio.request_id);
        self.send(&MoqMessage::Subscribe(audio))
    }

    /// Configures the decoder for a newly confirmed track.
    fn on_track_active(&mut self, request_id: u64) {
        let result = if Some(request_id) == self.video_request {
            let config = self
                .config
                .video_decoder_config(self.video_description.clone());
            self.video.configure(config)
        } else if Some(request_id) == self.audio_request {
            let config = self.config.audio_decoder_config();
            self.audio.configure(config)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            // Decode problems never end the session; the track just stays silent
            tracing::warn!("MoQ session: decoder setup failed: {e}");
        }
    }

    /// Sends UNSUBSCRIBE for every track.
    pub fn unsubscribe_all(&mut self) -> Result<(), MoqError> {
        self.ensure_open()?;
        for request_id in [self.video_request.take(), self.audio_request.take()]
            .into_iter()
            .flatten()
        {
            if let Some(unsub) = self.subscriptions.unsubscribe(request_id) {
                self.send(&MoqMessage::Unsubscribe(unsub))?;
            }
        }
        self.video.reset();
        self.audio.reset();
        Ok(())
    }

    /// Returns which track a media stream alias belongs to.
    pub fn track_kind(&self, track_alias: u64) -> Option<TrackKind> {
        let request_id = self.subscriptions.by_alias(track_alias)?.request_id;
        if Some(request_id) == self.video_request {
            Some(TrackKind::Video)
        } else if Some(request_id) == self.audio_request {
            Some(TrackKind::Audio)
        } else {
            None
        }
    }

    /// Reassembles and routes every object in a media-stream chunk.
    ///
    /// Returns how many objects were routed to a decoder.
    pub fn handle_object_bytes(
        &mut self,
        track_alias: u64,
        mut data: Bytes,
    ) -> Result<usize, MoqError> {
        self.ensure_open()?;
        let mut routed = 0;
        while data.has_remaining() {
            let object = MediaObject::decode(&mut data).map_err(|e| self.fail(e))?;
            if self.handle_object(track_alias, object)? {
                routed += 1;
            }
        }
        Ok(routed)
    }

    /// Routes one media object to its track's decoder.
    ///
    /// Returns false if the object was dropped (unknown alias, decoder not
    /// ready or failed). Only protocol errors are returned.
    pub fn handle_object(
        &mut self,
        track_alias: u64,
        object: MediaObject,
    ) -> Result<bool, MoqError> {
        self.ensure_open()?;
        let Some(kind) = self.track_kind(track_alias) else {
            tracing::debug!(
                "MoQ session: dropping object {} for unknown alias {}",
                object.object_id,
                track_alias
            );
            return Ok(false);
        };

        let ext = object.extensions;
        let result = match kind {
            TrackKind::Video => {
                if let Some(description) = ext.video_config {
                    self.on_video_config(description);
                }
                let ts = resolve_timestamp(
                    ext.capture_timestamp_us,
                    &mut self.last_video_ts,
                    FALLBACK_VIDEO_STEP_US,
                );
                let step = self
                    .diagnostics
                    .subsystem(Subsystem::Video)
                    .record_input_timestamp(ts);
                if step == TimestampStep::Wrap {
                    // Frames still in the decoder belong to the old timeline
                    self.restart_decoder(TrackKind::Video);
                    let dropped = self.video_queue.clear();
                    tracing::warn!(
                        "MoQ session: video timeline restarted at {}us, dropped {} frames",
                        ts,
                        dropped
                    );
                }
                self.video.submit(EncodedUnit {
                    timestamp_us: ts,
                    is_keyframe: ext.is_keyframe,
                    data: object.payload,
                })
            }
            TrackKind::Audio => {
                let step_us = FALLBACK_AUDIO_FRAME_SAMPLES * 1_000_000
                    / self.config.playout.sample_rate.max(1) as i64;
                let ts =
                    resolve_timestamp(ext.capture_timestamp_us, &mut self.last_audio_ts, step_us);
                if self.audio_producer.observe_input_timestamp(ts) == TimestampStep::Wrap {
                    self.restart_decoder(TrackKind::Audio);
                }
                self.audio.submit(EncodedUnit {
                    timestamp_us: ts,
                    is_keyframe: true,
                    data: object.payload,
                })
            }
        };

        // Supervisor errors stay inside the session; the object is just lost
        match result {
            Ok(SendResult::Sent) | Ok(SendResult::Dropped) => Ok(true),
            Err(SupervisorError::NotConfigured) => {
                tracing::trace!("MoQ session: {:?} decoder not ready, dropping object", kind);
                Ok(false)
            }
            Err(SupervisorError::WorkerGone) => {
                tracing::warn!("MoQ session: {:?} decode thread died, restarting", kind);
                self.diagnostics.subsystem(kind.subsystem()).record_discards(1);
                self.restart_decoder(kind);
                Ok(false)
            }
            Err(e) => {
                tracing::debug!("MoQ session: {:?} object dropped: {e}", kind);
                self.diagnostics.subsystem(kind.subsystem()).record_discards(1);
                Ok(false)
            }
        }
    }

    /// Restarts a track's decoder so no pre-restart output reaches playout.
    fn restart_decoder(&mut self, kind: TrackKind) {
        let result = match kind {
            TrackKind::Video => self.video.restart(),
            TrackKind::Audio => self.audio.restart(),
        };
        match result {
            Ok(()) | Err(SupervisorError::NotConfigured) => {}
            Err(e) => tracing::warn!("MoQ session: {:?} decoder restart failed: {e}", kind),
        }
    }

    /// Reconfigures the video decoder when the in-band description changes.
    fn on_video_config(&mut self, description: Bytes) {
        if self.video_description.as_ref() == Some(&description) {
            return;
        }
        tracing::info!(
            "MoQ session: video config changed ({} bytes), reconfiguring decoder",
            description.len()
        );
        self.video_description = Some(description.clone());
        if self.video_request.is_some() {
            let config = self.config.video_decoder_config(Some(description));
            if let Err(e) = self.video.configure(config) {
                tracing::warn!("MoQ session: video reconfigure failed: {e}");
            }
        }
    }

    /// Moves decoded output into the video queue and audio engine.
    pub fn pump_decoded(&mut self) -> PumpStats {
        let mut stats = PumpStats::default();
        let video_diag = self.diagnostics.subsystem(Subsystem::Video);
        while let Some(frame) = self.video.poll_output() {
            video_diag.record_presentation(frame.pts_us as i64, frame.duration_us);
            if self.video_queue.add_frame(frame) {
                video_diag.record_discards(1);
            }
            stats.video_frames += 1;
        }

        let audio_diag = self.diagnostics.subsystem(Subsystem::Audio);
        while let Some(block) = self.audio.poll_output() {
            audio_diag.record_presentation(block.timestamp_us, block.duration_us());
            match self.audio_producer.write_block(&block) {
                Ok(()) => stats.audio_blocks += 1,
                Err(e) => {
                    audio_diag.record_discards(1);
                    tracing::warn!("MoQ session: dropping audio block: {e}");
                }
            }
        }
        stats
    }

    /// Takes the frame to show at `clock_us`, recording render cadence and
    /// skipped frames.
    pub fn video_frame_at(&self, clock_us: u64) -> FrameLookup<DecodedVideoFrame> {
        let diag = self.diagnostics.subsystem(Subsystem::Video);
        diag.record_callback(std::time::Instant::now());
        let lookup = self.video_queue.get_frame_by_timestamp(clock_us);
        diag.record_discards(lookup.discarded_this_call as u64);
        lookup
    }

    pub fn video_queue(&self) -> &Arc<VideoFrameQueue<DecodedVideoFrame>> {
        &self.video_queue
    }

    /// Hands out the real-time audio half. Available once per session.
    pub fn take_audio_consumer(&mut self) -> Option<AudioPlayoutConsumer> {
        self.audio_consumer.take()
    }

    pub fn audio_controls(&self) -> PlayoutControls {
        self.audio_producer.controls()
    }

    pub fn buffered_audio_ms(&self) -> f64 {
        self.audio_producer.buffered_ms()
    }

    pub fn video_decoder(&self) -> &DecodeSupervisor<VF> {
        &self.video
    }

    pub fn audio_decoder(&self) -> &DecodeSupervisor<AF> {
        &self.audio
    }

    pub fn diagnostics(&self) -> &DiagnosticsAggregator {
        &self.diagnostics
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        self.diagnostics.health()
    }

    /// Ends the session and stops both decoders.
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        let reason = reason.into();
        tracing::info!("MoQ session: closing ({reason})");
        self.video.close();
        self.audio.close();
        self.state = SessionState::Closed { reason };
    }

    /// Returns the session to its freshly created state.
    ///
    /// Decoders are unconfigured, queues emptied, subscriptions forgotten and
    /// every counter zeroed. The audio consumer handed out earlier stays
    /// valid. A closed session is not reopened.
    pub fn reset(&mut self) {
        if self.is_closed() {
            return;
        }
        self.video.reset();
        self.audio.reset();
        self.video_queue.reset();
        self.audio_producer.reset();
        self.subscriptions.clear();
        self.video_request = None;
        self.audio_request = None;
        self.video_description = None;
        self.last_video_ts = None;
        self.last_audio_ts = None;
        self.outbound.clear();
        self.diagnostics.reset();
        self.state = SessionState::Idle;
        tracing::debug!("MoQ session reset");
    }

    fn ensure_open(&self) -> Result<(), MoqError> {
        if self.is_closed() {
            Err(MoqError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn send(&mut self, msg: &MoqMessage) -> Result<(), MoqError> {
        let encoded = msg.encode()?;
        write_control_message(encoded.msg_type, &encoded.payload, &mut self.outbound)
    }

    /// Closes the session on a protocol error and passes it through.
    fn fail(&mut self, err: MoqError) -> MoqError {
        tracing::warn!(
            "MoQ session: protocol error ({:?}): {err}",
            err.class()
        );
        self.close(err.to_string());
        err
    }
}

/// Uses the capture timestamp when present, otherwise steps from the last one.
fn resolve_timestamp(capture_us: Option<u64>, last: &mut Option<i64>, step_us: i64) -> i64 {
    let ts = match capture_us {
        Some(ts) => ts.min(i64::MAX as u64) as i64,
        None => last.map_or(0, |prev| prev.saturating_add(step_us)),
    };
    *last = Some(ts);
    ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_timestamp_fallback() {
        let mut last = None;
        assert_eq!(resolve_timestamp(None, &mut last, 100), 0);
        assert_eq!(resolve_timestamp(Some(5_000), &mut last, 100), 5_000);
        assert_eq!(resolve_timestamp(None, &mut last, 100), 5_100);
        assert_eq!(resolve_timestamp(Some(u64::MAX), &mut last, 100), i64::MAX);
        assert_eq!(resolve_timestamp(None, &mut last, 100), i64::MAX);
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::for_broadcast(vec!["live".into(), "demo".into()]);
        assert_eq!(config.versions, vec![MOQ_DRAFT_14]);
        assert_eq!(config.video_queue.capacity, 90);
        let audio = config.audio_decoder_config();
        assert_eq!(audio.sample_rate, Some(48000));
        assert_eq!(audio.channels, Some(2));
    }
}
