//! Live audio playout engine.
//!
//! Sits on top of the SPSC ring buffer and adds what live playout needs:
//! a sample-count playback clock anchored to decoded timestamps, epoch
//! resets when the input timeline jumps far backward, output gain for
//! volume/mute, and peak publication for metering.
//!
//! ```text
//! decode side                         output callback
//! AudioPlayoutProducer ──ring──▶ AudioPlayoutConsumer::pull()
//!   observe_input_timestamp()          clock, gain, peaks
//!   write_block()
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio_ring_buffer::{
    audio_ring_buffer, ReadOutcome, RingBufferConfig, RingBufferConsumer, RingBufferMetrics,
    RingBufferProducer,
};
use crate::diagnostics::{
    classify_timestamp_step, SubsystemDiagnostics, TimestampStep, TimestampThresholds,
    INPUT_JUMP_THRESHOLD_US, INPUT_WRAP_THRESHOLD_US,
};
use crate::metering::PeakTap;

/// Configuration for the audio playout engine.
#[derive(Debug, Clone)]
pub struct PlayoutConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Ring storage (rounded up to a power of two samples). Default: 4s.
    pub audio_buffer: Duration,
    /// Buffered audio required before output starts. Default: 300ms.
    pub startup_threshold: Duration,
    /// Buffered level above which output skips forward to the startup
    /// level. Default: 1s.
    pub drift_trim_threshold: Option<Duration>,
    /// Backward input-timestamp step that clears the buffer. Default: 30s.
    pub epoch_reset_threshold_us: i64,
    /// Input-timestamp step counted as a jump. Default: 100ms.
    pub timestamp_jump_threshold_us: i64,
}

impl PlayoutConfig {
    /// Creates config for the given audio format with default timing.
    pub fn for_format(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            audio_buffer: Duration::from_secs(4),
            startup_threshold: Duration::from_millis(300),
            drift_trim_threshold: Some(Duration::from_secs(1)),
            epoch_reset_threshold_us: INPUT_WRAP_THRESHOLD_US,
            timestamp_jump_threshold_us: INPUT_JUMP_THRESHOLD_US,
        }
    }

    /// Interleaved samples covering `duration`.
    pub fn samples_for(&self, duration: Duration) -> usize {
        let frames = (duration.as_micros() * self.sample_rate as u128 / 1_000_000) as usize;
        frames * self.channels as usize
    }

    pub fn timestamp_thresholds(&self) -> TimestampThresholds {
        TimestampThresholds {
            jump_us: self.timestamp_jump_threshold_us,
            wrap_us: self.epoch_reset_threshold_us,
        }
    }

    fn ring_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            capacity_samples: self.samples_for(self.audio_buffer),
            prefill_samples: self.samples_for(self.startup_threshold),
            trim_samples: self.drift_trim_threshold.map(|d| self.samples_for(d)),
            channels: self.channels as usize,
        }
    }
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self::for_format(48000, 2)
    }
}

/// Errors from the audio playout engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayoutError {
    #[error("audio format mismatch: engine runs {expected_rate}Hz/{expected_channels}ch, block is {rate}Hz/{channels}ch")]
    FormatMismatch {
        expected_rate: u32,
        expected_channels: u16,
        rate: u32,
        channels: u16,
    },
    #[error("audio block length {0} is not a whole number of frames")]
    PartialFrame(usize),
}

/// Interleaved PCM produced by the audio decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBlock {
    /// Presentation time of the first frame, in microseconds.
    pub timestamp_us: i64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples.
    pub samples: Vec<f32>,
}

impl DecodedAudioBlock {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_us(&self) -> u64 {
        self.frames() as u64 * 1_000_000 / self.sample_rate.max(1) as u64
    }
}

/// State shared by the producer, the consumer and control handles.
struct PlayoutShared {
    sample_rate: u32,
    channels: usize,
    /// Volume (0-100)
    volume: AtomicU32,
    muted: AtomicBool,
    /// Timestamp of the first block of the current epoch
    pending_anchor_us: AtomicI64,
    /// Ring generation + 1 that `pending_anchor_us` belongs to (0 = none)
    pending_anchor_gen: AtomicU64,
    /// Playback clock. Advanced by the consumer, cleared by either side
    clock_anchor_us: AtomicI64,
    frames_played: AtomicU64,
    clock_anchored: AtomicBool,
    epoch_resets: AtomicU64,
    peaks: PeakTap,
}

impl PlayoutShared {
    fn position_us(&self) -> Option<i64> {
        if !self.clock_anchored.load(Ordering::Acquire) {
            return None;
        }
        let anchor = self.clock_anchor_us.load(Ordering::Relaxed);
        let frames = self.frames_played.load(Ordering::Relaxed);
        let played_us = (frames as u128 * 1_000_000 / self.sample_rate as u128) as i64;
        Some(anchor.saturating_add(played_us))
    }

    fn effective_volume(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load(Ordering::Relaxed) as f32 / 100.0
        }
    }

    fn buffered_ms(&self, fill_samples: usize) -> f64 {
        fill_samples as f64 * 1000.0 / (self.sample_rate as f64 * self.channels as f64)
    }
}

/// Handle for volume, mute, clock and level access.
///
/// Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct PlayoutControls {
    shared: Arc<PlayoutShared>,
}

impl PlayoutControls {
    /// Returns the current volume (0-100).
    pub fn volume(&self) -> u32 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    /// Sets the volume (0-100).
    pub fn set_volume(&self, volume: u32) {
        self.shared.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn toggle_mute(&self) {
        self.shared.muted.fetch_xor(true, Ordering::Relaxed);
    }

    /// Returns the output gain (0.0-1.0) accounting for mute.
    pub fn effective_volume(&self) -> f32 {
        self.shared.effective_volume()
    }

    /// Playback position in microseconds, or `None` before the clock is
    /// anchored to the first block of the current epoch.
    pub fn position_us(&self) -> Option<i64> {
        self.shared.position_us()
    }

    /// Peak publication for a [`LevelMeter`](crate::metering::LevelMeter).
    pub fn peak_tap(&self) -> &PeakTap {
        &self.shared.peaks
    }
}

impl std::fmt::Debug for PlayoutControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayoutControls")
            .field("volume", &self.volume())
            .field("muted", &self.is_muted())
            .field("position_us", &self.position_us())
            .finish()
    }
}

/// Metrics snapshot for the playout engine.
#[derive(Debug, Clone, Default)]
pub struct PlayoutMetrics {
    pub ring: RingBufferMetrics,
    pub buffered_ms: f64,
    pub epoch_resets: u64,
}

/// Decode-side half of the engine.
pub struct AudioPlayoutProducer {
    ring: RingBufferProducer,
    shared: Arc<PlayoutShared>,
    diagnostics: SubsystemDiagnostics,
    thresholds: TimestampThresholds,
    last_input_us: Option<i64>,
    /// The next written block anchors the playback clock
    needs_anchor: bool,
}

/// Real-time half of the engine. Owned by the audio output callback.
pub struct AudioPlayoutConsumer {
    ring: RingBufferConsumer,
    shared: Arc<PlayoutShared>,
    diagnostics: SubsystemDiagnostics,
    anchored: bool,
}

/// Creates a playout engine split into producer and consumer halves.
pub fn audio_playout(
    config: &PlayoutConfig,
    diagnostics: SubsystemDiagnostics,
) -> (AudioPlayoutProducer, AudioPlayoutConsumer) {
    let (ring_producer, ring_consumer) = audio_ring_buffer(&config.ring_config());
    let channels = config.channels.max(1) as usize;
    let shared = Arc::new(PlayoutShared {
        sample_rate: config.sample_rate.max(1),
        channels,
        volume: AtomicU32::new(100),
        muted: AtomicBool::new(false),
        pending_anchor_us: AtomicI64::new(0),
        pending_anchor_gen: AtomicU64::new(0),
        clock_anchor_us: AtomicI64::new(0),
        frames_played: AtomicU64::new(0),
        clock_anchored: AtomicBool::new(false),
        epoch_resets: AtomicU64::new(0),
        peaks: PeakTap::new(channels),
    });

    tracing::debug!(
        "Audio playout: {}Hz/{}ch, buffer={:?}, startup={:?}, trim={:?}",
        config.sample_rate,
        config.channels,
        config.audio_buffer,
        config.startup_threshold,
        config.drift_trim_threshold
    );

    (
        AudioPlayoutProducer {
            ring: ring_producer,
            shared: shared.clone(),
            diagnostics: diagnostics.clone(),
            thresholds: config.timestamp_thresholds(),
            last_input_us: None,
            needs_anchor: true,
        },
        AudioPlayoutConsumer {
            ring: ring_consumer,
            shared,
            diagnostics,
            anchored: false,
        },
    )
}

impl AudioPlayoutProducer {
    /// Records an input timestamp and repairs the timeline if needed.
    ///
    /// A backward step beyond the epoch-reset threshold clears all buffered
    /// audio and re-anchors the playback clock to the next written block.
    pub fn observe_input_timestamp(&mut self, ts_us: i64) -> TimestampStep {
        let step = classify_timestamp_step(self.last_input_us, ts_us, self.thresholds);
        self.last_input_us = Some(ts_us);
        self.diagnostics.record_input_timestamp(ts_us);

        if step == TimestampStep::Wrap {
            tracing::warn!(
                "Audio playout: input timestamp went back to {}us, starting a new epoch",
                ts_us
            );
            self.epoch_reset();
        }
        step
    }

    /// Appends a decoded block.
    pub fn write_block(&mut self, block: &DecodedAudioBlock) -> Result<(), PlayoutError> {
        let channels = self.shared.channels;
        if block.sample_rate != self.shared.sample_rate || block.channels as usize != channels {
            return Err(PlayoutError::FormatMismatch {
                expected_rate: self.shared.sample_rate,
                expected_channels: channels as u16,
                rate: block.sample_rate,
                channels: block.channels,
            });
        }
        if block.samples.len() % channels != 0 {
            return Err(PlayoutError::PartialFrame(block.samples.len()));
        }

        if self.needs_anchor {
            let s = &self.shared;
            s.pending_anchor_us.store(block.timestamp_us, Ordering::Relaxed);
            // Published before the samples so a consumer that reads them sees the anchor
            s.pending_anchor_gen
                .store(self.ring.generation() + 1, Ordering::Release);
            self.needs_anchor = false;
            tracing::debug!("Audio playout: clock anchored at {}us", block.timestamp_us);
        }

        self.ring.write(&block.samples);
        Ok(())
    }

    fn epoch_reset(&mut self) {
        self.ring.request_flush();
        self.shared.clock_anchored.store(false, Ordering::Release);
        self.needs_anchor = true;
        self.shared.epoch_resets.fetch_add(1, Ordering::Relaxed);
        self.diagnostics.record_epoch_reset();
    }

    /// Returns the engine to its initial state: buffer cleared, startup
    /// threshold re-armed, clock unanchored, counters zeroed.
    ///
    /// Volume and mute are user settings and survive.
    pub fn reset(&mut self) {
        self.ring.request_flush();
        self.ring.reset_counters();
        let s = &self.shared;
        s.clock_anchored.store(false, Ordering::Release);
        s.frames_played.store(0, Ordering::Relaxed);
        s.epoch_resets.store(0, Ordering::Relaxed);
        s.peaks.take();
        self.needs_anchor = true;
        self.last_input_us = None;
        tracing::debug!("Audio playout reset");
    }

    /// Buffered audio in milliseconds.
    pub fn buffered_ms(&self) -> f64 {
        self.shared.buffered_ms(self.ring.fill_samples())
    }

    pub fn controls(&self) -> PlayoutControls {
        PlayoutControls {
            shared: self.shared.clone(),
        }
    }

    pub fn metrics(&self) -> PlayoutMetrics {
        let ring = self.ring.metrics();
        PlayoutMetrics {
            buffered_ms: self.shared.buffered_ms(ring.fill_samples),
            ring,
            epoch_resets: self.shared.epoch_resets.load(Ordering::Relaxed),
        }
    }
}

impl AudioPlayoutConsumer {
    /// Fills `out` (interleaved) with audio, then silence.
    ///
    /// Lock-free and bounded by `out.len()`. Never blocks.
    pub fn pull(&mut self, out: &mut [f32]) -> ReadOutcome {
        self.diagnostics.record_callback(Instant::now());
        let outcome = self.ring.read(out);
        let s = &self.shared;

        if outcome.flushed {
            self.anchored = false;
            s.clock_anchored.store(false, Ordering::Release);
            s.frames_played.store(0, Ordering::Relaxed);
        }
        if !self.anchored
            && s.pending_anchor_gen.load(Ordering::Acquire) == self.ring.generation() + 1
        {
            s.clock_anchor_us
                .store(s.pending_anchor_us.load(Ordering::Relaxed), Ordering::Relaxed);
            s.frames_played.store(0, Ordering::Relaxed);
            s.clock_anchored.store(true, Ordering::Release);
            self.anchored = true;
        }

        // Skipped samples are media time too; the clock tracks what is audible
        let advanced = outcome.samples_read + outcome.samples_skipped;
        if self.anchored && advanced > 0 {
            s.frames_played
                .fetch_add((advanced / s.channels) as u64, Ordering::Relaxed);
        }

        let real = &mut out[..outcome.samples_read];

        s.peaks.publish_interleaved(real);
        let gain = s.effective_volume();
        if gain != 1.0 {
            for sample in real.iter_mut() {
                *sample *= gain;
            }
        }

        if outcome.underrun {
            self.diagnostics.record_underrun();
        }
        if outcome.trimmed {
            self.diagnostics.record_drift_trim();
        }
        outcome
    }

    /// Buffered audio in milliseconds.
    pub fn buffered_ms(&self) -> f64 {
        self.shared.buffered_ms(self.ring.fill_samples())
    }

    pub fn position_us(&self) -> Option<i64> {
        self.shared.position_us()
    }

    pub fn controls(&self) -> PlayoutControls {
        PlayoutControls {
            shared: self.shared.clone(),
        }
    }

    pub fn is_producer_alive(&self) -> bool {
        self.ring.is_producer_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Subsystem;

    const RATE: u32 = 1000;

    /// 1kHz mono keeps sample math readable: 1 sample = 1ms.
    fn engine() -> (AudioPlayoutProducer, AudioPlayoutConsumer, SubsystemDiagnostics) {
        let diag = SubsystemDiagnostics::new(Subsystem::Audio);
        let mut config = PlayoutConfig::for_format(RATE, 1);
        config.drift_trim_threshold = None;
        let (p, c) = audio_playout(&config, diag.clone());
        (p, c, diag)
    }

    fn block(timestamp_us: i64, len: usize, value: f32) -> DecodedAudioBlock {
        DecodedAudioBlock {
            timestamp_us,
            sample_rate: RATE,
            channels: 1,
            samples: vec![value; len],
        }
    }

    #[test]
    fn test_startup_threshold() {
        let (mut producer, mut consumer, _) = engine();
        producer.write_block(&block(0, 299, 0.5)).unwrap();

        let mut out = [1.0f32; 10];
        let outcome = consumer.pull(&mut out);
        assert_eq!(outcome.samples_read, 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(producer.buffered_ms(), 299.0);

        producer.write_block(&block(299_000, 1, 0.5)).unwrap();
        let outcome = consumer.pull(&mut out);
        assert_eq!(outcome.samples_read, 10);
        assert_eq!(out, [0.5; 10]);
        assert_eq!(consumer.buffered_ms(), 290.0);
    }

    #[test]
    fn test_empty_pull_is_silent_underrun() {
        let (_producer, mut consumer, diag) = engine();
        let mut out = [0.7f32; 480];
        for _ in 0..4 {
            let outcome = consumer.pull(&mut out);
            assert!(outcome.underrun);
            assert!(out.iter().all(|&s| s == 0.0));
        }
        assert_eq!(diag.snapshot().underruns, 4);
        assert_eq!(diag.snapshot().callback_count, 4);
    }

    #[test]
    fn test_clock_follows_samples_played() {
        let (mut producer, mut consumer, _) = engine();
        assert_eq!(consumer.position_us(), None);

        producer.write_block(&block(5_000_000, 400, 0.1)).unwrap();
        let mut out = [0.0f32; 100];
        consumer.pull(&mut out);
        assert_eq!(consumer.position_us(), Some(5_100_000));
        consumer.pull(&mut out);
        assert_eq!(producer.controls().position_us(), Some(5_200_000));
    }

    #[test]
    fn test_epoch_reset_clears_and_reanchors() {
        let (mut producer, mut consumer, diag) = engine();
        assert_eq!(producer.observe_input_timestamp(1_000_000), TimestampStep::First);
        producer.write_block(&block(1_000_000, 500, 0.2)).unwrap();
        assert_eq!(producer.observe_input_timestamp(900_000), TimestampStep::Normal);
        producer.write_block(&block(900_000, 500, 0.2)).unwrap();

        let mut out = [0.0f32; 50];
        consumer.pull(&mut out);
        assert_eq!(consumer.position_us(), Some(1_050_000));

        let earlier = 900_000 - 30_000_001;
        assert_eq!(producer.observe_input_timestamp(earlier), TimestampStep::Wrap);
        assert_eq!(producer.metrics().epoch_resets, 1);
        assert_eq!(producer.buffered_ms(), 0.0);

        // Next decoded block anchors the clock
        producer.write_block(&block(earlier, 400, 0.3)).unwrap();
        let outcome = consumer.pull(&mut out);
        assert!(outcome.flushed);
        assert_eq!(out, [0.3; 50]);
        assert_eq!(consumer.position_us(), Some(earlier + 50_000));

        // Only one clear for the whole sequence
        assert_eq!(producer.observe_input_timestamp(earlier + 20_000), TimestampStep::Normal);
        assert_eq!(producer.metrics().epoch_resets, 1);
        assert_eq!(diag.snapshot().epoch_resets, 1);
        assert_eq!(diag.snapshot().input_wraps, 1);
    }

    #[test]
    fn test_pull_never_mixes_epochs() {
        let (mut producer, mut consumer, _) = engine();
        producer.write_block(&block(0, 400, 1.0)).unwrap();
        producer.observe_input_timestamp(100_000_000);
        producer.observe_input_timestamp(0);
        producer.write_block(&block(0, 400, 2.0)).unwrap();

        let mut out = [0.0f32; 800];
        let outcome = consumer.pull(&mut out);
        assert!(outcome.flushed);
        assert_eq!(outcome.samples_read, 400);
        assert!(out[..400].iter().all(|&s| s == 2.0));
    }

    #[test]
    fn test_volume_and_mute_apply_at_output() {
        let (mut producer, mut consumer, _) = engine();
        let controls = producer.controls();
        producer.write_block(&block(0, 600, 0.8)).unwrap();

        controls.set_volume(50);
        let mut out = [0.0f32; 4];
        consumer.pull(&mut out);
        assert_eq!(out, [0.4; 4]);
        // Peaks are published pre-gain
        assert_eq!(controls.peak_tap().take(), vec![0.8]);

        controls.toggle_mute();
        consumer.pull(&mut out);
        assert_eq!(out, [0.0; 4]);

        controls.set_muted(false);
        controls.set_volume(250);
        assert_eq!(controls.volume(), 100);
        consumer.pull(&mut out);
        assert_eq!(out, [0.8; 4]);
    }

    #[test]
    fn test_drift_trim() {
        let diag = SubsystemDiagnostics::new(Subsystem::Audio);
        let config = PlayoutConfig::for_format(RATE, 1);
        let (mut producer, mut consumer) = audio_playout(&config, diag.clone());

        producer.write_block(&block(0, 1500, 0.1)).unwrap();
        let mut out = [0.0f32; 10];
        let outcome = consumer.pull(&mut out);
        assert!(outcome.trimmed);
        assert_eq!(outcome.samples_skipped, 1200);
        assert_eq!(consumer.buffered_ms(), 290.0);
        assert_eq!(diag.snapshot().drift_trims, 1);

        // Samples 1200..1210 were heard, so the clock sits at 1.21s of media
        assert_eq!(consumer.position_us(), Some(1_210_000));
        consumer.pull(&mut out);
        assert_eq!(consumer.position_us(), Some(1_220_000));
    }

    #[test]
    fn test_lap_skip_keeps_clock_on_media_time() {
        let (mut producer, mut consumer, _) = engine();
        // 4s at 1kHz rounds up to a 4096-sample ring; 5000 samples lap it
        producer.write_block(&block(0, 4000, 0.1)).unwrap();
        producer.write_block(&block(4_000_000, 1000, 0.2)).unwrap();

        let mut out = [0.0f32; 10];
        let outcome = consumer.pull(&mut out);
        assert_eq!(outcome.samples_skipped, 5000 - 2048);
        assert_eq!(out, [0.1; 10]);
        assert_eq!(consumer.position_us(), Some(2_962_000));
    }

    #[test]
    fn test_format_mismatch_rejected() {
        let (mut producer, _consumer, _) = engine();
        let mut stereo = block(0, 4, 0.0);
        stereo.channels = 2;
        assert!(matches!(
            producer.write_block(&stereo),
            Err(PlayoutError::FormatMismatch { channels: 2, .. })
        ));
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let (mut producer, mut consumer, _) = engine();
        producer.observe_input_timestamp(0);
        producer.write_block(&block(0, 500, 0.5)).unwrap();
        let mut out = [0.0f32; 100];
        consumer.pull(&mut out);
        producer.observe_input_timestamp(-40_000_000);

        producer.reset();
        let metrics = producer.metrics();
        assert_eq!(metrics.buffered_ms, 0.0);
        assert_eq!(metrics.epoch_resets, 0);
        assert_eq!(metrics.ring.total_written, 0);
        assert_eq!(producer.controls().position_us(), None);
        // Input tracking restarts
        assert_eq!(producer.observe_input_timestamp(-40_000_000), TimestampStep::First);

        // Startup threshold is re-armed
        producer.write_block(&block(7_000, 100, 0.5)).unwrap();
        let outcome = consumer.pull(&mut out);
        assert!(outcome.flushed);
        assert_eq!(outcome.samples_read, 0);
        assert_eq!(consumer.position_us(), Some(7_000));
    }
}
