//! Audio level metering.
//!
//! The real-time side only publishes raw per-channel block peaks through a
//! [`PeakTap`]. Smoothing happens elsewhere, on whatever cadence the UI
//! refreshes at, in a [`LevelMeter`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fraction of the rise applied per refresh when the level goes up.
pub const ATTACK_COEFF: f32 = 0.6;
/// Multiplier applied per refresh when the level falls.
pub const RELEASE_COEFF: f32 = 0.92;
/// How long a peak is held before decaying.
pub const PEAK_HOLD: Duration = Duration::from_millis(1500);
/// Multiplier applied per refresh to a peak past its hold time.
pub const PEAK_DECAY_COEFF: f32 = 0.9;
/// Levels below this snap to zero.
pub const LEVEL_FLOOR: f32 = 0.001;

/// Lock-free per-channel peak publication.
///
/// Cloned between the output callback (which publishes) and the meter
/// (which takes). Peaks accumulate as a running max until taken.
#[derive(Clone)]
pub struct PeakTap {
    peaks: Arc<[AtomicU32]>,
}

impl PeakTap {
    pub fn new(channels: usize) -> Self {
        Self {
            peaks: (0..channels.max(1))
                .map(|_| AtomicU32::new(0.0f32.to_bits()))
                .collect(),
        }
    }

    pub fn channels(&self) -> usize {
        self.peaks.len()
    }

    /// Publishes the absolute peak of each channel in an interleaved block.
    pub fn publish_interleaved(&self, samples: &[f32]) {
        let channels = self.peaks.len();
        for (ch, slot) in self.peaks.iter().enumerate() {
            let peak = samples
                .iter()
                .skip(ch)
                .step_by(channels)
                .fold(0.0f32, |acc, s| acc.max(s.abs()));
            // Non-negative f32 bit patterns order like the values they encode
            slot.fetch_max(peak.to_bits(), Ordering::Relaxed);
        }
    }

    /// Takes the peaks accumulated since the last call, resetting them.
    pub fn take(&self) -> Vec<f32> {
        self.peaks
            .iter()
            .map(|slot| f32::from_bits(slot.swap(0.0f32.to_bits(), Ordering::Relaxed)))
            .collect()
    }
}

impl std::fmt::Debug for PeakTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeakTap")
            .field("channels", &self.peaks.len())
            .finish()
    }
}

/// Smoothed level and held peak of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelMeter {
    pub level: f32,
    pub peak: f32,
    peak_since: Option<Instant>,
}

impl ChannelMeter {
    fn new() -> Self {
        Self {
            level: 0.0,
            peak: 0.0,
            peak_since: None,
        }
    }

    fn update(&mut self, raw: f32, now: Instant) {
        if raw > self.level {
            self.level += ATTACK_COEFF * (raw - self.level);
        } else {
            self.level *= RELEASE_COEFF;
        }
        if self.level < LEVEL_FLOOR {
            self.level = 0.0;
        }

        if self.level >= self.peak && self.level > 0.0 {
            self.peak = self.level;
            self.peak_since = Some(now);
        } else if self
            .peak_since
            .map_or(true, |since| now.saturating_duration_since(since) >= PEAK_HOLD)
        {
            self.peak *= PEAK_DECAY_COEFF;
            if self.peak < LEVEL_FLOOR {
                self.peak = 0.0;
            }
        }
    }
}

/// Level meter with fast attack, slow release and peak hold.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    channels: Vec<ChannelMeter>,
}

impl LevelMeter {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: vec![ChannelMeter::new(); channels.max(1)],
        }
    }

    /// Feeds one refresh worth of raw peaks (one per channel).
    pub fn refresh(&mut self, raw_peaks: &[f32], now: Instant) {
        for (meter, &raw) in self.channels.iter_mut().zip(raw_peaks) {
            meter.update(raw, now);
        }
    }

    /// Takes peaks from `tap` and refreshes.
    pub fn refresh_from(&mut self, tap: &PeakTap, now: Instant) {
        let peaks = tap.take();
        self.refresh(&peaks, now);
    }

    pub fn channels(&self) -> &[ChannelMeter] {
        &self.channels
    }

    pub fn reset(&mut self) {
        self.channels.fill(ChannelMeter::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_publishes_per_channel_max() {
        let tap = PeakTap::new(2);
        tap.publish_interleaved(&[0.1, -0.5, -0.3, 0.2]);
        tap.publish_interleaved(&[0.2, 0.1]);
        assert_eq!(tap.take(), vec![0.3, 0.5]);
        assert_eq!(tap.take(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_attack_and_release() {
        let mut meter = LevelMeter::new(1);
        let now = Instant::now();

        meter.refresh(&[1.0], now);
        assert!((meter.channels()[0].level - 0.6).abs() < 1e-6);
        meter.refresh(&[1.0], now);
        assert!((meter.channels()[0].level - 0.84).abs() < 1e-6);

        meter.refresh(&[0.0], now);
        assert!((meter.channels()[0].level - 0.84 * 0.92).abs() < 1e-6);

        // Release eventually snaps to the floor
        for _ in 0..200 {
            meter.refresh(&[0.0], now);
        }
        assert_eq!(meter.channels()[0].level, 0.0);
    }

    #[test]
    fn test_peak_hold_then_decay() {
        let mut meter = LevelMeter::new(1);
        let t0 = Instant::now();
        meter.refresh(&[1.0], t0);
        let held = meter.channels()[0].peak;
        assert!((held - 0.6).abs() < 1e-6);

        // Within hold time the peak stays put while the level falls
        meter.refresh(&[0.0], t0 + Duration::from_millis(500));
        assert_eq!(meter.channels()[0].peak, held);

        // After hold time the peak decays
        meter.refresh(&[0.0], t0 + Duration::from_millis(1600));
        assert!((meter.channels()[0].peak - held * 0.9).abs() < 1e-6);

        let mut t = t0 + Duration::from_millis(1600);
        for _ in 0..200 {
            t += Duration::from_millis(16);
            meter.refresh(&[0.0], t);
        }
        assert_eq!(meter.channels()[0].peak, 0.0);
    }

    #[test]
    fn test_refresh_from_tap() {
        let tap = PeakTap::new(2);
        let mut meter = LevelMeter::new(2);
        tap.publish_interleaved(&[0.5, 0.0]);
        meter.refresh_from(&tap, Instant::now());
        assert!(meter.channels()[0].level > 0.0);
        assert_eq!(meter.channels()[1].level, 0.0);

        meter.reset();
        assert_eq!(meter.channels()[0].level, 0.0);
        assert_eq!(meter.channels()[0].peak, 0.0);
    }
}
