//! Playout diagnostics and health assessment.
//!
//! Each subsystem (video, audio) gets a [`SubsystemDiagnostics`] handle that
//! the decode side and the playout clock record into. Recording is lock-free;
//! [`SubsystemDiagnostics::reset`] and [`SubsystemDiagnostics::snapshot`]
//! serialize on a small lock so a snapshot never observes a half-reset state.
//!
//! # Usage
//!
//! ```ignore
//! let diagnostics = DiagnosticsAggregator::new();
//! let audio = diagnostics.subsystem(Subsystem::Audio).clone();
//!
//! // From the output callback
//! audio.record_callback(Instant::now());
//!
//! // Periodically
//! println!("{}", diagnostics.snapshot());
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Forward or backward input-timestamp step (µs) counted as a jump.
pub const INPUT_JUMP_THRESHOLD_US: i64 = 100_000;

/// Backward input-timestamp step (µs) treated as a wrap / epoch change.
pub const INPUT_WRAP_THRESHOLD_US: i64 = 30_000_000;

/// Fraction of the expected unit duration a pts step may deviate by before
/// it counts as a discontinuity.
pub const PTS_JUMP_TOLERANCE: f64 = 0.5;

/// Rates above these mark a subsystem degraded.
const DEGRADED_ERROR_RATE: f64 = 0.01;
const DEGRADED_DISCARD_RATE: f64 = 0.05;
const DEGRADED_UNDERRUN_RATE: f64 = 0.01;

/// Rates above these mark a subsystem critical.
const CRITICAL_ERROR_RATE: f64 = 0.10;
const CRITICAL_DISCARD_RATE: f64 = 0.25;
const CRITICAL_UNDERRUN_RATE: f64 = 0.10;

/// Sentinel for "no timestamp recorded yet".
const NO_TIMESTAMP: i64 = i64::MIN;

/// A playout subsystem with its own diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Video,
    Audio,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::Video => write!(f, "video"),
            Subsystem::Audio => write!(f, "audio"),
        }
    }
}

/// Classification of one input-timestamp step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampStep {
    /// No previous timestamp to compare with.
    First,
    /// Within the jump threshold.
    Normal,
    /// Moved by more than the jump threshold in either direction.
    Jump,
    /// Moved backward by more than the wrap threshold.
    Wrap,
}

/// Thresholds used to classify input-timestamp steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampThresholds {
    pub jump_us: i64,
    pub wrap_us: i64,
}

impl Default for TimestampThresholds {
    fn default() -> Self {
        Self {
            jump_us: INPUT_JUMP_THRESHOLD_US,
            wrap_us: INPUT_WRAP_THRESHOLD_US,
        }
    }
}

/// Classifies the step from `prev` to `ts`.
pub fn classify_timestamp_step(
    prev: Option<i64>,
    ts: i64,
    thresholds: TimestampThresholds,
) -> TimestampStep {
    let Some(prev) = prev else {
        return TimestampStep::First;
    };
    let delta = ts.saturating_sub(prev);
    if delta < -thresholds.wrap_us {
        TimestampStep::Wrap
    } else if delta.saturating_abs() > thresholds.jump_us {
        TimestampStep::Jump
    } else {
        TimestampStep::Normal
    }
}

/// Overall health of a subsystem or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Diagnostics recorder for one subsystem.
///
/// Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct SubsystemDiagnostics {
    inner: Arc<DiagnosticsInner>,
}

struct DiagnosticsInner {
    subsystem: Subsystem,
    thresholds: TimestampThresholds,
    /// Reference point for callback timing
    origin: Instant,
    /// Held by reset and snapshot, never by recorders
    reset_lock: Mutex<()>,

    // Callback cadence
    callback_count: AtomicU64,
    last_callback_us: AtomicU64,
    interval_min_us: AtomicU64,
    interval_max_us: AtomicU64,
    interval_total_us: AtomicU64,

    // Presentation-timestamp continuity
    last_pts_us: AtomicI64,
    pts_jumps: AtomicU64,
    max_pts_jump_us: AtomicU64,

    // Input-timestamp continuity
    last_input_us: AtomicI64,
    input_jumps: AtomicU64,
    input_wraps: AtomicU64,

    // Pipeline events
    units_submitted: AtomicU64,
    units_decoded: AtomicU64,
    decode_errors: AtomicU64,
    decoder_recreations: AtomicU64,
    stale_outputs: AtomicU64,
    discards: AtomicU64,
    underruns: AtomicU64,
    epoch_resets: AtomicU64,
    drift_trims: AtomicU64,
}

impl SubsystemDiagnostics {
    pub fn new(subsystem: Subsystem) -> Self {
        Self::with_thresholds(subsystem, TimestampThresholds::default())
    }

    pub fn with_thresholds(subsystem: Subsystem, thresholds: TimestampThresholds) -> Self {
        Self {
            inner: Arc::new(DiagnosticsInner {
                subsystem,
                thresholds,
                origin: Instant::now(),
                reset_lock: Mutex::new(()),
                callback_count: AtomicU64::new(0),
                last_callback_us: AtomicU64::new(u64::MAX),
                interval_min_us: AtomicU64::new(u64::MAX),
                interval_max_us: AtomicU64::new(0),
                interval_total_us: AtomicU64::new(0),
                last_pts_us: AtomicI64::new(NO_TIMESTAMP),
                pts_jumps: AtomicU64::new(0),
                max_pts_jump_us: AtomicU64::new(0),
                last_input_us: AtomicI64::new(NO_TIMESTAMP),
                input_jumps: AtomicU64::new(0),
                input_wraps: AtomicU64::new(0),
                units_submitted: AtomicU64::new(0),
                units_decoded: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
                decoder_recreations: AtomicU64::new(0),
                stale_outputs: AtomicU64::new(0),
                discards: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
                epoch_resets: AtomicU64::new(0),
                drift_trims: AtomicU64::new(0),
            }),
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.inner.subsystem
    }

    pub fn thresholds(&self) -> TimestampThresholds {
        self.inner.thresholds
    }

    /// Records one playout callback (audio pull or render tick).
    pub fn record_callback(&self, now: Instant) {
        let i = &self.inner;
        let now_us = now.saturating_duration_since(i.origin).as_micros() as u64;
        let prev = i.last_callback_us.swap(now_us, Ordering::Relaxed);
        i.callback_count.fetch_add(1, Ordering::Relaxed);
        if prev != u64::MAX && now_us >= prev {
            let interval = now_us - prev;
            i.interval_min_us.fetch_min(interval, Ordering::Relaxed);
            i.interval_max_us.fetch_max(interval, Ordering::Relaxed);
            i.interval_total_us.fetch_add(interval, Ordering::Relaxed);
        }
    }

    /// Records the presentation timestamp of a decoded unit.
    ///
    /// Returns true if the step from the previous unit deviated from
    /// `expected_duration_us` by more than [`PTS_JUMP_TOLERANCE`].
    pub fn record_presentation(&self, pts_us: i64, expected_duration_us: u64) -> bool {
        let i = &self.inner;
        let prev = i.last_pts_us.swap(pts_us, Ordering::Relaxed);
        if prev == NO_TIMESTAMP || expected_duration_us == 0 {
            return false;
        }
        let step = pts_us.saturating_sub(prev);
        let deviation = step.saturating_sub(expected_duration_us as i64).unsigned_abs();
        if deviation as f64 > expected_duration_us as f64 * PTS_JUMP_TOLERANCE {
            i.pts_jumps.fetch_add(1, Ordering::Relaxed);
            i.max_pts_jump_us.fetch_max(deviation, Ordering::Relaxed);
            tracing::trace!(
                "{}: pts discontinuity {}us (expected step {}us)",
                i.subsystem,
                step,
                expected_duration_us
            );
            true
        } else {
            false
        }
    }

    /// Records an input (capture) timestamp and classifies the step.
    pub fn record_input_timestamp(&self, ts_us: i64) -> TimestampStep {
        let i = &self.inner;
        let prev = i.last_input_us.swap(ts_us, Ordering::Relaxed);
        let prev = (prev != NO_TIMESTAMP).then_some(prev);
        let step = classify_timestamp_step(prev, ts_us, i.thresholds);
        match step {
            TimestampStep::Jump => {
                i.input_jumps.fetch_add(1, Ordering::Relaxed);
            }
            TimestampStep::Wrap => {
                i.input_wraps.fetch_add(1, Ordering::Relaxed);
            }
            TimestampStep::First | TimestampStep::Normal => {}
        }
        step
    }

    pub fn record_submitted(&self) {
        self.inner.units_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, units: u64) {
        self.inner.units_decoded.fetch_add(units, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.inner.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recreation(&self) {
        self.inner.decoder_recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_output(&self) {
        self.inner.stale_outputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discards(&self, count: u64) {
        if count > 0 {
            self.inner.discards.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_underrun(&self) {
        self.inner.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_epoch_reset(&self) {
        self.inner.epoch_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drift_trim(&self) {
        self.inner.drift_trims.fetch_add(1, Ordering::Relaxed);
    }

    /// Reinitializes every counter to zero and every min/max to identity.
    pub fn reset(&self) {
        let i = &self.inner;
        let _guard = i.reset_lock.lock();
        i.callback_count.store(0, Ordering::Relaxed);
        i.last_callback_us.store(u64::MAX, Ordering::Relaxed);
        i.interval_min_us.store(u64::MAX, Ordering::Relaxed);
        i.interval_max_us.store(0, Ordering::Relaxed);
        i.interval_total_us.store(0, Ordering::Relaxed);
        i.last_pts_us.store(NO_TIMESTAMP, Ordering::Relaxed);
        i.pts_jumps.store(0, Ordering::Relaxed);
        i.max_pts_jump_us.store(0, Ordering::Relaxed);
        i.last_input_us.store(NO_TIMESTAMP, Ordering::Relaxed);
        i.input_jumps.store(0, Ordering::Relaxed);
        i.input_wraps.store(0, Ordering::Relaxed);
        i.units_submitted.store(0, Ordering::Relaxed);
        i.units_decoded.store(0, Ordering::Relaxed);
        i.decode_errors.store(0, Ordering::Relaxed);
        i.decoder_recreations.store(0, Ordering::Relaxed);
        i.stale_outputs.store(0, Ordering::Relaxed);
        i.discards.store(0, Ordering::Relaxed);
        i.underruns.store(0, Ordering::Relaxed);
        i.epoch_resets.store(0, Ordering::Relaxed);
        i.drift_trims.store(0, Ordering::Relaxed);
    }

    /// Returns a consistent snapshot with derived rates.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let i = &self.inner;
        let _guard = i.reset_lock.lock();

        let callback_count = i.callback_count.load(Ordering::Relaxed);
        let interval_min = i.interval_min_us.load(Ordering::Relaxed);
        let interval_total = i.interval_total_us.load(Ordering::Relaxed);
        let intervals = callback_count.saturating_sub(1);

        DiagnosticsSnapshot {
            subsystem: i.subsystem,
            callback_count,
            callback_interval_min_us: if interval_min == u64::MAX { 0 } else { interval_min },
            callback_interval_avg_us: if intervals > 0 {
                interval_total / intervals
            } else {
                0
            },
            callback_interval_max_us: i.interval_max_us.load(Ordering::Relaxed),
            pts_jumps: i.pts_jumps.load(Ordering::Relaxed),
            max_pts_jump_us: i.max_pts_jump_us.load(Ordering::Relaxed),
            input_jumps: i.input_jumps.load(Ordering::Relaxed),
            input_wraps: i.input_wraps.load(Ordering::Relaxed),
            units_submitted: i.units_submitted.load(Ordering::Relaxed),
            units_decoded: i.units_decoded.load(Ordering::Relaxed),
            decode_errors: i.decode_errors.load(Ordering::Relaxed),
            decoder_recreations: i.decoder_recreations.load(Ordering::Relaxed),
            stale_outputs: i.stale_outputs.load(Ordering::Relaxed),
            discards: i.discards.load(Ordering::Relaxed),
            underruns: i.underruns.load(Ordering::Relaxed),
            epoch_resets: i.epoch_resets.load(Ordering::Relaxed),
            drift_trims: i.drift_trims.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.snapshot().health()
    }
}

impl std::fmt::Debug for SubsystemDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemDiagnostics")
            .field("subsystem", &self.inner.subsystem)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one subsystem's diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsSnapshot {
    pub subsystem: Subsystem,

    /// Number of playout callbacks recorded
    pub callback_count: u64,
    pub callback_interval_min_us: u64,
    pub callback_interval_avg_us: u64,
    pub callback_interval_max_us: u64,

    /// Presentation-timestamp discontinuities
    pub pts_jumps: u64,
    /// Largest deviation from the expected step (microseconds)
    pub max_pts_jump_us: u64,

    /// Input-timestamp steps beyond the jump threshold
    pub input_jumps: u64,
    /// Input-timestamp steps backward beyond the wrap threshold
    pub input_wraps: u64,

    pub units_submitted: u64,
    pub units_decoded: u64,
    pub decode_errors: u64,
    pub decoder_recreations: u64,
    /// Outputs dropped because their decoder generation was torn down
    pub stale_outputs: u64,
    /// Units dropped by bounded queues (eviction, skip-ahead, drop-oldest)
    pub discards: u64,
    pub underruns: u64,
    pub epoch_resets: u64,
    pub drift_trims: u64,
}

impl DiagnosticsSnapshot {
    /// Decode errors per submitted unit.
    pub fn error_rate(&self) -> f64 {
        ratio(self.decode_errors, self.units_submitted)
    }

    /// Discarded units per decoded unit.
    pub fn discard_rate(&self) -> f64 {
        ratio(self.discards, self.units_decoded)
    }

    /// Underruns per playout callback.
    pub fn underrun_rate(&self) -> f64 {
        ratio(self.underruns, self.callback_count)
    }

    pub fn health(&self) -> HealthStatus {
        let (errors, discards, underruns) =
            (self.error_rate(), self.discard_rate(), self.underrun_rate());
        if errors > CRITICAL_ERROR_RATE
            || discards > CRITICAL_DISCARD_RATE
            || underruns > CRITICAL_UNDERRUN_RATE
        {
            HealthStatus::Critical
        } else if errors > DEGRADED_ERROR_RATE
            || discards > DEGRADED_DISCARD_RATE
            || underruns > DEGRADED_UNDERRUN_RATE
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:?}, {} units ({} errors, {} recreations, {} discards), {} underruns / {} callbacks, cadence {}/{}/{}us, {} pts jumps (max {}us), {} input jumps, {} wraps",
            self.subsystem,
            self.health(),
            self.units_decoded,
            self.decode_errors,
            self.decoder_recreations,
            self.discards,
            self.underruns,
            self.callback_count,
            self.callback_interval_min_us,
            self.callback_interval_avg_us,
            self.callback_interval_max_us,
            self.pts_jumps,
            self.max_pts_jump_us,
            self.input_jumps,
            self.input_wraps
        )
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Diagnostics for every playout subsystem of a session.
#[derive(Clone, Debug)]
pub struct DiagnosticsAggregator {
    video: SubsystemDiagnostics,
    audio: SubsystemDiagnostics,
}

/// Snapshot of all subsystems.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub video: DiagnosticsSnapshot,
    pub audio: DiagnosticsSnapshot,
}

impl AggregateSnapshot {
    /// Worst health across subsystems.
    pub fn health(&self) -> HealthStatus {
        self.video.health().max(self.audio.health())
    }
}

impl std::fmt::Display for AggregateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.video)?;
        write!(f, "{}", self.audio)
    }
}

impl DiagnosticsAggregator {
    pub fn new() -> Self {
        Self::with_thresholds(TimestampThresholds::default())
    }

    pub fn with_thresholds(thresholds: TimestampThresholds) -> Self {
        Self {
            video: SubsystemDiagnostics::with_thresholds(Subsystem::Video, thresholds),
            audio: SubsystemDiagnostics::with_thresholds(Subsystem::Audio, thresholds),
        }
    }

    pub fn subsystem(&self, subsystem: Subsystem) -> &SubsystemDiagnostics {
        match subsystem {
            Subsystem::Video => &self.video,
            Subsystem::Audio => &self.audio,
        }
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            video: self.video.snapshot(),
            audio: self.audio.snapshot(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.snapshot().health()
    }

    pub fn reset(&self) {
        self.video.reset();
        self.audio.reset();
    }

    /// Logs current status at debug level.
    pub fn log_status(&self) {
        let snap = self.snapshot();
        tracing::debug!("Playout diagnostics ({:?}):\n{}", snap.health(), snap);
    }
}

impl Default for DiagnosticsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
