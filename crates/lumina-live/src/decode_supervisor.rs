//! Decoder lifecycle supervision.
//!
//! A [`DecodeSupervisor`] owns one decoder on a dedicated worker thread. Input
//! goes in through a bounded drop-oldest channel so a slow decoder keeps the
//! stream near the live edge instead of building latency. Output comes back
//! through a second bounded channel, tagged with the configuration generation
//! that produced it.
//!
//! ```text
//!                 configure()            fatal error
//! Unconfigured ─────────────▶ Configured ────────────▶ Recovering
//!      ▲                          ▲                        │
//!      │ reset()                  └──── decoder recreated ─┘
//!      │
//!   any state ── close() ──▶ Closed
//! ```
//!
//! Decoders themselves are pluggable through [`DecoderFactory`] and
//! [`MediaDecoder`]; this crate ships no codec.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::diagnostics::SubsystemDiagnostics;

/// Consecutive recoverable errors after which the decoder is recreated.
pub const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 100;

/// Codec parameters needed to (re)create a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Codec string, e.g. "avc1.64001f" or "mp4a.40.2".
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Out-of-band codec description (avcC, AudioSpecificConfig).
    pub description: Option<Bytes>,
}

impl DecoderConfig {
    pub fn video(codec: impl Into<String>, description: Option<Bytes>) -> Self {
        Self {
            codec: codec.into(),
            sample_rate: None,
            channels: None,
            description,
        }
    }

    pub fn audio(
        codec: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        description: Option<Bytes>,
    ) -> Self {
        Self {
            codec: codec.into(),
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            description,
        }
    }
}

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    /// Presentation timestamp in microseconds.
    pub timestamp_us: i64,
    pub is_keyframe: bool,
    pub data: Bytes,
}

/// Error reported by a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The unit was bad; the decoder is still usable.
    #[error("decode error: {0}")]
    Recoverable(String),
    /// The decoder is unusable and must be recreated.
    #[error("fatal decoder error: {0}")]
    Fatal(String),
}

/// Errors from [`DecodeSupervisor`] operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("decode supervisor is closed")]
    Closed,
    #[error("decode supervisor is not configured")]
    NotConfigured,
    #[error("failed to create decoder for {codec}: {source}")]
    Create {
        codec: String,
        #[source]
        source: DecodeError,
    },
    #[error("failed to spawn decode thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("decode thread exited unexpectedly")]
    WorkerGone,
}

/// A decoder driven by the supervisor's worker thread.
pub trait MediaDecoder: Send + 'static {
    type Output: Send + 'static;

    /// Decodes one unit into zero or more outputs.
    fn decode(&mut self, unit: &EncodedUnit) -> Result<Vec<Self::Output>, DecodeError>;
}

/// Creates decoders from a [`DecoderConfig`].
pub trait DecoderFactory: Send + Sync + 'static {
    type Decoder: MediaDecoder;

    fn create(&self, config: &DecoderConfig) -> Result<Self::Decoder, DecodeError>;
}

/// Output type produced by a factory's decoders.
pub type OutputOf<F> = <<F as DecoderFactory>::Decoder as MediaDecoder>::Output;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unconfigured,
    Configured,
    /// The decoder failed fatally and has not been successfully recreated.
    Recovering,
    /// Terminal.
    Closed,
}

/// Configuration for a [`DecodeSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Encoded units buffered ahead of the decoder.
    pub input_capacity: usize,
    /// Decoded outputs buffered for the consumer.
    pub output_capacity: usize,
    /// How often the worker checks its stop flag while idle.
    pub poll_interval: Duration,
    pub thread_name: String,
    pub max_consecutive_errors: u32,
}

impl SupervisorConfig {
    pub fn named(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            input_capacity: 64,
            output_capacity: 32,
            poll_interval: Duration::from_millis(50),
            thread_name: "lumina-decode".into(),
            max_consecutive_errors: MAX_CONSECUTIVE_DECODE_ERRORS,
        }
    }
}

/// Result of a [`LiveEdgeSender::send`] attempt (excluding disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Item was enqueued directly.
    Sent,
    /// An older item was evicted (or the new one dropped) to stay near live edge.
    Dropped,
}

/// Sentinel error indicating the channel is permanently closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

/// Bounded crossbeam channel wrapper with best-effort live-edge policy.
///
/// When the channel is full, drains the oldest item and retries. Under
/// contention with the consumer the drain may race; the goal is "stay near
/// live edge", not strict FIFO eviction.
pub struct LiveEdgeSender<T> {
    tx: Sender<T>,
    rx_drain: Receiver<T>,
}

impl<T> LiveEdgeSender<T> {
    /// Both `tx` and `rx_drain` must be from the same channel.
    pub fn new(tx: Sender<T>, rx_drain: Receiver<T>) -> Self {
        Self { tx, rx_drain }
    }

    /// Creates a bounded channel and returns the live-edge sender with a
    /// receiver for the consumer.
    pub fn bounded(capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self::new(tx, rx.clone()), rx)
    }

    /// Sends with best-effort live-edge policy. Never blocks.
    pub fn send(&self, item: T) -> Result<SendResult, ChannelClosed> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(SendResult::Sent),
            Err(TrySendError::Disconnected(_)) => Err(ChannelClosed),
            Err(TrySendError::Full(item)) => {
                let _ = self.rx_drain.try_recv(); // best-effort drain (race ok)
                match self.tx.try_send(item) {
                    Ok(()) => Ok(SendResult::Dropped),
                    Err(TrySendError::Disconnected(_)) => Err(ChannelClosed),
                    Err(TrySendError::Full(_)) => Ok(SendResult::Dropped),
                }
            }
        }
    }
}

/// Output tagged with the configuration generation that produced it.
struct Tagged<O> {
    generation: u64,
    output: O,
}

/// State shared with the worker thread.
struct SupervisorShared {
    state: Mutex<SupervisorState>,
    generation: AtomicU64,
}

impl SupervisorShared {
    /// Sets `state` if `generation` is still current.
    fn transition(&self, generation: u64, state: SupervisorState) {
        let mut current = self.state.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            *current = state;
        }
    }
}

/// Owns the decode thread. Signals stop on drop and joins.
struct DecodeWorker {
    input: LiveEdgeSender<EncodedUnit>,
    handle: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl DecodeWorker {
    /// The thread ended on its own (it only exits early by panicking).
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                tracing::warn!("Decode thread join failed: {:?}", e);
            }
        }
    }
}

/// Everything the worker thread owns.
struct WorkerContext<F: DecoderFactory> {
    factory: Arc<F>,
    decoder_config: DecoderConfig,
    decoder: Option<F::Decoder>,
    generation: u64,
    shared: Arc<SupervisorShared>,
    diagnostics: SubsystemDiagnostics,
    input: Receiver<EncodedUnit>,
    output: LiveEdgeSender<Tagged<OutputOf<F>>>,
    stop_flag: Arc<AtomicBool>,
    poll_interval: Duration,
    max_consecutive_errors: u32,
}

/// Runs one decode call, turning a decoder panic into a fatal error.
///
/// The decoder is discarded after a fatal error, so any state the unwind
/// left behind is never observed.
fn decode_guarded<D: MediaDecoder>(
    decoder: &mut D,
    unit: &EncodedUnit,
) -> Result<Vec<D::Output>, DecodeError> {
    match catch_unwind(AssertUnwindSafe(|| decoder.decode(unit))) {
        Ok(result) => result,
        Err(_panic) => {
            tracing::error!("Decoder panicked on unit at {}us", unit.timestamp_us);
            Err(DecodeError::Fatal("decoder panicked".into()))
        }
    }
}

impl<F: DecoderFactory> WorkerContext<F> {
    fn run(mut self) {
        tracing::info!(
            "Decode thread started ({}, generation {})",
            self.decoder_config.codec,
            self.generation
        );
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                tracing::debug!("Decode thread: stop_flag set, exiting");
                break;
            }
            let unit = match self.input.recv_timeout(self.poll_interval) {
                Ok(unit) => unit,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Decode thread: input disconnected, exiting");
                    break;
                }
            };

            if self.decoder.is_none() && !self.recreate() {
                // Still recovering; this unit cannot be decoded
                self.diagnostics.record_discards(1);
                continue;
            }
            let Some(decoder) = self.decoder.as_mut() else {
                continue;
            };

            match decode_guarded(decoder, &unit) {
                Ok(outputs) => {
                    consecutive_errors = 0;
                    self.diagnostics.record_decoded(outputs.len() as u64);
                    for output in outputs {
                        let tagged = Tagged {
                            generation: self.generation,
                            output,
                        };
                        match self.output.send(tagged) {
                            Ok(SendResult::Sent) => {}
                            Ok(SendResult::Dropped) => self.diagnostics.record_discards(1),
                            Err(ChannelClosed) => return,
                        }
                    }
                }
                Err(DecodeError::Recoverable(e)) => {
                    consecutive_errors += 1;
                    self.diagnostics.record_decode_error();
                    tracing::debug!("Decode error #{}: {e}", consecutive_errors);
                    if consecutive_errors >= self.max_consecutive_errors {
                        tracing::warn!(
                            "{} consecutive decode errors, recreating {} decoder",
                            consecutive_errors,
                            self.decoder_config.codec
                        );
                        consecutive_errors = 0;
                        self.fail();
                    }
                }
                Err(DecodeError::Fatal(e)) => {
                    consecutive_errors = 0;
                    self.diagnostics.record_decode_error();
                    tracing::warn!(
                        "Fatal {} decoder error: {e}; recreating",
                        self.decoder_config.codec
                    );
                    self.fail();
                }
            }
        }

        tracing::info!("Decode thread exiting (generation {})", self.generation);
    }

    /// Discards the decoder and attempts an immediate replacement.
    fn fail(&mut self) {
        self.decoder = None;
        self.shared
            .transition(self.generation, SupervisorState::Recovering);
        self.recreate();
    }

    /// Creates a replacement decoder from the last-known configuration.
    fn recreate(&mut self) -> bool {
        match self.factory.create(&self.decoder_config) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                self.diagnostics.record_recreation();
                self.shared
                    .transition(self.generation, SupervisorState::Configured);
                tracing::info!("Recreated {} decoder", self.decoder_config.codec);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to recreate {} decoder: {e}; retrying on next unit",
                    self.decoder_config.codec
                );
                false
            }
        }
    }
}

/// Supervises one decoder on a worker thread.
pub struct DecodeSupervisor<F: DecoderFactory> {
    factory: Arc<F>,
    config: SupervisorConfig,
    shared: Arc<SupervisorShared>,
    diagnostics: SubsystemDiagnostics,
    decoder_config: Option<DecoderConfig>,
    worker: Option<DecodeWorker>,
    output_rx: Receiver<Tagged<OutputOf<F>>>,
    output_rx_drain: Receiver<Tagged<OutputOf<F>>>,
    output_tx: Sender<Tagged<OutputOf<F>>>,
}

impl<F: DecoderFactory> DecodeSupervisor<F> {
    pub fn new(factory: F, config: SupervisorConfig, diagnostics: SubsystemDiagnostics) -> Self {
        let (output_tx, output_rx) = crossbeam_channel::bounded(config.output_capacity.max(1));
        Self {
            factory: Arc::new(factory),
            config,
            shared: Arc::new(SupervisorShared {
                state: Mutex::new(SupervisorState::Unconfigured),
                generation: AtomicU64::new(0),
            }),
            diagnostics,
            decoder_config: None,
            worker: None,
            output_rx_drain: output_rx.clone(),
            output_rx,
            output_tx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.lock()
    }

    /// Current configuration generation. Bumped by every configure, reset
    /// and close.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Last configuration applied.
    pub fn decoder_config(&self) -> Option<&DecoderConfig> {
        self.decoder_config.as_ref()
    }

    pub fn diagnostics(&self) -> &SubsystemDiagnostics {
        &self.diagnostics
    }

    /// Applies a decoder configuration.
    ///
    /// Any running worker is torn down first and its queued output is
    /// discarded. The decoder is created on the calling thread so creation
    /// errors surface here.
    pub fn configure(&mut self, decoder_config: DecoderConfig) -> Result<(), SupervisorError> {
        if self.state() == SupervisorState::Closed {
            return Err(SupervisorError::Closed);
        }
        let generation = self.teardown(SupervisorState::Unconfigured);
        self.decoder_config = None;

        let decoder = self
            .factory
            .create(&decoder_config)
            .map_err(|source| SupervisorError::Create {
                codec: decoder_config.codec.clone(),
                source,
            })?;

        let (input, input_rx) = LiveEdgeSender::bounded(self.config.input_capacity);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let context = WorkerContext::<F> {
            factory: self.factory.clone(),
            decoder_config: decoder_config.clone(),
            decoder: Some(decoder),
            generation,
            shared: self.shared.clone(),
            diagnostics: self.diagnostics.clone(),
            input: input_rx,
            output: LiveEdgeSender::new(self.output_tx.clone(), self.output_rx_drain.clone()),
            stop_flag: stop_flag.clone(),
            poll_interval: self.config.poll_interval,
            max_consecutive_errors: self.config.max_consecutive_errors.max(1),
        };

        let handle = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || context.run())?;

        self.worker = Some(DecodeWorker {
            input,
            handle: Some(handle),
            stop_flag,
        });
        self.shared
            .transition(generation, SupervisorState::Configured);
        tracing::info!(
            "Decoder configured: {} (generation {})",
            decoder_config.codec,
            generation
        );
        self.decoder_config = Some(decoder_config);
        Ok(())
    }

    /// Queues a unit for decoding. Never blocks; when the input queue is
    /// full the oldest queued unit is dropped.
    pub fn submit(&self, unit: EncodedUnit) -> Result<SendResult, SupervisorError> {
        match self.state() {
            SupervisorState::Closed => return Err(SupervisorError::Closed),
            SupervisorState::Unconfigured => return Err(SupervisorError::NotConfigured),
            SupervisorState::Configured | SupervisorState::Recovering => {}
        }
        let worker = self.worker.as_ref().ok_or(SupervisorError::NotConfigured)?;
        if worker.is_finished() {
            return Err(SupervisorError::WorkerGone);
        }
        self.diagnostics.record_submitted();
        match worker.input.send(unit) {
            Ok(SendResult::Sent) => Ok(SendResult::Sent),
            Ok(SendResult::Dropped) => {
                self.diagnostics.record_discards(1);
                Ok(SendResult::Dropped)
            }
            Err(ChannelClosed) => Err(SupervisorError::WorkerGone),
        }
    }

    /// Returns the next output of the current generation, if any.
    ///
    /// Outputs from torn-down generations are dropped and counted as stale.
    pub fn poll_output(&self) -> Option<OutputOf<F>> {
        while let Ok(tagged) = self.output_rx.try_recv() {
            if let Some(output) = self.accept(tagged) {
                return Some(output);
            }
        }
        None
    }

    /// Waits up to `timeout` for the next output of the current generation.
    pub fn wait_output(&self, timeout: Duration) -> Option<OutputOf<F>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.output_rx.recv_timeout(remaining) {
                Ok(tagged) => {
                    if let Some(output) = self.accept(tagged) {
                        return Some(output);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    fn accept(&self, tagged: Tagged<OutputOf<F>>) -> Option<OutputOf<F>> {
        if tagged.generation == self.generation() {
            Some(tagged.output)
        } else {
            self.diagnostics.record_stale_output();
            tracing::trace!(
                "Dropping stale decoder output (generation {})",
                tagged.generation
            );
            None
        }
    }

    /// Restarts decoding from the current configuration.
    ///
    /// Queued input is dropped and any output not yet polled becomes stale,
    /// so nothing submitted before the restart is ever returned after it.
    pub fn restart(&mut self) -> Result<(), SupervisorError> {
        let Some(decoder_config) = self.decoder_config.clone() else {
            return Err(SupervisorError::NotConfigured);
        };
        self.configure(decoder_config)
    }

    /// Stops decoding and forgets the configuration.
    pub fn reset(&mut self) {
        if self.state() == SupervisorState::Closed {
            return;
        }
        self.teardown(SupervisorState::Unconfigured);
        self.decoder_config = None;
        tracing::debug!("Decode supervisor reset");
    }

    /// Stops decoding for good.
    pub fn close(&mut self) {
        self.teardown(SupervisorState::Closed);
        self.decoder_config = None;
        tracing::debug!("Decode supervisor closed");
    }

    /// Joins the worker, bumps the generation, drops queued output and sets
    /// `state`. Returns the new generation.
    fn teardown(&mut self, state: SupervisorState) -> u64 {
        let generation = {
            let mut current = self.shared.state.lock();
            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *current = state;
            generation
        };
        // Dropping the worker signals stop and joins
        self.worker = None;
        while let Ok(tagged) = self.output_rx.try_recv() {
            if tagged.generation != generation {
                self.diagnostics.record_stale_output();
            }
        }
        generation
    }
}

impl<F: DecoderFactory> Drop for DecodeSupervisor<F> {
    fn drop(&mut self) {
        self.worker = None;
    }
}
