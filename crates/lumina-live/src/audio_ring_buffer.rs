//! Lock-free SPSC ring buffer for live audio playout.
//!
//! The decode side writes interleaved PCM; the real-time output callback
//! pulls whole slices. Only the producer modifies `write_pos`, only the
//! consumer modifies `read_pos`. On overflow the producer overwrites old data
//! and the consumer detects the lap and catches up.
//!
//! Flushes are generation-based: the producer records the write position at
//! the flush (`flush_pos`) and bumps `flush_generation`. The consumer snaps
//! to `flush_pos` and publishes the generation it acknowledged, so either
//! side can compute the fill level at any moment.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for the audio ring buffer.
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Total capacity in samples (interleaved). Rounded up to a power of two.
    pub capacity_samples: usize,
    /// Samples that must be buffered before playback (re)starts.
    pub prefill_samples: usize,
    /// Fill level above which the consumer skips forward to the prefill
    /// level. `None` disables drift trimming.
    pub trim_samples: Option<usize>,
    /// Interleaved channel count. Skips stay aligned to whole frames.
    pub channels: usize,
}

impl RingBufferConfig {
    /// Creates config for the given audio format with live-playout timing:
    /// 4s of storage, 300ms prefill, trim above 1s.
    pub fn for_format(sample_rate: u32, channels: u16) -> Self {
        let samples_per_sec = sample_rate as usize * channels as usize;
        Self {
            capacity_samples: samples_per_sec * 4,
            prefill_samples: samples_per_sec * 3 / 10,
            trim_samples: Some(samples_per_sec),
            channels: channels.max(1) as usize,
        }
    }
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self::for_format(48000, 2)
    }
}

/// Shared state between producer and consumer.
struct RingBufferShared {
    /// Atomic sample slots (f32 stored as bits) avoid read/write data races.
    buffer: Box<[AtomicU32]>,
    /// Monotonic write position, masked for indexing. Producer-owned.
    write_pos: AtomicUsize,
    /// Monotonic read position, masked for indexing. Consumer-owned.
    read_pos: AtomicUsize,
    mask: usize,
    capacity: usize,
    channels: usize,
    /// Whether the buffer has reached the prefill threshold since the last flush.
    prefilled: AtomicBool,
    prefill_threshold: usize,
    trim_threshold: Option<usize>,
    /// Incremented by the producer on every flush.
    flush_generation: AtomicU64,
    /// Write position at the most recent flush.
    flush_pos: AtomicUsize,
    /// Last flush generation the consumer applied.
    acked_generation: AtomicU64,
    total_written: AtomicU64,
    total_read: AtomicU64,
    overflow_count: AtomicU64,
    underrun_count: AtomicU64,
    drift_trim_count: AtomicU64,
    alive: AtomicBool,
}

impl RingBufferShared {
    /// Read position as seen from either side: `flush_pos` while a flush is
    /// not yet acknowledged.
    fn effective_read_pos(&self) -> usize {
        let gen = self.flush_generation.load(Ordering::Acquire);
        let acked = self.acked_generation.load(Ordering::Acquire);
        if gen == acked {
            self.read_pos.load(Ordering::Acquire)
        } else {
            self.flush_pos.load(Ordering::Acquire)
        }
    }

    fn fill(&self) -> usize {
        let rp = self.effective_read_pos();
        let wp = self.write_pos.load(Ordering::Acquire);
        wp.wrapping_sub(rp).min(self.capacity)
    }

    fn align(&self, samples: usize) -> usize {
        samples - samples % self.channels
    }

    fn metrics(&self) -> RingBufferMetrics {
        RingBufferMetrics {
            fill_samples: self.fill(),
            capacity_samples: self.capacity,
            total_written: self.total_written.load(Ordering::Relaxed),
            total_read: self.total_read.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            drift_trim_count: self.drift_trim_count.load(Ordering::Relaxed),
            producer_alive: self.alive.load(Ordering::Relaxed),
        }
    }
}

/// Result of a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Real samples copied to the front of the output slice.
    pub samples_read: usize,
    /// A flush was applied before reading; everything read is post-flush.
    pub flushed: bool,
    /// The read counted as an underrun.
    pub underrun: bool,
    /// The consumer skipped forward to shed excess latency.
    pub trimmed: bool,
    /// Samples passed over without being played (lap skip or drift trim).
    pub samples_skipped: usize,
}

/// Producer half of the ring buffer. Owned by the audio decode side.
pub struct RingBufferProducer {
    shared: Arc<RingBufferShared>,
}

/// Consumer half of the ring buffer. Owned by the audio output callback.
pub struct RingBufferConsumer {
    shared: Arc<RingBufferShared>,
    /// Tracks the last observed flush generation.
    consumer_generation: u64,
}

/// Metrics snapshot for observability.
#[derive(Debug, Clone, Default)]
pub struct RingBufferMetrics {
    pub fill_samples: usize,
    pub capacity_samples: usize,
    pub total_written: u64,
    pub total_read: u64,
    /// Writes that overtook the consumer.
    pub overflow_count: u64,
    /// Reads that came up empty or short.
    pub underrun_count: u64,
    /// Forward skips taken to shed excess latency.
    pub drift_trim_count: u64,
    pub producer_alive: bool,
}

/// Creates a new ring buffer split into producer and consumer halves.
pub fn audio_ring_buffer(config: &RingBufferConfig) -> (RingBufferProducer, RingBufferConsumer) {
    let channels = config.channels.max(1);
    // Round capacity up to power-of-2 for fast masking (avoids modulo)
    let capacity = config.capacity_samples.max(1024).next_power_of_two();
    let prefill_threshold = config.prefill_samples.min(capacity / 2);
    let prefill_threshold = prefill_threshold - prefill_threshold % channels;

    let shared = Arc::new(RingBufferShared {
        buffer: (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        mask: capacity - 1,
        capacity,
        channels,
        prefilled: AtomicBool::new(prefill_threshold == 0),
        prefill_threshold,
        trim_threshold: config
            .trim_samples
            .map(|t| t.max(prefill_threshold + channels).min(capacity)),
        flush_generation: AtomicU64::new(0),
        flush_pos: AtomicUsize::new(0),
        acked_generation: AtomicU64::new(0),
        total_written: AtomicU64::new(0),
        total_read: AtomicU64::new(0),
        overflow_count: AtomicU64::new(0),
        underrun_count: AtomicU64::new(0),
        drift_trim_count: AtomicU64::new(0),
        alive: AtomicBool::new(true),
    });

    (
        RingBufferProducer {
            shared: shared.clone(),
        },
        RingBufferConsumer {
            shared,
            consumer_generation: 0,
        },
    )
}

impl RingBufferProducer {
    /// Discards everything buffered so far.
    ///
    /// The consumer snaps to the current write position on its next read.
    /// Prefill is re-armed so new data must accumulate before playback
    /// resumes.
    pub fn request_flush(&self) {
        let s = &self.shared;
        let wp = s.write_pos.load(Ordering::Relaxed);
        s.flush_pos.store(wp, Ordering::Relaxed);
        s.prefilled.store(s.prefill_threshold == 0, Ordering::Relaxed);
        // Generation increment is the Release point for flush_pos and prefilled
        let gen = s.flush_generation.fetch_add(1, Ordering::Release) + 1;
        tracing::debug!("Ring buffer flush requested (generation {})", gen);
    }

    /// Zeroes the throughput and event counters.
    pub fn reset_counters(&self) {
        let s = &self.shared;
        s.total_written.store(0, Ordering::Relaxed);
        s.total_read.store(0, Ordering::Relaxed);
        s.overflow_count.store(0, Ordering::Relaxed);
        s.underrun_count.store(0, Ordering::Relaxed);
        s.drift_trim_count.store(0, Ordering::Relaxed);
    }

    /// Writes samples into the ring buffer.
    ///
    /// Always succeeds. If the buffer is full, old data is overwritten and
    /// the consumer catches up. The producer never touches `read_pos`.
    pub fn write(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let s = &self.shared;
        let len = samples.len();
        let wp = s.write_pos.load(Ordering::Relaxed);
        let rp = s.effective_read_pos();

        if wp.wrapping_add(len).wrapping_sub(rp) > s.capacity {
            s.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut idx = wp & s.mask;
        for &sample in samples {
            s.buffer[idx].store(sample.to_bits(), Ordering::Relaxed);
            idx = (idx + 1) & s.mask;
        }

        // Advance write position (makes samples visible to consumer)
        s.write_pos.store(wp.wrapping_add(len), Ordering::Release);
        s.total_written.fetch_add(len as u64, Ordering::Relaxed);

        if !s.prefilled.load(Ordering::Relaxed) {
            let fill = s.fill();
            if fill >= s.prefill_threshold {
                s.prefilled.store(true, Ordering::Release);
                tracing::debug!(
                    "Ring buffer prefilled: {} samples (threshold: {})",
                    fill,
                    s.prefill_threshold
                );
            }
        }
    }

    /// Current flush generation.
    pub fn generation(&self) -> u64 {
        self.shared.flush_generation.load(Ordering::Relaxed)
    }

    /// Whether the consumer has applied every requested flush.
    pub fn flush_acknowledged(&self) -> bool {
        let s = &self.shared;
        s.acked_generation.load(Ordering::Acquire) == s.flush_generation.load(Ordering::Relaxed)
    }

    pub fn fill_samples(&self) -> usize {
        self.shared.fill()
    }

    pub fn metrics(&self) -> RingBufferMetrics {
        self.shared.metrics()
    }
}

impl Drop for RingBufferProducer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

impl RingBufferConsumer {
    /// Fills `out` with buffered samples, then silence.
    ///
    /// Never blocks and never mixes samples from before and after a flush:
    /// the flush generation is re-checked after loading the write position.
    /// A read counts as an underrun when the buffer is empty, or when
    /// playback is running and fewer samples than requested were available.
    pub fn read(&mut self, out: &mut [f32]) -> ReadOutcome {
        let s = &self.shared;
        let mut outcome = ReadOutcome::default();

        let wp = loop {
            let gen = s.flush_generation.load(Ordering::Acquire);
            if gen != self.consumer_generation {
                let fp = s.flush_pos.load(Ordering::Relaxed);
                s.read_pos.store(fp, Ordering::Release);
                self.consumer_generation = gen;
                s.acked_generation.store(gen, Ordering::Release);
                outcome.flushed = true;
            }
            let wp = s.write_pos.load(Ordering::Acquire);
            if s.flush_generation.load(Ordering::Acquire) == gen {
                break wp;
            }
        };

        let start = s.read_pos.load(Ordering::Relaxed);
        let mut rp = start;
        let fill = wp.wrapping_sub(rp);

        if fill == 0 || !s.prefilled.load(Ordering::Acquire) {
            if fill == 0 {
                s.underrun_count.fetch_add(1, Ordering::Relaxed);
                outcome.underrun = true;
            }
            out.fill(0.0);
            return outcome;
        }

        if fill > s.capacity {
            // Producer lapped us: skip to mid-buffer for some headroom
            rp = wp.wrapping_sub(s.align(s.capacity / 2));
            tracing::trace!("Ring buffer: consumer lapped, skipping {} samples", fill);
        } else if let Some(trim) = s.trim_threshold {
            if fill > trim {
                rp = wp.wrapping_sub(s.prefill_threshold);
                s.drift_trim_count.fetch_add(1, Ordering::Relaxed);
                outcome.trimmed = true;
                tracing::debug!(
                    "Ring buffer: trimmed {} samples of excess latency",
                    fill - s.prefill_threshold
                );
            }
        }

        outcome.samples_skipped = rp.wrapping_sub(start);
        let available = wp.wrapping_sub(rp);
        let n = s.align(available.min(out.len()));
        let mut idx = rp & s.mask;
        for slot in &mut out[..n] {
            *slot = f32::from_bits(s.buffer[idx].load(Ordering::Relaxed));
            idx = (idx + 1) & s.mask;
        }
        out[n..].fill(0.0);

        s.read_pos.store(rp.wrapping_add(n), Ordering::Release);
        s.total_read.fetch_add(n as u64, Ordering::Relaxed);

        if n < out.len() {
            s.underrun_count.fetch_add(1, Ordering::Relaxed);
            outcome.underrun = true;
        }
        outcome.samples_read = n;
        outcome
    }

    /// Flush generation this consumer has applied.
    pub fn generation(&self) -> u64 {
        self.consumer_generation
    }

    pub fn fill_samples(&self) -> usize {
        self.shared.fill()
    }

    pub fn metrics(&self) -> RingBufferMetrics {
        self.shared.metrics()
    }

    /// Returns whether the producer is still alive.
    pub fn is_producer_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefill_samples: usize) -> RingBufferConfig {
        RingBufferConfig {
            capacity_samples: 1024,
            prefill_samples,
            trim_samples: None,
            channels: 1,
        }
    }

    fn read_n(consumer: &mut RingBufferConsumer, n: usize) -> (Vec<f32>, ReadOutcome) {
        let mut out = vec![f32::NAN; n];
        let outcome = consumer.read(&mut out);
        (out, outcome)
    }

    #[test]
    fn test_basic_write_read() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let (out, outcome) = read_n(&mut consumer, 3);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        assert_eq!(outcome.samples_read, 3);
        assert!(!outcome.underrun);

        // Short read pads with silence and counts one underrun
        let (out, outcome) = read_n(&mut consumer, 4);
        assert_eq!(out, vec![4.0, 5.0, 0.0, 0.0]);
        assert!(outcome.underrun);
        assert_eq!(consumer.metrics().underrun_count, 1);

        // No re-prefill after running dry
        producer.write(&[6.0, 7.0]);
        let (out, _) = read_n(&mut consumer, 2);
        assert_eq!(out, vec![6.0, 7.0]);
    }

    #[test]
    fn test_prefill_gate() {
        let (producer, mut consumer) = audio_ring_buffer(&config(10));
        producer.write(&[1.0, 2.0, 3.0]);

        // Below threshold: silence, but not an underrun (buffer isn't empty)
        let (out, outcome) = read_n(&mut consumer, 2);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!(!outcome.underrun);
        assert_eq!(consumer.fill_samples(), 3);

        producer.write(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        let (out, _) = read_n(&mut consumer, 2);
        assert_eq!(out, vec![1.0, 2.0]);
    }

    #[test]
    fn test_empty_read_counts_underrun_per_read() {
        let (_producer, mut consumer) = audio_ring_buffer(&config(4));
        for _ in 0..3 {
            let (out, outcome) = read_n(&mut consumer, 256);
            assert_eq!(out.len(), 256);
            assert!(out.iter().all(|&s| s == 0.0));
            assert!(outcome.underrun);
        }
        assert_eq!(consumer.metrics().underrun_count, 3);
    }

    #[test]
    fn test_overflow_and_lap_skip() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        producer.write(&(0..10).map(|i| i as f32).collect::<Vec<_>>());
        read_n(&mut consumer, 2);

        // Lap the consumer
        let big: Vec<f32> = (0..2048).map(|i| (100 + i) as f32).collect();
        producer.write(&big);
        assert!(producer.metrics().overflow_count > 0);

        // Consumer lands on the newest half of the buffer
        let (out, outcome) = read_n(&mut consumer, 1);
        assert_eq!(outcome.samples_read, 1);
        assert_eq!(out[0], (100 + 2048 - 512) as f32);
        // Everything between the old read position and the landing point
        assert_eq!(outcome.samples_skipped, 8 + 2048 - 512);
    }

    #[test]
    fn test_wraparound() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        for round in 0..300 {
            let base = round as f32 * 4.0;
            producer.write(&[base, base + 1.0, base + 2.0, base + 3.0]);
            let (out, _) = read_n(&mut consumer, 4);
            assert_eq!(out, vec![base, base + 1.0, base + 2.0, base + 3.0]);
        }
    }

    #[test]
    fn test_flush_discards_and_rearms_prefill() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        read_n(&mut consumer, 2);

        producer.request_flush();
        assert!(!producer.flush_acknowledged());
        // Buffered level is computable before the consumer notices
        assert_eq!(producer.fill_samples(), 0);

        producer.write(&[10.0, 11.0]);
        let (out, outcome) = read_n(&mut consumer, 2);
        assert!(outcome.flushed);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!(producer.flush_acknowledged());

        producer.write(&[12.0, 13.0]);
        let (out, outcome) = read_n(&mut consumer, 4);
        assert!(!outcome.flushed);
        assert_eq!(out, vec![10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_multiple_rapid_flushes() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        producer.write(&[1.0, 2.0, 3.0, 4.0]);
        read_n(&mut consumer, 1);

        producer.request_flush();
        producer.request_flush();
        producer.request_flush();

        let (_, outcome) = read_n(&mut consumer, 1);
        assert!(outcome.flushed);
        assert_eq!(consumer.generation(), 3);
        let (_, outcome) = read_n(&mut consumer, 1);
        assert!(!outcome.flushed);

        producer.write(&[50.0, 51.0, 52.0, 53.0]);
        let (out, _) = read_n(&mut consumer, 1);
        assert_eq!(out, vec![50.0]);
    }

    #[test]
    fn test_drift_trim() {
        let cfg = RingBufferConfig {
            capacity_samples: 1024,
            prefill_samples: 8,
            trim_samples: Some(64),
            channels: 2,
        };
        let (producer, mut consumer) = audio_ring_buffer(&cfg);
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        producer.write(&data);

        let (out, outcome) = read_n(&mut consumer, 2);
        assert!(outcome.trimmed);
        // Skipped forward to leave exactly the prefill level
        assert_eq!(out, vec![92.0, 93.0]);
        assert_eq!(outcome.samples_skipped, 92);
        assert_eq!(consumer.metrics().drift_trim_count, 1);

        let (_, outcome) = read_n(&mut consumer, 2);
        assert!(!outcome.trimmed);
        assert_eq!(outcome.samples_skipped, 0);
    }

    #[test]
    fn test_metrics_and_reset_counters() {
        let (producer, mut consumer) = audio_ring_buffer(&config(4));
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        read_n(&mut consumer, 2);

        let m = consumer.metrics();
        assert_eq!(m.total_written, 5);
        assert_eq!(m.total_read, 2);
        assert_eq!(m.fill_samples, 3);

        producer.reset_counters();
        let m = producer.metrics();
        assert_eq!(m.total_written, 0);
        assert_eq!(m.total_read, 0);
        assert_eq!(m.fill_samples, 3);
    }

    #[test]
    fn test_producer_drop_signals_dead() {
        let (producer, mut consumer) = audio_ring_buffer(&config(2));
        producer.write(&[1.0, 2.0, 3.0]);
        assert!(consumer.is_producer_alive());
        drop(producer);
        assert!(!consumer.is_producer_alive());
        let (out, _) = read_n(&mut consumer, 1);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn test_concurrent_write_read_with_flushes() {
        use std::thread;

        let cfg = RingBufferConfig {
            capacity_samples: 4096,
            prefill_samples: 64,
            trim_samples: None,
            channels: 1,
        };
        let (producer, consumer) = audio_ring_buffer(&cfg);

        // Each epoch writes values tagged by epoch; a single read must never
        // contain two different epochs.
        let writer = thread::spawn(move || {
            for epoch in 0..20u32 {
                for i in 0..500u32 {
                    producer.write(&[(epoch * 10_000 + i) as f32]);
                    if i % 50 == 0 {
                        thread::yield_now();
                    }
                }
                producer.request_flush();
            }
        });

        let reader = thread::spawn(move || {
            let mut consumer = consumer;
            let mut out = [0.0f32; 32];
            loop {
                let outcome = consumer.read(&mut out);
                let epochs: Vec<u32> = out[..outcome.samples_read]
                    .iter()
                    .map(|&s| s as u32 / 10_000)
                    .collect();
                assert!(epochs.windows(2).all(|w| w[0] == w[1]));
                assert!(out[..outcome.samples_read].windows(2).all(|w| w[1] > w[0]));
                if outcome.samples_read == 0 && !consumer.is_producer_alive() {
                    break;
                }
                thread::yield_now();
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
