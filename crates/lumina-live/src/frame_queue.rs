//! Frame queue for live video playout.
//!
//! A bounded ring of decoded frames shared between the decode side (which
//! appends) and the render clock (which asks for "the frame to show at time
//! T"). Frames are dropped exactly once: when evicted at capacity, when
//! skipped over by a timestamp lookup, or on [`VideoFrameQueue::clear`]. The
//! frame returned by a lookup is moved to the caller, which drops it when it
//! selects the next one.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

/// Default capacity: 1.5s at 60fps.
pub const DEFAULT_VIDEO_QUEUE_CAPACITY: usize = 90;

/// A decoded unit with a presentation time.
pub trait TimedFrame {
    /// Presentation timestamp in microseconds.
    fn pts_us(&self) -> u64;
    /// Display duration in microseconds.
    fn duration_us(&self) -> u64;
}

/// A decoded video frame as emitted by the video decoder.
#[derive(Clone)]
pub struct DecodedVideoFrame {
    /// Presentation timestamp in microseconds
    pub pts_us: u64,
    /// Display duration in microseconds
    pub duration_us: u64,
    pub width: u32,
    pub height: u32,
    /// Decoded pixel data (layout owned by the renderer)
    pub data: Bytes,
}

impl TimedFrame for DecodedVideoFrame {
    fn pts_us(&self) -> u64 {
        self.pts_us
    }

    fn duration_us(&self) -> u64 {
        self.duration_us
    }
}

impl std::fmt::Debug for DecodedVideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedVideoFrame")
            .field("pts_us", &self.pts_us)
            .field("duration_us", &self.duration_us)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Configuration for the video frame queue.
#[derive(Debug, Clone)]
pub struct VideoQueueConfig {
    /// Maximum number of resident frames.
    pub capacity: usize,
}

impl VideoQueueConfig {
    /// Sizes the queue to hold `buffer_ms` of video at `fps`.
    pub fn for_frame_rate(fps: f32, buffer_ms: u32) -> Self {
        let frames = (fps.max(1.0) * buffer_ms as f32 / 1000.0).ceil() as usize;
        Self {
            capacity: frames.max(1),
        }
    }
}

impl Default for VideoQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_VIDEO_QUEUE_CAPACITY,
        }
    }
}

/// Result of [`VideoFrameQueue::get_frame_by_timestamp`].
#[derive(Debug)]
pub struct FrameLookup<F> {
    /// Latest frame with `pts <= query`, if any.
    pub frame: Option<F>,
    /// Frames skipped over (and dropped) by this lookup.
    pub discarded_this_call: usize,
    /// Frames dropped by eviction or lookups since creation or last reset.
    pub total_discarded: u64,
    /// Frames still resident after the lookup.
    pub queue_size: usize,
    /// Time span covered by the resident frames.
    pub queue_length_ms: f64,
}

struct FrameRing<F> {
    frames: VecDeque<F>,
    total_discarded: u64,
}

impl<F: TimedFrame> FrameRing<F> {
    fn length_ms(&self) -> f64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => {
                let end = last.pts_us() + last.duration_us();
                end.saturating_sub(first.pts_us()) as f64 / 1000.0
            }
            _ => 0.0,
        }
    }
}

/// A thread-safe, fixed-capacity ring of decoded video frames ordered by
/// presentation time.
///
/// Frames are expected in non-decreasing pts order. Discontinuities are the
/// caller's job: call [`clear`](Self::clear) when the timeline restarts.
pub struct VideoFrameQueue<F> {
    ring: Mutex<FrameRing<F>>,
    capacity: usize,
}

impl<F: TimedFrame> VideoFrameQueue<F> {
    /// Creates a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(FrameRing {
                frames: VecDeque::with_capacity(capacity),
                total_discarded: 0,
            }),
            capacity,
        }
    }

    pub fn with_config(config: &VideoQueueConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Appends a frame, evicting the oldest one if the queue is full.
    ///
    /// Returns true if a frame was evicted.
    pub fn add_frame(&self, frame: F) -> bool {
        let mut ring = self.ring.lock();
        let evicted = if ring.frames.len() >= self.capacity {
            let oldest = ring.frames.pop_front();
            ring.total_discarded += 1;
            tracing::trace!(
                "VideoFrameQueue: evicted frame pts={:?}",
                oldest.as_ref().map(|f| f.pts_us())
            );
            true
        } else {
            false
        };
        ring.frames.push_back(frame);
        evicted
    }

    /// Takes the latest frame whose pts is at or before `query_us`.
    ///
    /// Every earlier frame is dropped and counted as discarded. Frames after
    /// `query_us` stay resident.
    pub fn get_frame_by_timestamp(&self, query_us: u64) -> FrameLookup<F> {
        let mut ring = self.ring.lock();
        // Number of frames with pts <= query
        let eligible = ring.frames.partition_point(|f| f.pts_us() <= query_us);

        let (frame, discarded) = if eligible == 0 {
            (None, 0)
        } else {
            let skipped = eligible - 1;
            ring.frames.drain(..skipped);
            ring.total_discarded += skipped as u64;
            (ring.frames.pop_front(), skipped)
        };

        if discarded > 0 {
            tracing::trace!(
                "VideoFrameQueue: skipped {} late frame(s) for t={}us",
                discarded,
                query_us
            );
        }

        FrameLookup {
            frame,
            discarded_this_call: discarded,
            total_discarded: ring.total_discarded,
            queue_size: ring.frames.len(),
            queue_length_ms: ring.length_ms(),
        }
    }

    /// Drops every resident frame. Returns how many were dropped.
    ///
    /// The discard counter is left alone: a clear is a deliberate flush, not
    /// a loss.
    pub fn clear(&self) -> usize {
        let mut ring = self.ring.lock();
        let count = ring.frames.len();
        ring.frames.clear();
        tracing::debug!("VideoFrameQueue::clear: dropped {} frames", count);
        count
    }

    /// Drops every frame and zeroes the discard counter.
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.frames.clear();
        ring.total_discarded = 0;
    }

    /// Returns the pts of the oldest resident frame.
    pub fn peek_pts(&self) -> Option<u64> {
        self.ring.lock().frames.front().map(|f| f.pts_us())
    }

    pub fn len(&self) -> usize {
        self.ring.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_discarded(&self) -> u64 {
        self.ring.lock().total_discarded
    }

    /// Time span covered by the resident frames, in milliseconds.
    pub fn queue_length_ms(&self) -> f64 {
        self.ring.lock().length_ms()
    }
}

impl<F: TimedFrame> Default for VideoFrameQueue<F> {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_QUEUE_CAPACITY)
    }
}
