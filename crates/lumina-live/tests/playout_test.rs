//! Presentation-path integration tests: video frame selection and audio
//! playout driven through the public API, the way a renderer and an audio
//! output callback would.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use lumina_live::audio_playout::{audio_playout, DecodedAudioBlock, PlayoutConfig};
use lumina_live::diagnostics::{Subsystem, SubsystemDiagnostics, TimestampStep};
use lumina_live::frame_queue::{DecodedVideoFrame, VideoFrameQueue};

fn frame(pts_us: u64) -> DecodedVideoFrame {
    DecodedVideoFrame {
        pts_us,
        duration_us: 10,
        width: 2,
        height: 2,
        data: Bytes::from_static(&[0; 16]),
    }
}

#[test]
fn test_queue_evicts_oldest_past_capacity() {
    let capacity = 90;
    let extra = 7;
    let queue = VideoFrameQueue::new(capacity);
    for i in 0..(capacity + extra) as u64 {
        queue.add_frame(frame(i * 33_333));
    }
    assert_eq!(queue.len(), capacity);
    assert_eq!(queue.total_discarded(), extra as u64);
    assert_eq!(queue.peek_pts(), Some(extra as u64 * 33_333));
}

#[test]
fn test_query_between_frames() {
    let queue = VideoFrameQueue::new(8);
    for pts in [10, 20, 30] {
        queue.add_frame(frame(pts));
    }

    let lookup = queue.get_frame_by_timestamp(25);
    assert_eq!(lookup.frame.map(|f| f.pts_us), Some(20));
    assert_eq!(lookup.discarded_this_call, 1);
    assert_eq!(lookup.total_discarded, 1);
    assert_eq!(lookup.queue_size, 1);
    assert_eq!(queue.peek_pts(), Some(30));

    // Before the oldest frame: nothing shown, nothing dropped
    let early = queue.get_frame_by_timestamp(5);
    assert!(early.frame.is_none());
    assert_eq!(early.discarded_this_call, 0);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_renderer_and_decoder_threads() {
    let queue = Arc::new(VideoFrameQueue::new(16));
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..500u64 {
                queue.add_frame(frame(i * 1_000));
            }
        })
    };

    let mut last_shown = None;
    for clock in (0..500_000u64).step_by(7_000) {
        if let Some(shown) = queue.get_frame_by_timestamp(clock).frame {
            assert!(shown.pts_us <= clock);
            if let Some(prev) = last_shown {
                assert!(shown.pts_us > prev);
            }
            last_shown = Some(shown.pts_us);
        }
    }
    producer.join().unwrap();
    assert!(queue.len() <= 16);
}

fn playout_config() -> PlayoutConfig {
    let mut config = PlayoutConfig::for_format(48_000, 2);
    config.drift_trim_threshold = None;
    config
}

fn block(timestamp_us: i64, frames: usize, value: f32) -> DecodedAudioBlock {
    DecodedAudioBlock {
        timestamp_us,
        sample_rate: 48_000,
        channels: 2,
        samples: vec![value; frames * 2],
    }
}

#[test]
fn test_empty_pull_yields_requested_silence() {
    let diag = SubsystemDiagnostics::new(Subsystem::Audio);
    let (_producer, mut consumer) = audio_playout(&playout_config(), diag.clone());

    for pull in 1..=3u64 {
        let mut out = vec![0.25f32; 960];
        let outcome = consumer.pull(&mut out);
        assert_eq!(outcome.samples_read, 0);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(diag.snapshot().underruns, pull);
    }
}

#[test]
fn test_epoch_reset_sequence() {
    let diag = SubsystemDiagnostics::new(Subsystem::Audio);
    let (mut producer, mut consumer) = audio_playout(&playout_config(), diag.clone());
    let mut out = vec![0.0f32; 960];

    let base = 40_000_000;
    assert_eq!(producer.observe_input_timestamp(base), TimestampStep::First);
    producer.write_block(&block(base, 24_000, 0.1)).unwrap();
    assert_eq!(
        producer.observe_input_timestamp(base - 100_000),
        TimestampStep::Normal
    );
    producer.write_block(&block(base - 100_000, 24_000, 0.1)).unwrap();
    consumer.pull(&mut out);
    assert_eq!(consumer.position_us(), Some(base + 10_000));

    let restarted = base - 100_000 - 30_000_001;
    assert_eq!(
        producer.observe_input_timestamp(restarted),
        TimestampStep::Wrap
    );
    assert_eq!(producer.buffered_ms(), 0.0);

    // Anchor comes from the next decoded block, not from the wrapped input
    producer.write_block(&block(restarted + 5_000, 24_000, 0.2)).unwrap();
    let outcome = consumer.pull(&mut out);
    assert!(outcome.flushed);
    assert!(out.iter().all(|&s| s == 0.2));
    assert_eq!(consumer.position_us(), Some(restarted + 5_000 + 10_000));

    producer.observe_input_timestamp(restarted + 21_333);
    let snap = diag.snapshot();
    assert_eq!(snap.epoch_resets, 1);
    assert_eq!(snap.input_wraps, 1);
    assert_eq!(producer.metrics().epoch_resets, 1);
}

#[test]
fn test_output_callback_thread() {
    let diag = SubsystemDiagnostics::new(Subsystem::Audio);
    let (mut producer, mut consumer) = audio_playout(&playout_config(), diag.clone());

    let output = thread::spawn(move || {
        let mut out = vec![0.0f32; 960];
        let mut heard = 0usize;
        for _ in 0..200 {
            heard += consumer.pull(&mut out).samples_read;
            thread::sleep(Duration::from_millis(1));
        }
        heard
    });

    for i in 0..100 {
        producer
            .write_block(&block(i * 10_000, 480, 0.5))
            .unwrap();
        thread::sleep(Duration::from_micros(500));
    }
    let heard = output.join().unwrap();
    assert!(heard <= 100 * 960);
    assert_eq!(diag.snapshot().callback_count, 200);
}
