// Playback scheduling under irregular arrival
//
// A manual device clock stands in for the speaker so that arrival jitter,
// pump timing and flushes can be driven deterministically.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duplex_voice::audio::codec;
use duplex_voice::error::DeviceError;
use duplex_voice::playback::{PlaybackCounters, PlaybackScheduler};
use duplex_voice::OutputDevice;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Default)]
struct Timeline {
    now: Duration,
    /// (start, samples, device time at scheduling)
    scheduled: Vec<(Duration, usize, Duration)>,
    stops: usize,
    closed: bool,
}

struct ManualClockOutput(Arc<Mutex<Timeline>>);

impl OutputDevice for ManualClockOutput {
    fn now(&self) -> Duration {
        self.0.lock().unwrap().now
    }

    fn schedule(&mut self, samples: &[f32], start_at: Duration) -> Result<(), DeviceError> {
        let mut timeline = self.0.lock().unwrap();
        let now = timeline.now;
        timeline.scheduled.push((start_at, samples.len(), now));
        Ok(())
    }

    fn stop_all(&mut self) {
        self.0.lock().unwrap().stops += 1;
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.0.lock().unwrap().closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "manual clock"
    }
}

fn scheduler(lookahead: usize) -> (PlaybackScheduler, Arc<Mutex<Timeline>>, Arc<PlaybackCounters>) {
    let timeline = Arc::new(Mutex::new(Timeline::default()));
    let counters = Arc::new(PlaybackCounters::default());
    let mut scheduler = PlaybackScheduler::new(lookahead, Arc::clone(&counters));
    scheduler.attach(Box::new(ManualClockOutput(Arc::clone(&timeline))));
    (scheduler, timeline, counters)
}

/// PCM16 bytes whose sample count encodes the chunk's arrival index
fn chunk(index: usize) -> Vec<u8> {
    codec::pcm16_to_bytes(&vec![1000i16; 240 * (index + 1)])
}

fn samples_to_duration(samples: usize) -> Duration {
    Duration::from_micros(samples as u64 * 1_000_000 / 24_000)
}

#[test]
fn test_chunks_play_in_arrival_order_without_overlap() {
    for seed in 1..=20u64 {
        let (mut scheduler, timeline, _counters) = scheduler(2);
        let mut rng = StdRng::seed_from_u64(seed);

        for index in 0..12 {
            // Irregular gaps, sometimes longer than the audio already queued
            let gap = Duration::from_millis(rng.gen_range(0..120));
            timeline.lock().unwrap().now += gap;
            scheduler.pump();
            scheduler.enqueue(&chunk(index)).unwrap();
        }

        // Let everything drain
        for _ in 0..200 {
            timeline.lock().unwrap().now += Duration::from_millis(20);
            scheduler.pump();
        }
        assert!(scheduler.is_idle(), "seed {}", seed);

        let timeline = timeline.lock().unwrap();
        assert_eq!(timeline.scheduled.len(), 12, "seed {}", seed);

        let mut previous_end = Duration::ZERO;
        for (index, &(start, samples, scheduled_at)) in timeline.scheduled.iter().enumerate() {
            assert_eq!(samples, 240 * (index + 1), "seed {}: chunk {} reordered", seed, index);
            assert!(start >= previous_end, "seed {}: chunk {} overlaps", seed, index);
            assert!(start >= scheduled_at, "seed {}: chunk {} scheduled in the past", seed, index);
            previous_end = start + samples_to_duration(samples);
        }
    }
}

#[test]
fn test_back_to_back_chunks_are_gapless() {
    let (mut scheduler, timeline, counters) = scheduler(3);

    for index in 0..3 {
        scheduler.enqueue(&chunk(index)).unwrap();
    }

    let timeline_ref = timeline.lock().unwrap();
    let starts: Vec<Duration> = timeline_ref.scheduled.iter().map(|s| s.0).collect();
    assert_eq!(
        starts,
        vec![
            Duration::ZERO,
            Duration::from_millis(10),
            Duration::from_millis(30),
        ]
    );
    drop(timeline_ref);

    timeline.lock().unwrap().now = Duration::from_millis(60);
    scheduler.pump();
    assert_eq!(counters.chunks_played.load(Ordering::Relaxed), 3);
}

#[test]
fn test_flush_discards_everything_pending() {
    let (mut scheduler, timeline, counters) = scheduler(2);

    for index in 0..6 {
        scheduler.enqueue(&chunk(index)).unwrap();
    }
    assert_eq!(scheduler.in_flight().len(), 2);
    assert_eq!(scheduler.queued(), 4);

    let discarded = scheduler.flush();
    assert_eq!(discarded, 6);
    assert!(scheduler.is_idle());
    assert_eq!(timeline.lock().unwrap().stops, 1);
    assert_eq!(counters.chunks_flushed.load(Ordering::Relaxed), 6);

    // Nothing from before the flush is ever scheduled again
    for _ in 0..50 {
        timeline.lock().unwrap().now += Duration::from_millis(20);
        scheduler.pump();
    }
    assert_eq!(timeline.lock().unwrap().scheduled.len(), 2);

    // Post-flush audio starts from the current clock, not the old timeline
    let now = timeline.lock().unwrap().now;
    scheduler.enqueue(&chunk(0)).unwrap();
    let last = *timeline.lock().unwrap().scheduled.last().unwrap();
    assert_eq!(last.0, now);
}

#[test]
fn test_malformed_chunk_is_skipped() {
    let (mut scheduler, timeline, counters) = scheduler(2);

    scheduler.enqueue(&chunk(0)).unwrap();
    assert!(scheduler.enqueue(&[1, 2, 3]).is_err());
    scheduler.enqueue(&chunk(1)).unwrap();

    assert_eq!(counters.chunks_malformed.load(Ordering::Relaxed), 1);
    assert_eq!(timeline.lock().unwrap().scheduled.len(), 2);
}

#[test]
fn test_close_releases_device_once() {
    let (mut scheduler, timeline, _counters) = scheduler(2);
    scheduler.enqueue(&chunk(0)).unwrap();

    scheduler.close();
    scheduler.close();

    assert!(timeline.lock().unwrap().closed);
    assert!(!scheduler.is_attached());

    // Without a device, audio is dropped rather than queued
    scheduler.enqueue(&chunk(1)).unwrap();
    assert!(scheduler.is_idle());
}
