//! Gapless, in-order playback of agent audio.
//!
//! Chunks wait in a FIFO queue. At most `lookahead` chunks are committed to
//! the output device at once; each one starts at
//! `max(now, previous_chunk_end)` on the device clock, so playback never
//! overlaps and never reorders no matter how irregularly chunks arrive.
//! When a committed chunk's end passes on the device clock it is retired and
//! the next queued chunk is committed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::backend::{sample_index, sample_time, OutputDevice};
use crate::audio::codec;
use crate::error::DecodeError;

/// One decoded segment of agent speech
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Arrival order within the session
    pub id: u64,
    /// Normalized mono samples at 24 kHz
    pub samples: Vec<f32>,
    /// When the chunk arrived from the network
    pub arrived_at: Instant,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        sample_time(self.samples.len() as u64)
    }
}

/// A chunk committed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledWindow {
    pub id: u64,
    pub start: Duration,
    pub end: Duration,
}

/// Playback counters, shared with the session stats
#[derive(Debug, Default)]
pub struct PlaybackCounters {
    pub chunks_played: AtomicUsize,
    pub chunks_flushed: AtomicUsize,
    pub chunks_malformed: AtomicUsize,
}

pub struct PlaybackScheduler {
    output: Option<Box<dyn OutputDevice>>,
    queue: VecDeque<AudioChunk>,
    in_flight: VecDeque<ScheduledWindow>,
    /// Sample position right after the last committed chunk
    next_start: u64,
    lookahead: usize,
    next_id: u64,
    counters: Arc<PlaybackCounters>,
}

impl PlaybackScheduler {
    pub fn new(lookahead: usize, counters: Arc<PlaybackCounters>) -> Self {
        Self {
            output: None,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            next_start: 0,
            lookahead: lookahead.max(1),
            next_id: 0,
            counters,
        }
    }

    /// Take exclusive ownership of the output device
    pub fn attach(&mut self, output: Box<dyn OutputDevice>) {
        info!("Playback attached to {}", output.name());
        self.output = Some(output);
        self.next_start = 0;
    }

    pub fn is_attached(&self) -> bool {
        self.output.is_some()
    }

    /// Decode a PCM16 delta and queue it behind everything already queued
    ///
    /// Malformed audio is dropped; the scheduler carries on with the next chunk.
    pub fn enqueue(&mut self, pcm: &[u8]) -> Result<(), DecodeError> {
        let samples = match codec::bytes_to_pcm16(pcm) {
            Ok(samples) => samples,
            Err(e) => {
                self.counters.chunks_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed agent audio: {}", e);
                return Err(e);
            }
        };

        if samples.is_empty() {
            return Ok(());
        }

        if self.output.is_none() {
            debug!("No output device attached, discarding chunk");
            return Ok(());
        }

        let chunk = AudioChunk {
            id: self.next_id,
            samples: codec::pcm16_to_f32(&samples),
            arrived_at: Instant::now(),
        };
        self.next_id += 1;

        debug!("Queued chunk {} ({:?})", chunk.id, chunk.duration());
        self.queue.push_back(chunk);
        self.pump();
        Ok(())
    }

    /// Retire finished chunks and commit queued ones up to the lookahead
    pub fn pump(&mut self) {
        let Some(output) = self.output.as_mut() else {
            return;
        };

        let now = output.now();
        // First sample that has not started yet
        let mut now_sample = sample_index(now);
        if sample_time(now_sample) < now {
            now_sample += 1;
        }

        while let Some(window) = self.in_flight.front() {
            if window.end > now {
                break;
            }
            debug!("Chunk {} finished", window.id);
            self.in_flight.pop_front();
            self.counters.chunks_played.fetch_add(1, Ordering::Relaxed);
        }

        while self.in_flight.len() < self.lookahead {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };

            let start_sample = now_sample.max(self.next_start);
            let end_sample = start_sample + chunk.samples.len() as u64;
            let (start, end) = (sample_time(start_sample), sample_time(end_sample));

            if let Err(e) = output.schedule(&chunk.samples, start) {
                warn!("Output rejected chunk {}: {}", chunk.id, e);
                continue;
            }

            debug!(
                "Scheduled chunk {} at {:?} (waited {:?})",
                chunk.id,
                start,
                chunk.arrived_at.elapsed()
            );
            self.in_flight.push_back(ScheduledWindow { id: chunk.id, start, end });
            self.next_start = end_sample;
        }
    }

    /// Drop everything unplayed and cut the chunk that is currently playing
    ///
    /// Returns how many chunks were discarded. The next enqueue starts
    /// fresh from the device's current time.
    pub fn flush(&mut self) -> usize {
        let dropped = self.queue.len() + self.in_flight.len();
        self.queue.clear();
        self.in_flight.clear();
        self.next_start = 0;

        if let Some(output) = self.output.as_mut() {
            output.stop_all();
        }

        self.counters.chunks_flushed.fetch_add(dropped, Ordering::Relaxed);
        if dropped > 0 {
            info!("Playback flushed ({} chunks discarded)", dropped);
        }
        dropped
    }

    /// Flush and release the output device. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.flush();
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                warn!("Failed to close {}: {}", output.name(), e);
            }
            info!("Playback released {}", output.name());
        }
    }

    /// Nothing queued and nothing committed
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> &VecDeque<ScheduledWindow> {
        &self.in_flight
    }
}
