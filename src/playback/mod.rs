//! Agent audio output.

mod scheduler;

pub use scheduler::{AudioChunk, PlaybackCounters, PlaybackScheduler, ScheduledWindow};
