use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::ConversationState;
use crate::playback::PlaybackCounters;

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Current conversation state
    pub state: ConversationState,

    /// When the current session was opened, if any
    pub started_at: Option<DateTime<Utc>>,

    /// Session duration in seconds
    pub duration_secs: f64,

    /// Capture frames queued for the service
    pub frames_sent: usize,

    /// Capture frames dropped under backpressure
    pub frames_dropped: usize,

    /// Control messages dropped because the outbound queue was full
    pub controls_dropped: usize,

    /// Agent chunks played to completion
    pub chunks_played: usize,

    /// Agent chunks discarded by flushes
    pub chunks_flushed: usize,

    /// Agent chunks dropped as malformed
    pub chunks_malformed: usize,

    /// Barge-ins handled
    pub interruptions: usize,
}

/// Counters written by the dispatch task, read by [`crate::VoiceEngine::stats`]
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub playback: Arc<PlaybackCounters>,
    pub interruptions: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// A finished piece of transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub speaker: Speaker,

    /// Transcribed text
    pub text: String,

    /// When this segment was completed
    pub timestamp: DateTime<Utc>,

    /// Whether the turn was cut short by a barge-in
    pub partial: bool,
}
