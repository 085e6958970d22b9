//! Conversation session management
//!
//! This module provides the [`VoiceEngine`] and the pieces it drives:
//! - The turn-taking state machine and its gain policy
//! - Barge-in handling (cancel, flush, settle)
//! - Session statistics and transcript segments

mod engine;
mod interrupt;
mod state;
mod stats;
mod turn;

pub use engine::VoiceEngine;
pub use interrupt::InterruptController;
pub use state::{capture_gain, ConversationState, Session, StateTransition};
pub use stats::{SessionCounters, SessionStats, Speaker, TranscriptSegment};
pub use turn::{EngineEvent, Input, Observers, TurnConfig, TurnTaking};
