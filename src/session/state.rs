use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Conversation state; exactly one is current at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Disconnected,
    Connecting,
    Connected,
    /// User may speak, agent silent
    Listening,
    /// Agent audio playing, capture ducked
    AgentSpeaking,
    /// User finished, waiting for the agent
    Processing,
    /// User barged in; settling before listening again
    Interrupted,
}

impl ConversationState {
    /// Session is up (past the handshake)
    pub fn is_connected(self) -> bool {
        !matches!(self, ConversationState::Disconnected | ConversationState::Connecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Disconnected => "disconnected",
            ConversationState::Connecting => "connecting",
            ConversationState::Connected => "connected",
            ConversationState::Listening => "listening",
            ConversationState::AgentSpeaking => "agent_speaking",
            ConversationState::Processing => "processing",
            ConversationState::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture gain is a pure function of the state
pub fn capture_gain(state: ConversationState, duck_gain: f32) -> f32 {
    match state {
        ConversationState::AgentSpeaking => duck_gain,
        _ => 1.0,
    }
}

/// `from → to` notification, emitted on every state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: ConversationState,
    pub to: ConversationState,
    pub at: DateTime<Utc>,
}

/// One conversation connection, as negotiated with the service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub voice: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: Option<String>, voice: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4())),
            voice,
            created_at: Utc::now(),
        }
    }
}
