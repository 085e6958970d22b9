//! JSON wire protocol of the realtime conversation service.

use serde::{Deserialize, Serialize};

use crate::audio::backend::SAMPLE_RATE;
use crate::audio::codec;
use crate::config::{SessionSettings, TurnDetectionMode};
use crate::error::DecodeError;

/// Messages sent to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },

    /// Base64-encoded PCM16 audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientMessage {
    pub fn append_audio(samples: &[i16]) -> Self {
        ClientMessage::InputAudioBufferAppend {
            audio: codec::encode_base64(samples),
        }
    }
}

/// Negotiated session parameters (`session.update`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub audio_format: String,
    pub sample_rate: u32,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionParams>,
    /// `null` disables server-side turn detection
    pub turn_detection: Option<TurnDetectionParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetectionParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl SessionParams {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        let turn_detection = match settings.turn_detection.mode {
            TurnDetectionMode::Server => Some(TurnDetectionParams {
                kind: "server_vad".to_string(),
                threshold: settings.turn_detection.threshold,
                prefix_padding_ms: settings.turn_detection.prefix_padding_ms,
                silence_duration_ms: settings.turn_detection.silence_duration_ms,
            }),
            TurnDetectionMode::Local => None,
        };

        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: settings.voice.clone(),
            instructions: settings.instructions.clone(),
            audio_format: "pcm16".to_string(),
            sample_rate: SAMPLE_RATE,
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: settings
                .transcription_model
                .clone()
                .map(|model| TranscriptionParams { model }),
            turn_detection,
            temperature: settings.temperature,
            max_response_output_tokens: settings.max_response_output_tokens,
        }
    }
}

/// Events received from the service
///
/// The set is closed; unknown event types are skipped by [`ServerEvent::parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionReady {
        session_id: Option<String>,
        voice: Option<String>,
    },
    UserSpeechStarted,
    UserSpeechStopped,
    /// Decoded PCM16 bytes of one agent audio delta
    AgentAudioDelta {
        response_id: Option<String>,
        audio: Vec<u8>,
    },
    AgentTranscriptDelta(String),
    AgentTurnComplete {
        response_id: Option<String>,
    },
    AudioBufferCommitted,
    UserTranscriptFinal(String),
    RemoteError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("Malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed audio delta: {0}")]
    Audio(#[from] DecodeError),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    body: serde_json::Value,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(default)]
    session: Option<SessionInfo>,
}

#[derive(Deserialize)]
struct SessionInfo {
    id: Option<String>,
    voice: Option<String>,
}

#[derive(Deserialize)]
struct AudioDelta {
    response_id: Option<String>,
    delta: String,
}

#[derive(Deserialize)]
struct TextDelta {
    #[serde(default)]
    delta: String,
}

#[derive(Deserialize)]
struct ResponseDone {
    #[serde(default)]
    response: Option<ResponseInfo>,
}

#[derive(Deserialize)]
struct ResponseInfo {
    id: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionCompleted {
    #[serde(default)]
    transcript: String,
}

#[derive(Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: Option<ErrorInfo>,
}

#[derive(Deserialize)]
struct ErrorInfo {
    message: Option<String>,
}

impl ServerEvent {
    /// Parse one text frame
    ///
    /// Returns `Ok(None)` for event types outside the closed set.
    pub fn parse(text: &str) -> Result<Option<ServerEvent>, EventParseError> {
        let Envelope { kind, body } = serde_json::from_str(text)?;

        let event = match kind.as_str() {
            "session.created" => {
                let created: SessionCreated = serde_json::from_value(body)?;
                let (session_id, voice) = created
                    .session
                    .map(|s| (s.id, s.voice))
                    .unwrap_or((None, None));
                ServerEvent::SessionReady { session_id, voice }
            }
            "input_audio_buffer.speech_started" => ServerEvent::UserSpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::UserSpeechStopped,
            "input_audio_buffer.committed" => ServerEvent::AudioBufferCommitted,
            "response.audio.delta" => {
                let delta: AudioDelta = serde_json::from_value(body)?;
                ServerEvent::AgentAudioDelta {
                    response_id: delta.response_id,
                    audio: codec::decode_base64(&delta.delta)?,
                }
            }
            "response.audio_transcript.delta" => {
                let delta: TextDelta = serde_json::from_value(body)?;
                ServerEvent::AgentTranscriptDelta(delta.delta)
            }
            "response.done" => {
                let done: ResponseDone = serde_json::from_value(body)?;
                ServerEvent::AgentTurnComplete {
                    response_id: done.response.and_then(|r| r.id),
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                let completed: TranscriptionCompleted = serde_json::from_value(body)?;
                ServerEvent::UserTranscriptFinal(completed.transcript)
            }
            "error" => {
                let error: ErrorEvent = serde_json::from_value(body)?;
                let message = error
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "Unknown error".to_string());
                ServerEvent::RemoteError(message)
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Short name for logging (never includes audio payloads)
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionReady { .. } => "SessionReady",
            ServerEvent::UserSpeechStarted => "UserSpeechStarted",
            ServerEvent::UserSpeechStopped => "UserSpeechStopped",
            ServerEvent::AgentAudioDelta { .. } => "AgentAudioDelta",
            ServerEvent::AgentTranscriptDelta(_) => "AgentTranscriptDelta",
            ServerEvent::AgentTurnComplete { .. } => "AgentTurnComplete",
            ServerEvent::AudioBufferCommitted => "AudioBufferCommitted",
            ServerEvent::UserTranscriptFinal(_) => "UserTranscriptFinal",
            ServerEvent::RemoteError(_) => "RemoteError",
        }
    }
}
