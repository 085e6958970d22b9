use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::audio::{CaptureConfig, VadParams};

const DEFAULT_INSTRUCTIONS: &str = "You are Carter, a friendly AI sous-chef. \
Keep responses concise and conversational. Help with meal planning.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportSettings,
    pub session: SessionSettings,
    pub audio: AudioSettings,
    pub local_vad: LocalVadSettings,
}

/// Where and how to open the realtime stream
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// `POST` endpoint returning `{ token, url }`
    pub token_endpoint: Option<String>,
    /// Direct realtime URL, used together with `api_key` when no token endpoint is set
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Appended to the realtime URL as `?model=`
    pub model: Option<String>,
    pub connect_timeout_ms: u64,
    /// Outgoing messages buffered before audio is dropped
    pub outbound_queue: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            token_endpoint: None,
            url: None,
            api_key: None,
            model: None,
            connect_timeout_ms: 10_000,
            outbound_queue: 64,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Voice persona and turn detection negotiated with the service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub voice: String,
    pub instructions: String,
    pub temperature: Option<f32>,
    pub transcription_model: Option<String>,
    pub max_response_output_tokens: Option<u32>,
    pub turn_detection: TurnDetectionSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: Some(0.8),
            transcription_model: Some("whisper-1".to_string()),
            max_response_output_tokens: Some(1024),
            turn_detection: TurnDetectionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnDetectionMode {
    /// The service detects speech start/stop
    Server,
    /// The engine detects turns from capture levels and commits audio itself
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TurnDetectionSettings {
    pub mode: TurnDetectionMode,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionSettings {
    fn default() -> Self {
        Self {
            mode: TurnDetectionMode::Server,
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub frame_ms: u64,
    /// Capture gain while the agent speaks
    pub duck_gain: f32,
    pub duck_ramp_ms: u64,
    pub unduck_ramp_ms: u64,
    /// Delay between a barge-in and returning to listening
    pub settle_ms: u64,
    /// Chunks committed to the output device ahead of the playhead
    pub playback_lookahead: usize,
    pub pump_interval_ms: u64,
    pub level_smoothing: f32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            frame_ms: 100,
            duck_gain: 0.2,
            duck_ramp_ms: 50,
            unduck_ramp_ms: 100,
            settle_ms: 100,
            playback_lookahead: 2,
            pump_interval_ms: 20,
            level_smoothing: 0.3,
        }
    }
}

impl AudioSettings {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            frame_ms: self.frame_ms,
            level_smoothing: self.level_smoothing,
            gain_ramp: Duration::from_millis(self.duck_ramp_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalVadSettings {
    pub onset: f32,
    pub offset: f32,
    pub silence_ms: u64,
    pub max_utterance_ms: u64,
}

impl Default for LocalVadSettings {
    fn default() -> Self {
        Self {
            onset: 0.08,
            offset: 0.04,
            silence_ms: 1500,
            max_utterance_ms: 10_000,
        }
    }
}

impl LocalVadSettings {
    pub fn params(&self, frame_ms: u64) -> VadParams {
        VadParams {
            onset: self.onset,
            offset: self.offset,
            silence: Duration::from_millis(self.silence_ms),
            max_utterance: Duration::from_millis(self.max_utterance_ms),
            frame: Duration::from_millis(frame_ms),
        }
    }
}

impl Config {
    /// Load from an optional config file, overridden by `DUPLEX_VOICE__*` env vars
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("DUPLEX_VOICE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
