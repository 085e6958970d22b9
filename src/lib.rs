pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod session;
pub mod transport;

pub use audio::{
    AudioDevices, AudioFrame, CaptureBackend, GainControl, LevelReading, OutputDevice, WavDevices,
};
pub use config::Config;
pub use error::{ConnectError, DeviceError, EngineError, FailureKind};
pub use playback::PlaybackScheduler;
pub use session::{
    ConversationState, EngineEvent, Session, SessionStats, StateTransition, TranscriptSegment,
    VoiceEngine,
};
pub use transport::{ClientMessage, ServerEvent, TransportSession};
