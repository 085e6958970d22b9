//! Error taxonomy for the voice engine.
//!
//! Only fatal classes ever reach the caller: [`ConnectError`], [`DeviceError`]
//! and remote session errors. Frame-level failures ([`DecodeError`], dropped
//! sends) are absorbed where they are detected.

use std::fmt;

/// Failure to open a session with the remote conversation service.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The token endpoint or the realtime service rejected our credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The token endpoint or the realtime service could not be reached.
    #[error("Service unreachable: {0}")]
    Unreachable(String),
}

/// Failure to acquire or drive an audio device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Device missing, busy or permission denied.
    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    /// The device delivers a format we cannot normalize to 24 kHz mono PCM16.
    #[error("Unsupported audio format: {sample_rate}Hz, {channels} channels")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },

    /// WAV file I/O failure.
    #[error("Audio file error: {0}")]
    Wav(#[from] hound::Error),
}

/// Malformed incoming audio. The offending chunk is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// Errors surfaced by [`crate::VoiceEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// `connect()` called while a session is already open.
    #[error("Voice session is already active")]
    AlreadyActive,

    /// The remote service terminated the session.
    #[error("Session error: {0}")]
    Session(String),
}

impl EngineError {
    /// Collapse the cause into the single user-visible failure class.
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Connect(_) | EngineError::AlreadyActive => FailureKind::ConnectionFailed,
            EngineError::Device(_) => FailureKind::DeviceUnavailable,
            EngineError::Session(_) => FailureKind::SessionError,
        }
    }
}

/// User-visible failure classes. Granular causes stay in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionFailed,
    DeviceUnavailable,
    SessionError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::ConnectionFailed => "connection failed",
            FailureKind::DeviceUnavailable => "device unavailable",
            FailureKind::SessionError => "session error",
        };
        f.write_str(text)
    }
}
