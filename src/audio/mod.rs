pub mod backend;
pub mod capture;
pub mod codec;
pub mod file;
pub mod level;
pub mod vad;

pub use backend::{
    sample_index, sample_time, AudioDevices, AudioFrame, CaptureBackend, OutputDevice, RawAudio,
    SAMPLE_RATE,
};
pub use capture::{CaptureConfig, CapturePipeline, CaptureStop, GainControl, GainSetting, Ramp};
pub use file::{WavCapture, WavDevices, WavSink};
pub use level::{LevelMonitor, LevelReading};
pub use vad::{LocalTurnDetector, VadDecision, VadParams};
