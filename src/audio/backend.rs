use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::DeviceError;

/// Wire sample rate for both directions (24 kHz mono PCM16)
pub const SAMPLE_RATE: u32 = 24_000;

/// Clock time at which sample `n` of a 24 kHz stream starts, rounded up to
/// the nanosecond
///
/// `sample_index(sample_time(n)) == n` for every `n`, so positions survive a
/// round trip through the device clock.
pub fn sample_time(n: u64) -> Duration {
    let nanos = (n as u128 * 1_000_000_000).div_ceil(SAMPLE_RATE as u128);
    Duration::from_nanos(nanos as u64)
}

/// Index of the sample playing at clock time `at`
pub fn sample_index(at: Duration) -> u64 {
    (at.as_nanos() * SAMPLE_RATE as u128 / 1_000_000_000) as u64
}

/// Raw audio as delivered by a capture device, before normalization
#[derive(Debug, Clone)]
pub struct RawAudio {
    /// PCM samples (i16, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
}

/// One fixed time slice of captured, gain-adjusted audio (24 kHz mono PCM16)
///
/// Produced by the capture pipeline and handed to the transport by value.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono PCM samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Milliseconds of audio captured before this frame
    pub timestamp_ms: u64,
    /// Monotonic frame position within the session
    pub sequence: u64,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        let nanos = self.samples.len() as u128 * 1_000_000_000 / self.sample_rate.max(1) as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Microphone-side boundary
///
/// Implementations:
/// - [`crate::audio::WavCapture`]: replays a WAV file in real time (CLI, tests)
/// - platform microphones live outside this crate
#[async_trait::async_trait]
pub trait CaptureBackend: Send {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive raw audio buffers of any size
    async fn start(&mut self) -> Result<mpsc::Receiver<RawAudio>, DeviceError>;

    /// Stop capturing audio and release the device
    async fn stop(&mut self) -> Result<(), DeviceError>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Speaker-side boundary
///
/// The device owns a monotonic clock and plays buffers at absolute positions
/// on that clock. Scheduling never blocks.
pub trait OutputDevice: Send {
    /// Current position of the device clock
    fn now(&self) -> Duration;

    /// Play normalized mono samples (24 kHz) starting at `start_at` on the device clock
    fn schedule(&mut self, samples: &[f32], start_at: Duration) -> Result<(), DeviceError>;

    /// Silence everything scheduled, including the buffer currently playing
    fn stop_all(&mut self);

    /// Release the device
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Get device name for logging
    fn name(&self) -> &str;
}

/// Device factory, consulted on every `connect()`
///
/// Opening a device is the acquisition point: failures here are fatal to
/// the session start and are never retried.
pub trait AudioDevices: Send + Sync {
    fn open_capture(&self) -> Result<Box<dyn CaptureBackend>, DeviceError>;

    fn open_output(&self) -> Result<Box<dyn OutputDevice>, DeviceError>;
}
