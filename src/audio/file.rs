//! WAV-file devices: a capture backend that replays a recording in real
//! time and an output sink that renders the scheduled timeline to disk.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{
    sample_index, AudioDevices, CaptureBackend, OutputDevice, RawAudio, SAMPLE_RATE,
};
use super::codec;
use crate::error::DeviceError;

/// Replays a 16-bit WAV file as if it were a microphone
///
/// After the recording ends the device keeps delivering silence, so the
/// remote turn detector sees the end of the utterance.
pub struct WavCapture {
    path: PathBuf,
    buffer_duration: Duration,
    task: Option<JoinHandle<()>>,
}

impl WavCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer_duration: Duration::from_millis(20),
            task: None,
        }
    }

    pub fn with_buffer_duration(mut self, buffer_duration: Duration) -> Self {
        self.buffer_duration = buffer_duration;
        self
    }
}

/// Read a whole 16-bit integer WAV file
fn read_wav(path: &Path) -> Result<(WavSpec, Vec<i16>), DeviceError> {
    let reader = WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => DeviceError::Unavailable(format!("{}: {}", path.display(), io)),
        other => DeviceError::Wav(other),
    })?;

    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        return Err(DeviceError::UnsupportedFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        });
    }

    let samples = reader.into_samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    Ok((spec, samples))
}

#[async_trait::async_trait]
impl CaptureBackend for WavCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<RawAudio>, DeviceError> {
        if self.task.is_some() {
            return Err(DeviceError::Unavailable("already capturing".into()));
        }

        let (spec, samples) = read_wav(&self.path)?;
        codec::check_format(spec.sample_rate, spec.channels, SAMPLE_RATE)?;

        info!(
            "Replaying {} ({:.1}s, {}Hz, {} channels)",
            self.path.display(),
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64),
            spec.sample_rate,
            spec.channels
        );

        let per_buffer = (spec.sample_rate as u128 * spec.channels as u128
            * self.buffer_duration.as_millis()
            / 1000) as usize;
        let per_buffer = per_buffer.max(spec.channels as usize);

        let (tx, rx) = mpsc::channel(100);
        let mut ticker = tokio::time::interval(self.buffer_duration);

        self.task = Some(tokio::spawn(async move {
            let mut position = 0;
            loop {
                ticker.tick().await;

                let end = (position + per_buffer).min(samples.len());
                let mut buffer = samples[position..end].to_vec();
                buffer.resize(per_buffer, 0);
                position = end;

                let raw = RawAudio {
                    samples: buffer,
                    sample_rate: spec.sample_rate,
                    channels: spec.channels,
                };
                if tx.send(raw).await.is_err() {
                    break;
                }
            }
            debug!("WAV replay finished");
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("WAV capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "WAV capture"
    }
}

/// Output sink that renders everything it plays into a 24 kHz mono WAV file
///
/// The device clock is wall-clock time since the sink was opened. Gaps
/// between scheduled buffers become silence, overlapping buffers are mixed,
/// and buffers cut by `stop_all` are truncated at the current clock position.
pub struct WavSink {
    path: PathBuf,
    origin: Instant,
    timeline: Vec<f32>,
    closed: bool,
}

impl WavSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(DeviceError::Unavailable(format!(
                    "output directory {} does not exist",
                    parent.display()
                )));
            }
        }

        Ok(Self {
            path,
            origin: Instant::now(),
            timeline: Vec::new(),
            closed: false,
        })
    }

    fn position(at: Duration) -> usize {
        sample_index(at) as usize
    }
}

impl OutputDevice for WavSink {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&mut self, samples: &[f32], start_at: Duration) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Unavailable("output closed".into()));
        }

        let offset = Self::position(start_at);
        if self.timeline.len() < offset {
            self.timeline.resize(offset, 0.0);
        }

        let overlap = (self.timeline.len() - offset).min(samples.len());
        for (out, &sample) in self.timeline[offset..offset + overlap].iter_mut().zip(samples) {
            *out += sample;
        }
        self.timeline.extend_from_slice(&samples[overlap..]);
        Ok(())
    }

    fn stop_all(&mut self) {
        let now = Self::position(self.now());
        if self.timeline.len() > now {
            debug!("Cutting {} unplayed samples", self.timeline.len() - now);
            self.timeline.truncate(now);
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(&self.path, spec)?;
        for &sample in &self.timeline {
            let pcm = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(pcm)?;
        }
        writer.finalize()?;

        info!(
            "Agent audio written to {} ({:.1}s)",
            self.path.display(),
            self.timeline.len() as f64 / SAMPLE_RATE as f64
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "WAV sink"
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to finalize WAV sink on drop: {}", e);
        }
    }
}

/// Device factory for file-driven sessions
#[derive(Debug, Clone)]
pub struct WavDevices {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl AudioDevices for WavDevices {
    fn open_capture(&self) -> Result<Box<dyn CaptureBackend>, DeviceError> {
        if !self.input.is_file() {
            return Err(DeviceError::Unavailable(format!(
                "input file {} not found",
                self.input.display()
            )));
        }
        Ok(Box::new(WavCapture::new(&self.input)))
    }

    fn open_output(&self) -> Result<Box<dyn OutputDevice>, DeviceError> {
        Ok(Box::new(WavSink::create(&self.output)?))
    }
}
