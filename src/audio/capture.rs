//! Capture pipeline: owns the microphone, applies the runtime gain and
//! slices the stream into fixed-duration frames.
//!
//! The capture task is the only reader of the device. It reads the current
//! [`GainSetting`] once per frame and never waits on the network: frames are
//! handed to `on_frame`, which must not block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioFrame, CaptureBackend, SAMPLE_RATE};
use super::codec;
use super::level::{LevelMonitor, LevelReading};
use crate::error::DeviceError;

/// How the capture gain moves towards a new target
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ramp {
    /// Exponential approach with the given time constant
    Smooth(Duration),
    /// Jump on the next frame
    Immediate,
}

/// Capture gain multiplier (0.0..=1.0) and how to reach it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSetting {
    pub target: f32,
    pub ramp: Ramp,
}

impl Default for GainSetting {
    fn default() -> Self {
        Self {
            target: 1.0,
            ramp: Ramp::Immediate,
        }
    }
}

/// Shared handle to the capture gain
///
/// Writes replace the whole [`GainSetting`] and notify readers; the capture
/// task only ever reads a copy.
#[derive(Debug, Clone)]
pub struct GainControl {
    tx: Arc<watch::Sender<GainSetting>>,
}

impl GainControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GainSetting::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> GainSetting {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GainSetting> {
        self.tx.subscribe()
    }

    /// Replace the gain setting
    ///
    /// Returns false when the setting already has this target (and an
    /// immediate jump is not being requested over a running ramp).
    pub fn set(&self, target: f32, ramp: Ramp) -> bool {
        let target = target.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            let snap = ramp == Ramp::Immediate && current.ramp != Ramp::Immediate;
            if current.target == target && !snap {
                return false;
            }
            *current = GainSetting { target, ramp };
            true
        })
    }

    /// Full gain on the next frame, skipping the ramp
    pub fn restore_immediately(&self) -> bool {
        self.set(1.0, Ramp::Immediate)
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sample gain smoothing, owned by the capture task
#[derive(Debug, Clone)]
pub struct GainSmoother {
    current: f32,
    sample_rate: u32,
}

impl GainSmoother {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            current: 1.0,
            sample_rate,
        }
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn apply(&mut self, setting: GainSetting, samples: &mut [i16]) {
        match setting.ramp {
            Ramp::Immediate => {
                self.current = setting.target;
                for sample in samples.iter_mut() {
                    *sample = scale(*sample, self.current);
                }
            }
            Ramp::Smooth(tau) => {
                let tau_samples = (tau.as_secs_f32() * self.sample_rate as f32).max(1.0);
                let alpha = 1.0 - (-1.0 / tau_samples).exp();
                for sample in samples.iter_mut() {
                    self.current += (setting.target - self.current) * alpha;
                    *sample = scale(*sample, self.current);
                }
                if (self.current - setting.target).abs() < 1e-4 {
                    self.current = setting.target;
                }
            }
        }
    }
}

fn scale(sample: i16, gain: f32) -> i16 {
    (sample as f32 * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Cuts an arbitrary sample stream into equal frames
#[derive(Debug)]
struct FrameSlicer {
    pending: Vec<i16>,
    frame_len: usize,
}

impl FrameSlicer {
    fn new(frame_len: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_len * 2),
            frame_len: frame_len.max(1),
        }
    }

    fn push(&mut self, samples: Vec<i16>) -> Vec<Vec<i16>> {
        self.pending.extend(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Capture pipeline configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frame duration in milliseconds (default: 100ms)
    pub frame_ms: u64,
    /// Level monitor smoothing factor
    pub level_smoothing: f32,
    /// Ramp used by [`CapturePipeline::set_gain`]
    pub gain_ramp: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_ms: 100,
            level_smoothing: 0.3,
            gain_ramp: Duration::from_millis(50),
        }
    }
}

impl CaptureConfig {
    pub fn frame_len(&self) -> usize {
        (SAMPLE_RATE as u64 * self.frame_ms / 1000) as usize
    }
}

/// Signals the capture task to release the device
#[derive(Debug, Clone)]
pub struct CaptureStop(Arc<Notify>);

impl CaptureStop {
    pub fn stop(&self) {
        self.0.notify_one();
    }
}

/// Owns the capture device for the lifetime of a session
pub struct CapturePipeline {
    backend: Option<Box<dyn CaptureBackend>>,
    config: CaptureConfig,
    gain: GainControl,
    stop: CaptureStop,
    task: Option<JoinHandle<()>>,
    failure: Option<oneshot::Receiver<DeviceError>>,
}

impl CapturePipeline {
    pub fn new(backend: Box<dyn CaptureBackend>, config: CaptureConfig, gain: GainControl) -> Self {
        Self {
            backend: Some(backend),
            config,
            gain,
            stop: CaptureStop(Arc::new(Notify::new())),
            task: None,
            failure: None,
        }
    }

    /// Start capturing
    ///
    /// `on_frame` receives every gain-adjusted frame, `on_level` every level
    /// reading. Both run on the capture task and must not block.
    pub async fn start<F, L>(&mut self, mut on_frame: F, mut on_level: L) -> Result<(), DeviceError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
        L: FnMut(LevelReading) + Send + 'static,
    {
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| DeviceError::Unavailable("capture already started".into()))?;

        let mut audio_rx = match backend.start().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Failed to start capture on {}: {}", backend.name(), e);
                return Err(e);
            }
        };

        info!(
            "Capture started on {} ({}ms frames)",
            backend.name(),
            self.config.frame_ms
        );

        let (failure_tx, failure_rx) = oneshot::channel();
        self.failure = Some(failure_rx);

        let stop = Arc::clone(&self.stop.0);
        let gain_rx = self.gain.subscribe();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let mut slicer = FrameSlicer::new(config.frame_len());
            let mut smoother = GainSmoother::new(SAMPLE_RATE);
            let mut monitor = LevelMonitor::new(config.level_smoothing);
            let mut sequence = 0u64;
            let mut samples_emitted = 0u64;
            let mut failure = None;

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    raw = audio_rx.recv() => {
                        let Some(raw) = raw else {
                            warn!("Capture device stream ended");
                            failure = Some(DeviceError::Unavailable("capture stream ended".into()));
                            break;
                        };

                        let samples = match codec::normalize(raw, SAMPLE_RATE) {
                            Ok(samples) => samples,
                            Err(e) => {
                                error!("Capture device switched to an unusable format: {}", e);
                                failure = Some(e);
                                break;
                            }
                        };

                        for mut slice in slicer.push(samples) {
                            let setting = *gain_rx.borrow();
                            smoother.apply(setting, &mut slice);

                            let timestamp_ms = samples_emitted * 1000 / SAMPLE_RATE as u64;
                            samples_emitted += slice.len() as u64;

                            on_level(monitor.measure(&slice, timestamp_ms));
                            on_frame(AudioFrame {
                                samples: slice,
                                sample_rate: SAMPLE_RATE,
                                timestamp_ms,
                                sequence,
                            });
                            sequence += 1;
                        }
                    }
                }
            }

            debug!("Capture task exiting after {} frames", sequence);

            if let Err(e) = backend.stop().await {
                error!("Failed to stop capture backend: {}", e);
            }
            if let Some(e) = failure {
                let _ = failure_tx.send(e);
            }
        });

        self.task = Some(task);

        Ok(())
    }

    /// Change the capture gain; applies from the next frame with smoothing
    pub fn set_gain(&self, factor: f32) {
        self.gain.set(factor, Ramp::Smooth(self.config.gain_ramp));
    }

    /// Resolves if the device fails after a successful start; can be taken once
    ///
    /// The sender side is dropped without a value on a normal stop.
    pub fn take_failure(&mut self) -> Option<oneshot::Receiver<DeviceError>> {
        self.failure.take()
    }

    /// Handle that makes the capture task release the device
    pub fn stop_handle(&self) -> CaptureStop {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop capturing and release the device. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.stop.stop();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Capture task panicked: {}", e);
            }
            info!("Capture stopped");
        }
    }
}
