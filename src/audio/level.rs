use serde::Serialize;

/// Loudness estimate for one capture slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LevelReading {
    /// RMS of the slice, normalized to 0.0..=1.0
    pub rms: f32,
    /// Exponentially smoothed RMS (what UI meters and the local detector use)
    pub smoothed: f32,
    /// Capture time of the slice in milliseconds
    pub timestamp_ms: u64,
}

/// Computes a smoothed loudness metric over capture slices
#[derive(Debug, Clone)]
pub struct LevelMonitor {
    /// Weight of the previous smoothed value (0.0 = no smoothing)
    smoothing: f32,
    smoothed: f32,
}

impl LevelMonitor {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.99),
            smoothed: 0.0,
        }
    }

    pub fn measure(&mut self, samples: &[i16], timestamp_ms: u64) -> LevelReading {
        let rms = rms(samples);
        self.smoothed = self.smoothed * self.smoothing + rms * (1.0 - self.smoothing);

        LevelReading {
            rms,
            smoothed: self.smoothed,
            timestamp_ms,
        }
    }
}

/// Root mean square of PCM16 samples, normalized to 0.0..=1.0
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let x = s as f64 / 32768.0;
            x * x
        })
        .sum();

    (sum / samples.len() as f64).sqrt() as f32
}
