//! Client-side turn detection for the local (non server-VAD) mode.
//!
//! [`detect`] is a pure function of a rolling window of [`LevelReading`]s and
//! the start time of the current utterance. Two thresholds give hysteresis:
//! speech starts above `onset` and only counts as finished after the level
//! has stayed below `offset` for the whole silence debounce.

use std::collections::VecDeque;
use std::time::Duration;

use super::level::LevelReading;

#[derive(Debug, Clone)]
pub struct VadParams {
    /// Smoothed level that starts an utterance
    pub onset: f32,
    /// Smoothed level below which audio counts as silence
    pub offset: f32,
    /// Silence needed to end an utterance
    pub silence: Duration,
    /// Hard cap on one utterance
    pub max_utterance: Duration,
    /// Duration covered by each reading
    pub frame: Duration,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            onset: 0.08,
            offset: 0.04,
            silence: Duration::from_millis(1500),
            max_utterance: Duration::from_secs(10),
            frame: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReason {
    Silence,
    MaxDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// No speech, nothing in progress
    Idle,
    /// Speech just began
    Onset,
    /// Utterance still in progress
    Continue,
    /// Utterance finished
    Offset(OffsetReason),
}

/// Bounded history of recent readings, oldest first
#[derive(Debug, Clone)]
pub struct LevelWindow {
    readings: VecDeque<LevelReading>,
    capacity: usize,
}

impl LevelWindow {
    /// Window long enough to observe a full silence debounce
    pub fn for_params(params: &VadParams) -> Self {
        let frame_ms = params.frame.as_millis().max(1);
        let capacity = (params.silence.as_millis() / frame_ms) as usize + 1;
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, reading: LevelReading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    pub fn latest(&self) -> Option<&LevelReading> {
        self.readings.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LevelReading> {
        self.readings.iter()
    }
}

/// Decide the turn state from the window
///
/// `speaking_since` is the timestamp (ms) of the onset of the utterance in
/// progress, or `None` when idle.
pub fn detect(window: &LevelWindow, speaking_since: Option<u64>, params: &VadParams) -> VadDecision {
    let Some(latest) = window.latest() else {
        return if speaking_since.is_some() {
            VadDecision::Continue
        } else {
            VadDecision::Idle
        };
    };

    let Some(since) = speaking_since else {
        return if latest.smoothed > params.onset {
            VadDecision::Onset
        } else {
            VadDecision::Idle
        };
    };

    let frame_ms = params.frame.as_millis() as u64;
    if latest.timestamp_ms.saturating_sub(since) + frame_ms >= params.max_utterance.as_millis() as u64 {
        return VadDecision::Offset(OffsetReason::MaxDuration);
    }

    // Length of the trailing quiet run, counting only readings of this utterance
    let quiet_start = window
        .iter()
        .rev()
        .take_while(|r| r.timestamp_ms >= since && r.smoothed < params.offset)
        .last()
        .map(|r| r.timestamp_ms);

    match quiet_start {
        Some(start) if latest.timestamp_ms - start + frame_ms >= params.silence.as_millis() as u64 => {
            VadDecision::Offset(OffsetReason::Silence)
        }
        _ => VadDecision::Continue,
    }
}

/// Feeds readings through [`detect`] and remembers the utterance start
#[derive(Debug, Clone)]
pub struct LocalTurnDetector {
    params: VadParams,
    window: LevelWindow,
    speaking_since: Option<u64>,
}

impl LocalTurnDetector {
    pub fn new(params: VadParams) -> Self {
        let window = LevelWindow::for_params(&params);
        Self {
            params,
            window,
            speaking_since: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking_since.is_some()
    }

    pub fn observe(&mut self, reading: LevelReading) -> VadDecision {
        self.window.push(reading);

        let decision = detect(&self.window, self.speaking_since, &self.params);
        match decision {
            VadDecision::Onset => self.speaking_since = Some(reading.timestamp_ms),
            VadDecision::Offset(_) => self.speaking_since = None,
            VadDecision::Idle | VadDecision::Continue => {}
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(timestamp_ms: u64, smoothed: f32) -> LevelReading {
        LevelReading {
            rms: smoothed,
            smoothed,
            timestamp_ms,
        }
    }

    fn feed(detector: &mut LocalTurnDetector, levels: &[f32], start_ms: u64) -> Vec<VadDecision> {
        levels
            .iter()
            .enumerate()
            .map(|(i, &level)| detector.observe(reading(start_ms + i as u64 * 100, level)))
            .collect()
    }

    #[test]
    fn test_onset_requires_upper_threshold() {
        let mut detector = LocalTurnDetector::new(VadParams::default());

        let decisions = feed(&mut detector, &[0.01, 0.06, 0.09], 0);

        assert_eq!(decisions, vec![VadDecision::Idle, VadDecision::Idle, VadDecision::Onset]);
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_hysteresis_between_thresholds_keeps_speaking() {
        let mut detector = LocalTurnDetector::new(VadParams::default());
        feed(&mut detector, &[0.2], 0);

        // Between offset and onset for 3s: never silence
        let decisions = feed(&mut detector, &[0.05; 30], 100);

        assert!(decisions.iter().all(|d| *d == VadDecision::Continue));
    }

    #[test]
    fn test_offset_after_silence_debounce() {
        let mut detector = LocalTurnDetector::new(VadParams::default());
        feed(&mut detector, &[0.2, 0.2], 0);

        let decisions = feed(&mut detector, &[0.01; 15], 200);

        assert!(decisions[..14].iter().all(|d| *d == VadDecision::Continue));
        assert_eq!(decisions[14], VadDecision::Offset(OffsetReason::Silence));
        assert!(!detector.is_speaking());
    }

    #[test]
    fn test_speech_resuming_resets_debounce() {
        let mut detector = LocalTurnDetector::new(VadParams::default());
        feed(&mut detector, &[0.2], 0);
        feed(&mut detector, &[0.01; 10], 100);
        feed(&mut detector, &[0.2], 1100);

        let decisions = feed(&mut detector, &[0.01; 14], 1200);

        assert!(decisions.iter().all(|d| *d == VadDecision::Continue));
    }

    #[test]
    fn test_max_utterance_forces_offset() {
        let params = VadParams {
            max_utterance: Duration::from_secs(1),
            ..VadParams::default()
        };
        let mut detector = LocalTurnDetector::new(params);

        let decisions = feed(&mut detector, &[0.3; 10], 0);

        assert_eq!(decisions[0], VadDecision::Onset);
        assert_eq!(decisions[9], VadDecision::Offset(OffsetReason::MaxDuration));
    }

    #[test]
    fn test_pre_onset_silence_does_not_count() {
        let mut detector = LocalTurnDetector::new(VadParams::default());
        feed(&mut detector, &[0.0; 20], 0);

        let decisions = feed(&mut detector, &[0.2, 0.01], 2000);

        assert_eq!(decisions, vec![VadDecision::Onset, VadDecision::Continue]);
    }
}
