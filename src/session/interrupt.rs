//! Barge-in handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::audio::GainControl;
use crate::playback::PlaybackScheduler;
use crate::transport::{ClientMessage, TransportHandle};

/// Cancels the agent's turn when the user talks over it
///
/// The state machine calls [`InterruptController::on_barge_in`] once per
/// detected barge-in; the settle deadline it returns keeps the machine in
/// `Interrupted` long enough to ignore the tail of the same speech onset.
pub struct InterruptController {
    transport: TransportHandle,
    gain: GainControl,
    settle_delay: Duration,
    settle_deadline: Option<Instant>,
    interruptions: Arc<AtomicUsize>,
}

impl InterruptController {
    pub fn new(
        transport: TransportHandle,
        gain: GainControl,
        settle_delay: Duration,
        interruptions: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            transport,
            gain,
            settle_delay,
            settle_deadline: None,
            interruptions,
        }
    }

    pub fn on_barge_in(&mut self, scheduler: &mut PlaybackScheduler) -> Instant {
        // Best-effort; a stale in-flight turn is acceptable to lose
        self.transport.send_control(ClientMessage::ResponseCancel);

        let discarded = scheduler.flush();
        self.gain.restore_immediately();

        let deadline = Instant::now() + self.settle_delay;
        self.settle_deadline = Some(deadline);
        self.interruptions.fetch_add(1, Ordering::Relaxed);

        info!(
            "Barge-in: agent turn cancelled, {} chunks discarded, settling for {:?}",
            discarded, self.settle_delay
        );
        deadline
    }

    /// When the state machine should return to listening, if a barge-in is settling
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_deadline
    }

    pub fn clear(&mut self) {
        self.settle_deadline = None;
    }
}
