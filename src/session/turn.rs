//! Turn-taking state machine.
//!
//! `TurnTaking` is the single owner of the conversation state. All inputs
//! (service events, local turn signals, timers, commands) are funneled into
//! [`TurnTaking::handle`] by one dispatch task, so transitions are applied
//! in order and every side effect of a transition happens before the next
//! input is looked at.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::interrupt::InterruptController;
use super::state::{capture_gain, ConversationState, Session, StateTransition};
use super::stats::{SessionCounters, Speaker, TranscriptSegment};
use crate::audio::{CaptureStop, GainControl, OutputDevice, Ramp};
use crate::config::{Config, TurnDetectionMode};
use crate::error::FailureKind;
use crate::playback::PlaybackScheduler;
use crate::transport::{ClientMessage, ServerEvent, TransportHandle};

/// Notifications for the host application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(StateTransition),
    SessionStarted(Session),
    UserSpeechStarted,
    UserSpeechStopped,
    AgentTranscriptDelta(String),
    Transcript(TranscriptSegment),
    Interrupted,
    Error { kind: FailureKind, message: String },
    Disconnected,
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum Input {
    Connect,
    ConnectFailed { kind: FailureKind, reason: String },
    Remote(ServerEvent),
    LocalSpeechStarted,
    LocalSpeechStopped,
    SettleElapsed,
    TransportClosed,
    /// The capture device failed after the session started
    DeviceFailed(String),
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub duck_gain: f32,
    pub duck_ramp: Duration,
    pub unduck_ramp: Duration,
    pub settle_delay: Duration,
    pub playback_lookahead: usize,
    /// Turn boundaries come from the local detector instead of the service
    pub local_turns: bool,
}

impl From<&Config> for TurnConfig {
    fn from(config: &Config) -> Self {
        let audio = &config.audio;
        Self {
            duck_gain: audio.duck_gain,
            duck_ramp: Duration::from_millis(audio.duck_ramp_ms),
            unduck_ramp: Duration::from_millis(audio.unduck_ramp_ms),
            settle_delay: Duration::from_millis(audio.settle_ms),
            playback_lookahead: audio.playback_lookahead,
            local_turns: config.session.turn_detection.mode == TurnDetectionMode::Local,
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Channels the state machine reports through; shared across sessions
#[derive(Clone)]
pub struct Observers {
    pub state: Arc<watch::Sender<ConversationState>>,
    pub gain: GainControl,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub counters: Arc<SessionCounters>,
}

impl Observers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (state, _) = watch::channel(ConversationState::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let observers = Self {
            state: Arc::new(state),
            gain: GainControl::new(),
            events,
            counters: Arc::new(SessionCounters::default()),
        };
        (observers, events_rx)
    }
}

pub struct TurnTaking {
    state: ConversationState,
    config: TurnConfig,
    observers: Observers,
    transport: TransportHandle,
    scheduler: PlaybackScheduler,
    interrupts: InterruptController,
    capture_stop: Option<CaptureStop>,
    session: Option<Session>,
    agent_transcript: String,
    current_response: Option<String>,
    cancelled_response: Option<String>,
}

impl TurnTaking {
    pub fn new(config: TurnConfig, transport: TransportHandle, observers: Observers) -> Self {
        let scheduler = PlaybackScheduler::new(
            config.playback_lookahead,
            Arc::clone(&observers.counters.playback),
        );
        let interrupts = InterruptController::new(
            transport.clone(),
            observers.gain.clone(),
            config.settle_delay,
            Arc::clone(&observers.counters.interruptions),
        );

        Self {
            state: ConversationState::Disconnected,
            config,
            observers,
            transport,
            scheduler,
            interrupts,
            capture_stop: None,
            session: None,
            agent_transcript: String::new(),
            current_response: None,
            cancelled_response: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn attach_output(&mut self, output: Box<dyn OutputDevice>) {
        self.scheduler.attach(output);
    }

    /// Capture to stop when the session ends
    pub fn attach_capture(&mut self, stop: CaptureStop) {
        self.capture_stop = Some(stop);
    }

    pub fn settle_deadline(&self) -> Option<Instant> {
        match self.state {
            ConversationState::Interrupted => self.interrupts.settle_deadline(),
            _ => None,
        }
    }

    /// Advance playback; called on the dispatch loop's tick
    pub fn pump(&mut self) {
        self.scheduler.pump();
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Connect => {
                if self.state == ConversationState::Disconnected {
                    self.transition(ConversationState::Connecting);
                } else {
                    debug!("Connect ignored in state {}", self.state);
                }
            }
            Input::ConnectFailed { kind, reason } => {
                if self.state == ConversationState::Connecting {
                    self.shutdown(Some((kind, reason)));
                }
            }
            Input::Remote(ServerEvent::RemoteError(reason)) => {
                error!("Service reported error: {}", reason);
                self.shutdown(Some((FailureKind::SessionError, reason)));
            }
            Input::Remote(event) => self.on_remote(event),
            Input::LocalSpeechStarted => self.on_user_speech_started(),
            Input::LocalSpeechStopped => {
                if self.on_user_speech_stopped() {
                    self.transport.send_control(ClientMessage::InputAudioBufferCommit);
                    self.transport.send_control(ClientMessage::ResponseCreate);
                }
            }
            Input::SettleElapsed => {
                if self.state == ConversationState::Interrupted {
                    self.interrupts.clear();
                    self.transition(ConversationState::Listening);
                }
            }
            Input::TransportClosed => {
                if self.state != ConversationState::Disconnected {
                    warn!("Transport closed in state {}", self.state);
                    self.shutdown(Some((
                        FailureKind::SessionError,
                        "connection closed by service".to_string(),
                    )));
                }
            }
            Input::DeviceFailed(reason) => {
                if self.state != ConversationState::Disconnected {
                    self.shutdown(Some((FailureKind::DeviceUnavailable, reason)));
                }
            }
            Input::Disconnect => self.shutdown(None),
        }
    }

    fn on_remote(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionReady { session_id, voice } => {
                if self.state != ConversationState::Connecting {
                    debug!("Session ready ignored in state {}", self.state);
                    return;
                }
                let session = Session::new(session_id, voice);
                info!("Session {} ready", session.id);
                self.emit(EngineEvent::SessionStarted(session.clone()));
                self.session = Some(session);
                self.transition(ConversationState::Connected);
                self.transition(ConversationState::Listening);
            }
            ServerEvent::UserSpeechStarted => self.on_user_speech_started(),
            ServerEvent::UserSpeechStopped => {
                self.on_user_speech_stopped();
            }
            ServerEvent::AudioBufferCommitted => {
                if self.state == ConversationState::Listening {
                    self.transition(ConversationState::Processing);
                }
            }
            ServerEvent::AgentAudioDelta { response_id, audio } => {
                self.on_agent_audio(response_id, &audio)
            }
            ServerEvent::AgentTranscriptDelta(text) => {
                if matches!(
                    self.state,
                    ConversationState::Processing | ConversationState::AgentSpeaking
                ) {
                    self.agent_transcript.push_str(&text);
                    self.emit(EngineEvent::AgentTranscriptDelta(text));
                }
            }
            ServerEvent::AgentTurnComplete { response_id } => self.on_turn_complete(response_id),
            ServerEvent::UserTranscriptFinal(text) => {
                if !text.trim().is_empty() {
                    self.emit_segment(Speaker::User, text, false);
                }
            }
            ServerEvent::RemoteError(_) => {}
        }
    }

    fn on_user_speech_started(&mut self) {
        match self.state {
            ConversationState::Listening => {}
            ConversationState::Processing => {
                self.transition(ConversationState::Listening);
            }
            ConversationState::AgentSpeaking => self.barge_in(),
            // Tail of the onset that caused the barge-in
            ConversationState::Interrupted => return,
            _ => {
                debug!("Speech start ignored in state {}", self.state);
                return;
            }
        }
        self.emit(EngineEvent::UserSpeechStarted);
    }

    /// Returns whether the user's turn ended here
    fn on_user_speech_stopped(&mut self) -> bool {
        if self.state != ConversationState::Listening {
            debug!("Speech stop in state {}", self.state);
            return false;
        }
        self.transition(ConversationState::Processing);
        self.emit(EngineEvent::UserSpeechStopped);
        true
    }

    fn barge_in(&mut self) {
        self.transition(ConversationState::Interrupted);
        self.cancelled_response = self.current_response.take();
        self.interrupts.on_barge_in(&mut self.scheduler);

        let said = std::mem::take(&mut self.agent_transcript);
        if !said.is_empty() {
            self.emit_segment(Speaker::Agent, said, true);
        }
        self.emit(EngineEvent::Interrupted);
    }

    fn on_agent_audio(&mut self, response_id: Option<String>, audio: &[u8]) {
        if response_id.is_some() && response_id == self.cancelled_response {
            debug!("Dropping audio of cancelled response");
            return;
        }

        match self.state {
            ConversationState::Listening | ConversationState::Processing => {
                self.current_response = response_id;
                self.transition(ConversationState::AgentSpeaking);
            }
            ConversationState::AgentSpeaking => {
                if self.current_response.is_none() {
                    self.current_response = response_id;
                }
            }
            ConversationState::Interrupted => {
                debug!("Dropping agent audio while interrupted");
                return;
            }
            _ => {
                debug!("Agent audio ignored in state {}", self.state);
                return;
            }
        }

        // Malformed chunks are counted and logged by the scheduler
        let _ = self.scheduler.enqueue(audio);
        self.scheduler.pump();
    }

    fn on_turn_complete(&mut self, response_id: Option<String>) {
        if response_id.is_some() && response_id == self.cancelled_response {
            self.cancelled_response = None;
            return;
        }

        match self.state {
            ConversationState::AgentSpeaking | ConversationState::Processing => {
                self.transition(ConversationState::Listening);
            }
            ConversationState::Listening => {}
            // Settle timer owns the way out of Interrupted
            ConversationState::Interrupted => {
                self.agent_transcript.clear();
                return;
            }
            _ => return,
        }

        self.current_response = None;
        let said = std::mem::take(&mut self.agent_transcript);
        if !said.is_empty() {
            self.emit_segment(Speaker::Agent, said, false);
        }
    }

    /// Release everything and land in `Disconnected`; safe to call repeatedly
    fn shutdown(&mut self, failure: Option<(FailureKind, String)>) {
        let was = self.state;

        self.interrupts.clear();
        self.scheduler.close();
        self.transport.close();
        if let Some(stop) = self.capture_stop.take() {
            stop.stop();
        }
        self.agent_transcript.clear();
        self.current_response = None;
        self.cancelled_response = None;
        self.session = None;

        self.transition(ConversationState::Disconnected);

        if let Some((kind, message)) = failure {
            error!("Session ended: {}: {}", kind, message);
            self.emit(EngineEvent::Error { kind, message });
        }
        if was != ConversationState::Disconnected {
            self.emit(EngineEvent::Disconnected);
        }
    }

    fn transition(&mut self, to: ConversationState) -> bool {
        if self.state == to {
            return false;
        }

        let from = self.state;
        self.state = to;
        self.observers.state.send_replace(to);
        self.apply_gain(to);

        info!("Voice state: {} → {}", from, to);
        self.emit(EngineEvent::StateChanged(StateTransition {
            from,
            to,
            at: Utc::now(),
        }));
        true
    }

    fn apply_gain(&self, state: ConversationState) {
        let target = capture_gain(state, self.config.duck_gain);
        let ramp = match state {
            ConversationState::Interrupted => Ramp::Immediate,
            ConversationState::AgentSpeaking => Ramp::Smooth(self.config.duck_ramp),
            _ => Ramp::Smooth(self.config.unduck_ramp),
        };
        self.observers.gain.set(target, ramp);
    }

    fn emit_segment(&self, speaker: Speaker, text: String, partial: bool) {
        self.emit(EngineEvent::Transcript(TranscriptSegment {
            speaker,
            text,
            timestamp: Utc::now(),
            partial,
        }));
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine
        let _ = self.observers.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use tokio::sync::mpsc::error::TryRecvError;

    fn machine() -> (
        TurnTaking,
        mpsc::Receiver<ClientMessage>,
        mpsc::UnboundedReceiver<EngineEvent>,
        Observers,
    ) {
        let (handle, outbound) = TransportHandle::channel(16);
        handle.mark_open();
        let (observers, events) = Observers::new();
        let turn = TurnTaking::new(TurnConfig::default(), handle, observers.clone());
        (turn, outbound, events, observers)
    }

    fn ready(turn: &mut TurnTaking) {
        turn.handle(Input::Connect);
        turn.handle(Input::Remote(ServerEvent::SessionReady {
            session_id: Some("sess_1".into()),
            voice: None,
        }));
    }

    fn delta(id: &str) -> Input {
        Input::Remote(ServerEvent::AgentAudioDelta {
            response_id: Some(id.to_string()),
            audio: codec::pcm16_to_bytes(&[0i16; 240]),
        })
    }

    fn drain(outbound: &mut mpsc::Receiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        loop {
            match outbound.try_recv() {
                Ok(message) => sent.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return sent,
            }
        }
    }

    #[test]
    fn test_session_ready_reaches_listening() {
        let (mut turn, _outbound, mut events, observers) = machine();
        ready(&mut turn);

        assert_eq!(turn.state(), ConversationState::Listening);
        assert_eq!(*observers.state.borrow(), ConversationState::Listening);
        assert_eq!(turn.session().map(|s| s.id.as_str()), Some("sess_1"));

        let mut path = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::StateChanged(t) = event {
                path.push(t.to);
            }
        }
        assert_eq!(
            path,
            vec![
                ConversationState::Connecting,
                ConversationState::Connected,
                ConversationState::Listening
            ]
        );
    }

    #[test]
    fn test_agent_audio_ducks_capture() {
        let (mut turn, _outbound, _events, observers) = machine();
        ready(&mut turn);

        turn.handle(delta("resp_1"));
        assert_eq!(turn.state(), ConversationState::AgentSpeaking);
        assert_eq!(observers.gain.current().target, 0.2);

        turn.handle(Input::Remote(ServerEvent::AgentTurnComplete {
            response_id: Some("resp_1".into()),
        }));
        assert_eq!(turn.state(), ConversationState::Listening);
        assert_eq!(observers.gain.current().target, 1.0);
    }

    #[test]
    fn test_barge_in_cancels_once() {
        let (mut turn, mut outbound, _events, observers) = machine();
        ready(&mut turn);
        drain(&mut outbound);

        turn.handle(delta("resp_1"));
        turn.handle(Input::Remote(ServerEvent::UserSpeechStarted));
        turn.handle(Input::Remote(ServerEvent::UserSpeechStarted));

        assert_eq!(turn.state(), ConversationState::Interrupted);
        assert_eq!(observers.gain.current().target, 1.0);
        assert_eq!(observers.gain.current().ramp, Ramp::Immediate);
        assert!(turn.scheduler().is_idle());

        let cancels = drain(&mut outbound)
            .into_iter()
            .filter(|m| *m == ClientMessage::ResponseCancel)
            .count();
        assert_eq!(cancels, 1);
        assert!(turn.settle_deadline().is_some());
    }

    #[test]
    fn test_stale_audio_dropped_after_interrupt() {
        let (mut turn, _outbound, _events, _observers) = machine();
        ready(&mut turn);

        turn.handle(delta("resp_1"));
        turn.handle(Input::Remote(ServerEvent::UserSpeechStarted));
        turn.handle(delta("resp_1"));
        assert!(turn.scheduler().is_idle());

        turn.handle(Input::SettleElapsed);
        assert_eq!(turn.state(), ConversationState::Listening);

        // Late delta of the cancelled response must not restart playback
        turn.handle(delta("resp_1"));
        assert_eq!(turn.state(), ConversationState::Listening);

        turn.handle(delta("resp_2"));
        assert_eq!(turn.state(), ConversationState::AgentSpeaking);
    }

    #[test]
    fn test_local_turn_end_commits() {
        let (handle, mut outbound) = TransportHandle::channel(16);
        handle.mark_open();
        let (observers, _events) = Observers::new();
        let config = TurnConfig {
            local_turns: true,
            ..TurnConfig::default()
        };
        let mut turn = TurnTaking::new(config, handle, observers);
        ready(&mut turn);

        turn.handle(Input::LocalSpeechStarted);
        turn.handle(Input::LocalSpeechStopped);

        assert_eq!(turn.state(), ConversationState::Processing);
        assert_eq!(
            drain(&mut outbound),
            vec![ClientMessage::InputAudioBufferCommit, ClientMessage::ResponseCreate]
        );
    }

    #[test]
    fn test_remote_error_disconnects() {
        let (mut turn, _outbound, mut events, _observers) = machine();
        ready(&mut turn);
        while events.try_recv().is_ok() {}

        turn.handle(Input::Remote(ServerEvent::RemoteError("boom".into())));
        assert_eq!(turn.state(), ConversationState::Disconnected);

        let mut saw_error = false;
        let mut saw_disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Error { kind, message } => {
                    assert_eq!(kind, FailureKind::SessionError);
                    assert_eq!(message, "boom");
                    saw_error = true;
                }
                EngineEvent::Disconnected => saw_disconnected = true,
                _ => {}
            }
        }
        assert!(saw_error && saw_disconnected);

        // Second shutdown is quiet
        turn.handle(Input::Disconnect);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_device_failure_ends_session() {
        let (mut turn, mut outbound, mut events, observers) = machine();
        ready(&mut turn);
        turn.handle(delta("resp_1"));
        drain(&mut outbound);
        while events.try_recv().is_ok() {}

        turn.handle(Input::DeviceFailed("microphone unplugged".into()));

        assert_eq!(turn.state(), ConversationState::Disconnected);
        assert!(turn.scheduler().is_idle());
        assert_eq!(observers.gain.current().target, 1.0);

        let events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(events.contains(&EngineEvent::Error {
            kind: FailureKind::DeviceUnavailable,
            message: "microphone unplugged".into(),
        }));
        assert_eq!(events.last(), Some(&EngineEvent::Disconnected));

        // A late failure report after shutdown is ignored
        turn.handle(Input::DeviceFailed("again".into()));
        assert_eq!(turn.state(), ConversationState::Disconnected);
    }
}
