//! The public face of the crate: [`VoiceEngine`].

use std::future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::state::ConversationState;
use super::stats::SessionStats;
use super::turn::{EngineEvent, Input, Observers, TurnConfig, TurnTaking};
use crate::audio::{
    AudioDevices, AudioFrame, CapturePipeline, GainControl, LevelReading, LocalTurnDetector, VadDecision,
};
use crate::config::{Config, TurnDetectionMode};
use crate::error::{DeviceError, EngineError};
use crate::transport::{
    ClientMessage, ServerEvent, SessionParams, TransportCounters, TransportHandle,
    TransportSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalTurn {
    Started,
    Stopped,
}

/// Everything one connection owns
struct ActiveSession {
    transport: TransportSession,
    capture: CapturePipeline,
    shutdown: Option<oneshot::Sender<()>>,
    dispatch: JoinHandle<()>,
    counters: Arc<TransportCounters>,
    started_at: DateTime<Utc>,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        !self.dispatch.is_finished()
    }

    async fn teardown(mut self, state: &watch::Sender<ConversationState>) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.dispatch).await {
            error!("Dispatch task failed: {}", e);
            state.send_replace(ConversationState::Disconnected);
        }
        self.capture.stop().await;
        self.transport.disconnect().await;
    }
}

/// Duplex voice conversation engine
///
/// Owns the capture pipeline, the transport session and (through the
/// dispatch task) the playback scheduler for the lifetime of a connection.
/// Hosts observe it through [`VoiceEngine::subscribe_state`],
/// [`VoiceEngine::subscribe_level`] and the [`EngineEvent`] stream.
pub struct VoiceEngine {
    config: Config,
    devices: Arc<dyn AudioDevices>,
    observers: Observers,
    events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    level: Arc<watch::Sender<LevelReading>>,
    handle: Option<TransportHandle>,
    active: Option<ActiveSession>,
}

impl VoiceEngine {
    pub fn new(config: Config, devices: Arc<dyn AudioDevices>) -> Self {
        let (observers, events) = Observers::new();
        let (level, _) = watch::channel(LevelReading::default());

        Self {
            config,
            devices,
            observers,
            events: Some(events),
            level: Arc::new(level),
            handle: None,
            active: None,
        }
    }

    /// Open devices and the service session, then start the conversation
    ///
    /// Returns once the transport is up; the move to `Listening` follows
    /// when the service confirms the session. On failure every resource
    /// acquired so far is released and the state returns to `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        if self.active.as_ref().is_some_and(ActiveSession::is_live) {
            return Err(EngineError::AlreadyActive);
        }
        if let Some(stale) = self.active.take() {
            debug!("Cleaning up ended session");
            stale.teardown(&self.observers.state).await;
        }

        if self.events.take().is_some() {
            // An untaken stream is never drained
            debug!("Event stream not taken before connect, discarding events");
        }

        info!("Connecting voice session");
        let (handle, outbound) = TransportHandle::channel(self.config.transport.outbound_queue);
        let mut turn = TurnTaking::new(
            TurnConfig::from(&self.config),
            handle.clone(),
            self.observers.clone(),
        );
        turn.handle(Input::Connect);

        let (local_tx, local_rx) = match self.config.session.turn_detection.mode {
            TurnDetectionMode::Local => {
                let (tx, rx) = mpsc::channel(8);
                (Some(tx), Some(rx))
            }
            TurnDetectionMode::Server => (None, None),
        };

        let (mut transport, mut capture) =
            match self.open_session(&mut turn, handle.clone(), outbound, local_tx).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("Connect failed: {}", e);
                    turn.handle(Input::ConnectFailed {
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            };

        let Some(events) = transport.take_events() else {
            turn.handle(Input::Disconnect);
            return Err(EngineError::Session("transport event stream unavailable".into()));
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inputs = DispatchInputs {
            events,
            local_turns: local_rx,
            device_failure: capture.take_failure(),
            shutdown: shutdown_rx,
        };
        let pump_interval = Duration::from_millis(self.config.audio.pump_interval_ms.max(1));
        let dispatch = tokio::spawn(run_dispatch(turn, inputs, pump_interval));

        self.active = Some(ActiveSession {
            transport,
            capture,
            shutdown: Some(shutdown_tx),
            dispatch,
            counters: handle.counters(),
            started_at: Utc::now(),
        });
        self.handle = Some(handle);
        Ok(())
    }

    async fn open_session(
        &self,
        turn: &mut TurnTaking,
        handle: TransportHandle,
        outbound: mpsc::Receiver<ClientMessage>,
        local_turns: Option<mpsc::Sender<LocalTurn>>,
    ) -> Result<(TransportSession, CapturePipeline), EngineError> {
        turn.attach_output(self.devices.open_output()?);

        let backend = self.devices.open_capture()?;
        let mut capture = CapturePipeline::new(
            backend,
            self.config.audio.capture_config(),
            self.observers.gain.clone(),
        );

        let on_frame = {
            let handle = handle.clone();
            move |frame: AudioFrame| handle.send_audio(frame)
        };
        let on_level = {
            let level = Arc::clone(&self.level);
            let mut detector = local_turns.map(|tx| {
                let params = self.config.local_vad.params(self.config.audio.frame_ms);
                (LocalTurnDetector::new(params), tx)
            });
            move |reading: LevelReading| {
                level.send_replace(reading);
                if let Some((detector, tx)) = detector.as_mut() {
                    let signal = match detector.observe(reading) {
                        VadDecision::Onset => LocalTurn::Started,
                        VadDecision::Offset(_) => LocalTurn::Stopped,
                        VadDecision::Idle | VadDecision::Continue => return,
                    };
                    if tx.try_send(signal).is_err() {
                        warn!("Local turn signal dropped: {:?}", signal);
                    }
                }
            }
        };

        capture.start(on_frame, on_level).await?;
        turn.attach_capture(capture.stop_handle());

        let params = SessionParams::from_settings(&self.config.session);
        match TransportSession::open(&self.config.transport, params, handle, outbound).await {
            Ok(transport) => Ok((transport, capture)),
            Err(e) => {
                capture.stop().await;
                Err(e.into())
            }
        }
    }

    /// End the conversation and release every resource; idempotent
    pub async fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            debug!("Disconnect with no active session");
            return;
        };

        info!("Disconnecting voice session");
        active.teardown(&self.observers.state).await;
        self.handle = None;
    }

    pub fn state(&self) -> ConversationState {
        *self.observers.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.observers.state.subscribe()
    }

    /// Input level readings, one per capture frame
    pub fn subscribe_level(&self) -> watch::Receiver<LevelReading> {
        self.level.subscribe()
    }

    pub fn gain(&self) -> GainControl {
        self.observers.gain.clone()
    }

    /// The event stream; can be taken once
    ///
    /// Take it before the first `connect`. A stream nobody took by then is
    /// discarded, and later calls return `None`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.take()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected() && self.handle.as_ref().is_some_and(TransportHandle::is_open)
    }

    /// Close the user's turn manually (`input_audio_buffer.commit`)
    pub fn commit_audio(&self) {
        self.send_control(ClientMessage::InputAudioBufferCommit);
    }

    /// Ask the agent to respond now (`response.create`)
    pub fn request_response(&self) {
        self.send_control(ClientMessage::ResponseCreate);
    }

    /// Best-effort control message; dropped when not connected
    pub fn send_control(&self, message: ClientMessage) {
        match &self.handle {
            Some(handle) => handle.send_control(message),
            None => debug!("Not connected, dropping control message"),
        }
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.observers.counters;
        let (started_at, frames_sent, frames_dropped, controls_dropped) = match &self.active {
            Some(active) => (
                Some(active.started_at),
                active.counters.frames_sent.load(Ordering::Relaxed),
                active.counters.frames_dropped.load(Ordering::Relaxed),
                active.counters.controls_dropped.load(Ordering::Relaxed),
            ),
            None => (None, 0, 0, 0),
        };
        let duration_secs = started_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        SessionStats {
            state: self.state(),
            started_at,
            duration_secs,
            frames_sent,
            frames_dropped,
            controls_dropped,
            chunks_played: counters.playback.chunks_played.load(Ordering::Relaxed),
            chunks_flushed: counters.playback.chunks_flushed.load(Ordering::Relaxed),
            chunks_malformed: counters.playback.chunks_malformed.load(Ordering::Relaxed),
            interruptions: counters.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Sources the dispatch task listens on besides its timers
struct DispatchInputs {
    events: mpsc::Receiver<ServerEvent>,
    local_turns: Option<mpsc::Receiver<LocalTurn>>,
    device_failure: Option<oneshot::Receiver<DeviceError>>,
    shutdown: oneshot::Receiver<()>,
}

/// Single consumer of every state machine input
async fn run_dispatch(mut turn: TurnTaking, inputs: DispatchInputs, pump_interval: Duration) {
    let DispatchInputs {
        mut events,
        mut local_turns,
        mut device_failure,
        mut shutdown,
    } = inputs;
    let mut pump = tokio::time::interval(pump_interval);
    pump.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let settle = turn.settle_deadline();

        tokio::select! {
            // Sender dropped counts as a disconnect too
            _ = &mut shutdown => turn.handle(Input::Disconnect),
            event = events.recv() => match event {
                Some(event) => turn.handle(Input::Remote(event)),
                None => turn.handle(Input::TransportClosed),
            },
            signal = next_local_turn(&mut local_turns) => turn.handle(match signal {
                LocalTurn::Started => Input::LocalSpeechStarted,
                LocalTurn::Stopped => Input::LocalSpeechStopped,
            }),
            e = next_device_failure(&mut device_failure) => {
                turn.handle(Input::DeviceFailed(e.to_string()))
            }
            _ = sleep_until(settle) => turn.handle(Input::SettleElapsed),
            _ = pump.tick() => turn.pump(),
        }

        if turn.state() == ConversationState::Disconnected {
            break;
        }
    }

    debug!("Dispatch loop stopped");
}

async fn next_local_turn(rx: &mut Option<mpsc::Receiver<LocalTurn>>) -> LocalTurn {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(signal) => signal,
            None => future::pending().await,
        },
        None => future::pending().await,
    }
}

/// Pending forever once the capture task ended without a failure
async fn next_device_failure(rx: &mut Option<oneshot::Receiver<DeviceError>>) -> DeviceError {
    let Some(pending) = rx.as_mut() else {
        return future::pending().await;
    };
    let result = pending.await;
    *rx = None;
    match result {
        Ok(e) => e,
        Err(_) => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
