use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::messages::{ClientMessage, ServerEvent, SessionParams};
use super::token::fetch_session_token;
use crate::audio::AudioFrame;
use crate::config::TransportSettings;
use crate::error::ConnectError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport counters, shared with the session stats
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub controls_dropped: AtomicUsize,
}

/// Cheap, cloneable sending side of a transport session
///
/// Every send is best-effort and never waits: while the stream is not open
/// sends are no-ops, and when the outbound queue is full the message is
/// dropped. Audio freshness beats delivery completeness.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<ClientMessage>,
    open: Arc<AtomicBool>,
    closing: Arc<Notify>,
    counters: Arc<TransportCounters>,
}

impl TransportHandle {
    /// A closed handle and the queue its messages land in
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            outbound: tx,
            open: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(Notify::new()),
            counters: Arc::new(TransportCounters::default()),
        };
        (handle, rx)
    }

    /// Start accepting sends
    pub fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        Arc::clone(&self.counters)
    }

    /// Queue one captured frame; the frame is consumed either way
    pub fn send_audio(&self, frame: AudioFrame) {
        if !self.is_open() {
            return;
        }

        match self.outbound.try_send(ClientMessage::append_audio(&frame.samples)) {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Outbound queue full, dropped frame {}", frame.sequence);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn send_control(&self, message: ClientMessage) {
        if !self.is_open() {
            debug!("Transport not open, skipping {:?}", message);
            return;
        }

        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.counters.controls_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Outbound queue full, dropped {:?}", message);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stop accepting sends and ask the writer to close the stream
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closing.notify_one();
    }
}

/// Bidirectional stream to the realtime conversation service
pub struct TransportSession {
    handle: TransportHandle,
    events: Option<mpsc::Receiver<ServerEvent>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Open a session with a fresh outbound queue
    pub async fn connect(
        settings: &TransportSettings,
        params: SessionParams,
    ) -> Result<Self, ConnectError> {
        let (handle, outbound) = TransportHandle::channel(settings.outbound_queue);
        Self::open(settings, params, handle, outbound).await
    }

    /// Open a session that drains an existing handle's queue
    ///
    /// Resolves credentials, performs the WebSocket handshake and sends
    /// `session.update` before the handle is marked open.
    pub async fn open(
        settings: &TransportSettings,
        params: SessionParams,
        handle: TransportHandle,
        outbound: mpsc::Receiver<ClientMessage>,
    ) -> Result<Self, ConnectError> {
        let (url, token) = resolve_endpoint(settings).await?;
        let url = match &settings.model {
            Some(model) if !url.contains("model=") => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{}{}model={}", url, sep, model)
            }
            _ => url,
        };

        info!("Connecting to realtime service at {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Unreachable(format!("invalid realtime url: {}", e)))?;
        let headers = request.headers_mut();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ConnectError::Unauthorized("token is not a valid header value".into()))?;
            headers.insert("Authorization", value);
        }
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _response) = tokio::time::timeout(
            settings.connect_timeout(),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ConnectError::Unreachable("handshake timed out".into()))?
        .map_err(classify_handshake_error)?;

        let (mut sink, stream) = ws.split();

        let update = serde_json::to_string(&ClientMessage::SessionUpdate { session: params })
            .map_err(|e| ConnectError::Unreachable(format!("failed to encode session.update: {}", e)))?;
        sink.send(Message::Text(update))
            .await
            .map_err(|e| ConnectError::Unreachable(format!("failed to send session.update: {}", e)))?;

        info!("Connected to realtime service, session parameters sent");

        let (events_tx, events_rx) = mpsc::channel(256);
        handle.mark_open();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            Arc::clone(&handle.closing),
            Arc::clone(&handle.open),
        ));
        let reader = tokio::spawn(read_loop(stream, events_tx, Arc::clone(&handle.open)));

        Ok(Self {
            handle,
            events: Some(events_rx),
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn send_audio(&self, frame: AudioFrame) {
        self.handle.send_audio(frame);
    }

    pub fn send_control(&self, message: ClientMessage) {
        self.handle.send_control(message);
    }

    /// Typed event channel; closes when the stream ends. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events.take()
    }

    /// Close the stream and stop both I/O tasks. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.handle.close();

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                warn!("Transport writer did not finish in time");
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
            info!("Transport disconnected");
        }

        self.events = None;
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Realtime URL and bearer token, from the token endpoint or direct settings
async fn resolve_endpoint(
    settings: &TransportSettings,
) -> Result<(String, Option<String>), ConnectError> {
    if let Some(endpoint) = &settings.token_endpoint {
        let client = reqwest::Client::builder()
            .timeout(settings.connect_timeout())
            .build()
            .map_err(|e| ConnectError::Unreachable(format!("http client: {}", e)))?;
        let token = fetch_session_token(&client, endpoint).await?;
        return Ok((token.url, Some(token.token)));
    }

    match &settings.url {
        Some(url) => Ok((url.clone(), settings.api_key.clone())),
        None => Err(ConnectError::Unreachable(
            "no token endpoint or realtime url configured".into(),
        )),
    }
}

fn classify_handshake_error(e: tungstenite::Error) -> ConnectError {
    match e {
        tungstenite::Error::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            ConnectError::Unauthorized(format!("handshake rejected with {}", response.status()))
        }
        other => ConnectError::Unreachable(other.to_string()),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    closing: Arc<Notify>,
    open: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = closing.notified() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };

                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Transport send failed: {}", e);
                    break;
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    if let Err(e) = sink.close().await {
        debug!("Transport close: {}", e);
    }
    debug!("Transport writer stopped");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<ServerEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match ServerEvent::parse(&text) {
                Ok(Some(event)) => {
                    debug!("Received {}", event.name());
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let preview: String = text.chars().take(80).collect();
                    debug!("Ignoring unrecognized event: {}", preview);
                }
                Err(e) => warn!("Dropping incoming event: {}", e),
            },
            Ok(Message::Close(frame)) => {
                info!("Transport closed by remote: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Transport receive failed: {}", e);
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    debug!("Transport reader stopped");
}
