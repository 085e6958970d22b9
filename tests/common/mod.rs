// Shared fixtures: WAV files and a scripted realtime service
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

pub const TOKEN: &str = "ephemeral-test-token";

/// Pushed through [`MockService::send`] to make the service hang up
pub const HANG_UP: &str = "__hang_up__";

/// Write a 24 kHz mono 16-bit WAV of a constant-amplitude square wave
pub fn write_wav(path: &Path, seconds: f32, amplitude: i16) {
    write_wav_at(path, 24_000, 1, seconds, amplitude);
}

/// Same square wave at any rate and channel count
pub fn write_wav_at(path: &Path, sample_rate: u32, channels: u16, seconds: f32, amplitude: i16) {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let frames = (seconds * sample_rate as f32) as usize;
    let period = (sample_rate / 1000) as usize;
    for i in 0..frames {
        let sample = if (i / period) % 2 == 0 { amplitude } else { -amplitude };
        for _ in 0..channels {
            writer.write_sample(sample).unwrap();
        }
    }
    writer.finalize().unwrap();
}

/// Base64 PCM16 payload for a `response.audio.delta`
pub fn audio_delta(response_id: &str, samples: usize) -> String {
    let pcm: Vec<i16> = (0..samples).map(|i| ((i % 100) as i16 - 50) * 100).collect();
    let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "delta": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
    })
    .to_string()
}

pub fn event(kind: &str) -> String {
    json!({ "type": kind }).to_string()
}

#[derive(Clone)]
struct MockState {
    addr: SocketAddr,
    received: mpsc::UnboundedSender<Value>,
    script: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

/// In-process realtime service
///
/// Answers `session.update` with `session.created`, forwards every client
/// message to `received` and pushes whatever the test sends through `push`.
pub struct MockService {
    pub addr: SocketAddr,
    pub received: mpsc::UnboundedReceiver<Value>,
    pub push: mpsc::UnboundedSender<String>,
}

impl MockService {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, script) = mpsc::unbounded_channel();
        let state = MockState {
            addr,
            received: received_tx,
            script: Arc::new(Mutex::new(Some(script))),
        };

        let app = Router::new()
            .route("/token", post(issue_token))
            .route("/denied", post(deny_token))
            .route("/v1/realtime", get(upgrade))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, received, push }
    }

    pub fn token_endpoint(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub fn denied_endpoint(&self) -> String {
        format!("http://{}/denied", self.addr)
    }

    pub fn realtime_url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn send(&self, text: String) {
        self.push.send(text).unwrap();
    }

    /// Next client message of the given type, skipping others
    pub async fn expect(&mut self, kind: &str) -> Value {
        let wait = async {
            loop {
                let message = self.received.recv().await.expect("mock service stopped");
                if message["type"] == kind {
                    return message;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {} within 5s", kind))
    }
}

async fn issue_token(State(state): State<MockState>) -> Json<Value> {
    Json(json!({
        "token": TOKEN,
        "url": format!("ws://{}/v1/realtime", state.addr),
        "expires_at": 1_900_000_000,
    }))
}

async fn deny_token() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

async fn upgrade(State(state): State<MockState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(mut socket: WebSocket, state: MockState) {
    let Some(mut script) = state.script.lock().await.take() else {
        return;
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let message: Value = serde_json::from_str(&text).unwrap();
                    let reply = (message["type"] == "session.update").then(|| {
                        json!({
                            "type": "session.created",
                            "session": { "id": "sess_mock", "voice": message["session"]["voice"] },
                        })
                        .to_string()
                    });
                    let _ = state.received.send(message);
                    if let Some(reply) = reply {
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = script.recv() => match outgoing {
                Some(text) if text == HANG_UP => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    *state.script.lock().await = Some(script);
}
