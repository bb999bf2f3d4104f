//! Shared fixtures: a scripted voice agent and a one-shot HTTP backend.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use health_voice::audio::virtual_device::{VirtualInput, VirtualOutput};
use health_voice::audio::{AudioDevices, CaptureConfig};
use health_voice::transport::{AgentConfig, Endpoint, ResponseModality, TransportOptions};
use health_voice::SessionOptions;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the mock answers `setup`
#[derive(Debug, Clone)]
pub enum SetupReply {
    Complete,
    Error(String),
    Nothing,
}

/// A voice agent on a local WebSocket. Accepts one connection.
pub struct MockAgent {
    port: u16,
    received: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl MockAgent {
    pub async fn start() -> Self {
        Self::with_setup_reply(SetupReply::Complete).await
    }

    pub async fn with_setup_reply(reply: SetupReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
            let (mut write, mut read) = ws.split();

            loop {
                tokio::select! {
                    incoming = read.next() => {
                        let text = match incoming {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                            Some(Ok(_)) => continue,
                        };
                        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                        if value.get("setup").is_some() {
                            let answer = match &reply {
                                SetupReply::Complete => Some(json!({ "setupComplete": {} })),
                                SetupReply::Error(message) => {
                                    Some(json!({ "error": { "code": 400, "message": message } }))
                                }
                                SetupReply::Nothing => None,
                            };
                            if let Some(answer) = answer {
                                let _ = write.send(Message::Text(answer.to_string())).await;
                            }
                        }
                        let _ = received_tx.send(value);
                    }
                    message = outbound_rx.recv() => match message {
                        Some(Message::Close(frame)) => {
                            let _ = write.send(Message::Close(frame)).await;
                            break;
                        }
                        Some(message) => {
                            if write.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            port,
            received,
            outbound,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(format!("ws://127.0.0.1:{}/live", self.port), "test-key")
    }

    /// Next client message, or panic after `WAIT`.
    pub async fn next_message(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("mock agent connection ended")
    }

    /// Skip client messages until one has `key` at the top level.
    pub async fn next_with(&mut self, key: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message.get(key).is_some() {
                return message;
            }
        }
    }

    /// Client message arriving within `wait`, if any.
    pub async fn try_next(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.received.recv()).await.ok().flatten()
    }

    pub fn send(&self, message: Value) {
        let _ = self.outbound.send(Message::Text(message.to_string()));
    }

    pub fn send_audio(&self, samples: &[i16]) {
        self.send(json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": encode_samples(samples) } }]
                }
            }
        }));
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

pub fn encode_samples(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

pub fn decode_chunk(message: &Value) -> Vec<u8> {
    let data = message["realtimeInput"]["mediaChunks"][0]["data"]
        .as_str()
        .expect("audio chunk data");
    STANDARD.decode(data).unwrap()
}

pub fn agent_config() -> AgentConfig {
    AgentConfig {
        model: "models/test-model".to_string(),
        system_instruction: "You are a friendly health companion.".to_string(),
        voice: "Aoede".to_string(),
        response_modality: ResponseModality::Audio,
        tools: Vec::new(),
    }
}

pub fn session_options(endpoint: Endpoint) -> SessionOptions {
    SessionOptions {
        endpoint,
        agent: agent_config(),
        transport: TransportOptions {
            connect_timeout: Duration::from_secs(2),
            setup_timeout: Duration::from_secs(2),
        },
        capture: CaptureConfig::default(),
        recorder: None,
        kickoff_message: None,
    }
}

pub struct VirtualRig {
    pub input: VirtualInput,
    pub output: VirtualOutput,
    pub devices: AudioDevices,
}

pub fn virtual_rig(input: VirtualInput) -> VirtualRig {
    let output = VirtualOutput::new(24000, 1);
    let devices = AudioDevices::new(Arc::new(input.clone()), Arc::new(output.clone()));
    VirtualRig {
        input,
        output,
        devices,
    }
}

/// One captured HTTP request
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A backend that answers every request with `status` and `body`, and
/// reports each request it received.
pub async fn http_stub(status: u16, body: Value) -> (String, mpsc::UnboundedReceiver<CapturedRequest>) {
    http_stub_raw(status, body.to_string()).await
}

/// Like `http_stub`, but the body is sent as-is.
pub async fn http_stub_raw(
    status: u16,
    body: String,
) -> (String, mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let Some(request) = read_request(&mut stream).await else { continue };
            let _ = tx.send(request);

            let reason = if status < 400 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (base_url, rx)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        head,
        body: buf[head_end..].to_vec(),
    })
}
