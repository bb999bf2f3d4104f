//! WebSocket session with the voice agent
//!
//! # Connection Flow
//!
//! 1. `connect()` - open the WebSocket, send `setup`, wait for `setupComplete`
//! 2. `send_audio_chunk()` - forward microphone frames (non-blocking)
//! 3. events arrive on the `AgentEventReceiver` in wire order
//! 4. `send_end_message()` + `close()` - clean shutdown
//!
//! A writer task owns the socket sink and a reader task owns the stream.
//! Senders never touch the socket directly: they check the shared state and
//! hand the message to the writer, so a failed link rejects sends instead of
//! queueing them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{self, client::IntoClientRequest, Message},
};

use super::protocol::{ClientMessage, ServerMessage};
use super::{AgentConfig, AgentEvent, Endpoint, TransportError};
use crate::audio::AudioFrame;

/// Receiver for agent events, in wire order
pub type AgentEventReceiver = mpsc::Receiver<AgentEvent>;

/// Events buffered between the reader task and the session
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long close() waits for the writer to flush the close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Timeout for the WebSocket handshake
    pub connect_timeout: Duration,
    /// Timeout for `setupComplete` after `setup` is sent
    pub setup_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportState {
    Closed,
    Ready,
    Streaming,
    AgentSpeaking,
    Closing,
}

impl TransportState {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransportState::Ready | TransportState::Streaming | TransportState::AgentSpeaking
        )
    }
}

/// State shared between the handle and the background tasks
struct Shared {
    state: Mutex<TransportState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    epoch: Instant,
    chunks_sent: AtomicU64,
    chunks_rejected: AtomicU64,
    end_sent: AtomicBool,
}

impl Shared {
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_state(&self, next: TransportState) -> TransportState {
        std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            next,
        )
    }

    /// Move to `to` only when the current state is one of `from`.
    fn transition(&self, from: &[TransportState], to: TransportState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if from.contains(&state) {
            *state = to;
        }
    }

    /// Move to Closed and stop accepting sends. Returns the previous state,
    /// or None if the link was already closed.
    fn mark_closed(&self) -> Option<TransportState> {
        let previous = self.replace_state(TransportState::Closed);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous == TransportState::Closed {
            None
        } else {
            Some(previous)
        }
    }

    /// Hand a message to the writer task.
    fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg).map_err(|e| {
            log::error!("Transport: failed to encode message: {}", e);
            TransportError::ProtocolError(e.to_string())
        })?;
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(json))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Track agent speech from inbound events.
    fn observe(&self, event: &AgentEvent) {
        use TransportState::*;
        match event {
            AgentEvent::AudioData(_) => self.transition(&[Ready, Streaming], AgentSpeaking),
            AgentEvent::TurnComplete | AgentEvent::Interrupted => {
                self.transition(&[AgentSpeaking], Streaming)
            }
            _ => {}
        }
    }

    /// Close after a failure and tell the session, once.
    async fn finish(&self, events: &mpsc::Sender<AgentEvent>, error: Option<String>) {
        let Some(previous) = self.mark_closed() else {
            return;
        };
        if previous != TransportState::Closing {
            if let Some(message) = error {
                log::error!("Transport: {}", message);
                let _ = events.send(AgentEvent::Error(message)).await;
            }
        }
        let _ = events.send(AgentEvent::Closed).await;
    }
}

struct Inner {
    shared: Arc<Shared>,
    events_tx: Mutex<Option<mpsc::Sender<AgentEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Ensure tasks are aborted if the session is dropped without close()
        for task in [&self.writer, &self.reader] {
            if let Some(handle) = task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
    }
}

/// Handle to an open agent session. Cheap to clone.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

fn install_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Fails only if another provider is already installed, which is fine
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

impl TransportSession {
    /// Connect, send `setup` and wait for `setupComplete`.
    ///
    /// A single attempt; failures surface as `TransportError::ConnectionFailed`
    /// (or `SetupRejected` when the agent answers the setup with an error).
    /// `epoch` is the session start that inbound audio offsets are measured from.
    pub async fn connect(
        endpoint: &Endpoint,
        config: &AgentConfig,
        options: &TransportOptions,
        epoch: Instant,
    ) -> Result<(Self, AgentEventReceiver), TransportError> {
        install_crypto_provider();

        let request = endpoint
            .request_url()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Transport: connecting to {}", endpoint.url);

        let (ws_stream, _response) = timeout(
            options.connect_timeout,
            connect_async_with_config(
                request, None, true, // disable_nagle: small audio frames must not wait
            ),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Transport: WebSocket connected, sending setup for {}", config.model);

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        timeout(options.setup_timeout, wait_for_setup_complete(&mut read))
            .await
            .map_err(|_| TransportError::ConnectionFailed("Setup timeout".to_string()))??;

        log::info!("Transport: setup complete, session ready");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(TransportState::Ready),
            outbound: Mutex::new(Some(outbound_tx)),
            epoch,
            chunks_sent: AtomicU64::new(0),
            chunks_rejected: AtomicU64::new(0),
            end_sent: AtomicBool::new(false),
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Fresh channel with spare capacity
        let _ = events_tx.try_send(AgentEvent::Ready);

        let writer = tokio::spawn(run_writer(
            write,
            outbound_rx,
            shared.clone(),
            events_tx.clone(),
        ));
        let reader = tokio::spawn(run_reader(read, shared.clone(), events_tx.clone()));

        let session = Self {
            inner: Arc::new(Inner {
                shared,
                events_tx: Mutex::new(Some(events_tx)),
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            }),
        };
        Ok((session, events_rx))
    }

    pub fn state(&self) -> TransportState {
        self.inner.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Forward one captured frame. Returns false (and sends nothing) when the
    /// link is not open.
    pub fn send_audio_chunk(&self, frame: &AudioFrame) -> bool {
        let shared = &self.inner.shared;
        let state = shared.state();
        if !state.is_open() || shared.send(&ClientMessage::audio_chunk(frame)).is_err() {
            let rejected = shared.chunks_rejected.fetch_add(1, Ordering::SeqCst);
            if rejected == 0 {
                log::warn!("Transport: link is {:?}, dropping audio chunk", state);
            } else {
                log::debug!("Transport: dropping audio chunk ({} so far)", rejected + 1);
            }
            return false;
        }
        shared.transition(&[TransportState::Ready], TransportState::Streaming);
        shared.chunks_sent.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Send a complete user text turn.
    pub fn send_text_message(&self, text: &str) -> Result<(), TransportError> {
        self.send_if_open(&ClientMessage::user_text(text), "text turn")
    }

    /// Answer a tool call.
    pub fn send_tool_result(&self, call_id: &str, name: &str, payload: Value) -> Result<(), TransportError> {
        self.send_if_open(&ClientMessage::tool_response(call_id, name, payload), "tool result")?;
        log::debug!("Transport: sent result for {} (call {})", name, call_id);
        Ok(())
    }

    /// Tell the agent the microphone stream has ended. Sent at most once.
    pub fn send_end_message(&self) -> bool {
        if self.inner.shared.end_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send_if_open(&ClientMessage::audio_stream_end(), "audio stream end")
            .is_ok()
    }

    fn send_if_open(&self, msg: &ClientMessage, what: &str) -> Result<(), TransportError> {
        let shared = &self.inner.shared;
        let state = shared.state();
        if !state.is_open() {
            log::warn!("Transport: link is {:?}, not sending {}", state, what);
            return Err(TransportError::NotConnected);
        }
        shared.send(msg)
    }

    pub fn chunks_sent(&self) -> u64 {
        self.inner.shared.chunks_sent.load(Ordering::SeqCst)
    }

    pub fn chunks_rejected(&self) -> u64 {
        self.inner.shared.chunks_rejected.load(Ordering::SeqCst)
    }

    /// Send a close frame and stop the background tasks. Idempotent.
    ///
    /// Emits `AgentEvent::Closed` unless the link had already closed.
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        let previous = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            if previous != TransportState::Closed {
                *state = TransportState::Closing;
            }
            previous
        };

        if previous.is_open() {
            log::info!(
                "Transport: closing ({} chunks sent)",
                shared.chunks_sent.load(Ordering::SeqCst)
            );
            let outbound = shared
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = outbound {
                let _ = tx.send(Message::Close(None));
            }
        }

        let writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            if timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                log::warn!("Transport: writer did not finish in time, aborting");
                writer.abort();
            }
        }
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let events_tx = self
            .inner
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if shared.mark_closed().is_some() {
            if let Some(tx) = events_tx {
                let _ = tx.try_send(AgentEvent::Closed);
            }
            log::info!("Transport: closed");
        }
    }
}

async fn wait_for_setup_complete<S>(read: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = read.next().await {
        let payload = match msg_result {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(TransportError::ConnectionFailed(format!(
                    "Connection closed before setup completed: {}",
                    reason
                )));
            }
            Ok(_) => continue, // ping/pong
            Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
        };

        match ServerMessage::parse(&payload) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(msg) => {
                if let Some(error) = msg.error {
                    return Err(TransportError::SetupRejected(error.message));
                }
                log::debug!("Transport: ignoring message while waiting for setupComplete");
            }
            Err(e) => log::warn!("Transport: failed to parse message: {}", e),
        }
    }
    Err(TransportError::ConnectionFailed("Stream ended".to_string()))
}

async fn run_writer<W>(
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    events: mpsc::Sender<AgentEvent>,
) where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            shared
                .finish(&events, Some(format!("send failed: {}", e)))
                .await;
            return;
        }
        if closing {
            break;
        }
    }
    if let Err(e) = write.close().await {
        log::debug!("Transport: error closing sink: {}", e);
    }
    log::debug!("Transport: writer task exiting");
}

async fn run_reader<S>(mut read: S, shared: Arc<Shared>, events: mpsc::Sender<AgentEvent>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = read.next().await {
        let payload = match msg_result {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                log::info!("Transport: WebSocket closed by agent ({})", reason);
                shared
                    .finish(&events, Some(format!("connection closed by agent: {}", reason)))
                    .await;
                return;
            }
            Ok(_) => continue, // ping/pong are answered by tungstenite
            Err(e) => {
                shared
                    .finish(&events, Some(format!("WebSocket error: {}", e)))
                    .await;
                return;
            }
        };

        let msg = match ServerMessage::parse(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Transport: failed to parse message: {}", e);
                continue;
            }
        };

        for event in msg.into_events(shared.epoch.elapsed()) {
            shared.observe(&event);
            if events.send(event).await.is_err() {
                log::debug!("Transport: event receiver dropped");
                return;
            }
        }
    }
    shared
        .finish(&events, Some("connection lost".to_string()))
        .await;
    log::debug!("Transport: reader task exiting");
}
