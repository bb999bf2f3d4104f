//! Bidirectional link to the remote voice agent
//!
//! # Architecture
//!
//! ```text
//! CaptureEngine ──frames──▶ AudioUplink ──▶ TransportSession ──writer task──▶ WebSocket
//!                                                                                │
//! VoiceSession ◀──AgentEvent (ordered mpsc)── reader task ◀──────────────────────┘
//! ```
//!
//! # Failure Strategy
//!
//! - The handshake (connect + `setupComplete`) is attempted once, with a timeout
//! - Any mid-session socket failure closes the session and surfaces `AgentEvent::Error`
//! - Nothing reconnects and nothing is queued after the link fails

mod protocol;
mod session;
mod uplink;

pub use protocol::{pcm_mime, ClientMessage, ServerMessage, LIVE_API_URL};
pub use session::{AgentEventReceiver, TransportOptions, TransportSession, TransportState};
pub use uplink::{AudioUplink, UplinkStats};

use crate::audio::AudioFrame;
use crate::tools::{ToolCallRequest, ToolDeclaration};

/// What the agent should answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

/// Per-page agent configuration sent in `setup`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
    pub response_modality: ResponseModality,
    pub tools: Vec<ToolDeclaration>,
}

/// Where to connect and with which key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub api_key: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    /// The Gemini Live endpoint with `api_key`.
    pub fn live(api_key: impl Into<String>) -> Self {
        Self::new(LIVE_API_URL, api_key)
    }

    /// URL with the key appended as `key=`.
    pub fn request_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, sep, self.api_key)
    }
}

/// Everything the agent can tell the session, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Ready,
    AudioData(AudioFrame),
    Text(String),
    Interrupted,
    ToolCall(Vec<ToolCallRequest>),
    ToolCallCancelled(Vec<String>),
    TurnComplete,
    Error(String),
    Closed,
}

/// Errors that can occur on the agent link
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connect or handshake did not complete
    ConnectionFailed(String),
    /// The agent rejected the setup message
    SetupRejected(String),
    /// Message could not be encoded
    ProtocolError(String),
    /// The link is not open
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to voice agent: {}", e)
            }
            TransportError::SetupRejected(e) => write!(f, "Voice agent rejected setup: {}", e),
            TransportError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            TransportError::NotConnected => write!(f, "Voice agent link is not open"),
        }
    }
}

impl std::error::Error for TransportError {}
