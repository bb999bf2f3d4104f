//! Real-time duplex voice pipeline for a health-companion client
//!
//! # Architecture
//!
//! ```text
//! Microphone ──▶ CaptureEngine ──▶ AudioUplink ──▶ TransportSession ──▶ voice agent
//!                     │                                  │
//!                     ▼                                  ▼ AgentEvent
//!               SessionRecorder ◀──── agent audio ── VoiceSession ──▶ PlaybackScheduler ──▶ Speakers
//!                     │                                  │
//!                     ▼                                  ▼
//!             RecordedConversation ──▶ ArtifactUploader  ToolDispatcher ──▶ backend
//! ```
//!
//! The crate installs no logger; everything goes through the `log` facade.

pub mod audio;
pub mod backend;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod tools;
pub mod transport;
pub mod upload;

pub use audio::{AudioDevices, AudioFrame, AudioSource};
pub use error::SessionError;
pub use recorder::{RecordedConversation, RecorderStrategyKind, SessionRecorder};
pub use session::{SessionHandle, SessionOptions, SessionStatus, VoiceSession};
pub use settings::VoiceSettings;
pub use tools::{health_companion_tools, ToolDispatcher};
pub use transport::{AgentConfig, AgentEvent, Endpoint, TransportSession};
pub use upload::{ArtifactUploader, UploadTarget};
