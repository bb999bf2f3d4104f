//! Voice session: one start..stop interaction with the agent
//!
//! `state` holds the pure reducer, `controller` runs its effects against
//! capture, transport, playback and the recorder.

mod controller;
mod state;

pub use controller::{SessionHandle, SessionOptions, StartAbort, VoiceSession};
pub use state::{reduce, Effect, EndReason, SessionEvent, SessionState, SessionStatus};
