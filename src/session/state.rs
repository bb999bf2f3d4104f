//! Session state machine
//!
//! All transitions go through `reduce()`, which returns the next state and
//! the effects the controller must run. The reducer never touches devices
//! or the network.
//!
//! ```text
//! Idle ──Start──▶ Connecting ──TransportReady──▶ (capture) ──CaptureStarted──▶ Active
//!                     │                                                         │
//!                     └──── Stop / StartFailed / TransportError ────▶ Ending ◀──┘
//!                                                                     │
//!                                                     TeardownComplete▼
//!                                                                   Closed
//! ```
//!
//! `Active` carries the orthogonal `agent_speaking` flag. Every run gets a
//! fresh id; completion events from an older run are dropped.

use serde::Serialize;
use uuid::Uuid;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    UserStopped,
    /// The agent closed the link
    RemoteClosed,
    Failed(String),
}

impl EndReason {
    pub fn error(&self) -> Option<&str> {
        match self {
            EndReason::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting {
        run_id: Uuid,
        transport_ready: bool,
    },
    Active {
        run_id: Uuid,
        agent_speaking: bool,
    },
    Ending {
        run_id: Uuid,
        reason: EndReason,
    },
    Closed {
        reason: EndReason,
    },
}

impl SessionState {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Connecting { run_id, .. }
            | SessionState::Active { run_id, .. }
            | SessionState::Ending { run_id, .. } => Some(*run_id),
            SessionState::Idle | SessionState::Closed { .. } => None,
        }
    }

    /// Connecting or Active
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting { .. } | SessionState::Active { .. }
        )
    }

    pub fn agent_speaking(&self) -> bool {
        matches!(
            self,
            SessionState::Active {
                agent_speaking: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// User started the session
    Start,
    TransportReady { id: Uuid },
    CaptureStarted { id: Uuid },
    /// Connect, handshake or microphone acquisition failed
    StartFailed { id: Uuid, error: String },
    /// A chunk of agent audio arrived
    AgentAudio,
    /// The user barged in
    AgentInterrupted,
    AgentTurnComplete,
    TransportError { message: String },
    TransportClosed,
    /// User stopped the session (idempotent)
    Stop,
    TeardownComplete { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { id: Uuid },
    /// Start the capture engine and the uplink
    StartCapture { id: Uuid },
    StartRecording,
    SendKickoff,
    BeginUtterance,
    InterruptPlayback,
    DrainPlayback,
    StopCapture,
    SendEndMessage,
    StopPlayback,
    CloseTransport,
    FinalizeRecording,
    CompleteTeardown { id: Uuid },
    EmitStatus,
}

/// Ordered teardown: capture first so nothing more is sent, then the link.
fn teardown(run_id: Uuid, graceful: bool) -> Vec<Effect> {
    let mut effects = vec![Effect::EmitStatus, Effect::StopCapture];
    if graceful {
        effects.push(Effect::SendEndMessage);
    }
    effects.extend([
        Effect::StopPlayback,
        Effect::CloseTransport,
        Effect::FinalizeRecording,
        Effect::CompleteTeardown { id: run_id },
    ]);
    effects
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// - never mutates state directly
/// - ignores completion events whose run id does not match
/// - emits `EmitStatus` whenever the visible status changes
pub fn reduce(state: &SessionState, event: SessionEvent) -> (SessionState, Vec<Effect>) {
    use Effect::*;
    use SessionEvent::*;
    use SessionState::*;

    let current = state.run_id();
    let is_current = |id: Uuid| current == Some(id);

    match (state, event) {
        // -----------------
        // Idle / Closed
        // -----------------
        (Idle, Start) | (Closed { .. }, Start) => {
            let run_id = Uuid::new_v4();
            (
                Connecting {
                    run_id,
                    transport_ready: false,
                },
                vec![EmitStatus, OpenTransport { id: run_id }],
            )
        }
        (Idle, Stop) | (Closed { .. }, Stop) => (state.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { run_id, .. }, TransportReady { id }) if is_current(id) => (
            Connecting {
                run_id: *run_id,
                transport_ready: true,
            },
            vec![StartCapture { id }],
        ),
        (
            Connecting {
                run_id,
                transport_ready: true,
            },
            CaptureStarted { id },
        ) if is_current(id) => (
            Active {
                run_id: *run_id,
                agent_speaking: false,
            },
            vec![StartRecording, EmitStatus, SendKickoff],
        ),
        (Connecting { run_id, .. }, StartFailed { id, error }) if is_current(id) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::Failed(error),
            },
            teardown(*run_id, false),
        ),
        (Connecting { run_id, .. }, Stop) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::UserStopped,
            },
            teardown(*run_id, false),
        ),

        // -----------------
        // Active
        // -----------------
        (
            Active {
                run_id,
                agent_speaking: false,
            },
            AgentAudio,
        ) => (
            Active {
                run_id: *run_id,
                agent_speaking: true,
            },
            vec![BeginUtterance, EmitStatus],
        ),
        (Active { .. }, AgentAudio) => (state.clone(), vec![]),
        (Active { run_id, .. }, AgentInterrupted) => (
            Active {
                run_id: *run_id,
                agent_speaking: false,
            },
            vec![InterruptPlayback, EmitStatus],
        ),
        (
            Active {
                run_id,
                agent_speaking: true,
            },
            AgentTurnComplete,
        ) => (
            Active {
                run_id: *run_id,
                agent_speaking: false,
            },
            vec![DrainPlayback, EmitStatus],
        ),
        (Active { run_id, .. }, Stop) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::UserStopped,
            },
            teardown(*run_id, true),
        ),
        (Active { run_id, .. }, TransportClosed) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::RemoteClosed,
            },
            teardown(*run_id, false),
        ),

        // Link failure is fatal from any live state
        (Connecting { run_id, .. }, TransportError { message })
        | (Active { run_id, .. }, TransportError { message }) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::Failed(message),
            },
            teardown(*run_id, false),
        ),
        (Connecting { run_id, .. }, TransportClosed) => (
            Ending {
                run_id: *run_id,
                reason: EndReason::Failed("Voice agent closed the connection".to_string()),
            },
            teardown(*run_id, false),
        ),

        // -----------------
        // Ending
        // -----------------
        (Ending { reason, .. }, TeardownComplete { id }) if is_current(id) => (
            Closed {
                reason: reason.clone(),
            },
            vec![EmitStatus],
        ),
        (Ending { .. }, Stop) => (state.clone(), vec![]),

        // -----------------
        // Unhandled or stale: no transition
        // -----------------
        (_, event) => {
            log::debug!("Session: ignoring {:?} in {:?}", event, state);
            (state.clone(), vec![])
        }
    }
}

/// Externally visible session status.
///
/// Tagged union: `{ "status": "idle" }` or `{ "status": "active", "agentSpeaking": true }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Active {
        #[serde(rename = "agentSpeaking")]
        agent_speaking: bool,
    },
    Ending,
    Closed {
        error: Option<String>,
    },
}

impl From<&SessionState> for SessionStatus {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Connecting { .. } => SessionStatus::Connecting,
            SessionState::Active { agent_speaking, .. } => SessionStatus::Active {
                agent_speaking: *agent_speaking,
            },
            SessionState::Ending { .. } => SessionStatus::Ending,
            SessionState::Closed { reason } => SessionStatus::Closed {
                error: reason.error().map(str::to_string),
            },
        }
    }
}
