//! Session controller: runs the reducer's effects against the components
//!
//! ```text
//!              ┌──────────── VoiceSession ────────────┐
//! AgentEvent ─▶│ handle_agent_event ─▶ reduce ─▶ effects│─▶ capture / transport / playback / recorder
//! commands   ─▶│ start / stop        ─▶ reduce ─▶ effects│
//!              └──────────────────────────────────────┘
//! ```
//!
//! Effects run in order on the caller's task. Effects that complete with an
//! event (connect, capture start, teardown) queue it and the loop in
//! `apply()` feeds it back through the reducer.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::{reduce, Effect, EndReason, SessionEvent, SessionState, SessionStatus};
use crate::audio::{
    AudioDevices, AudioError, AudioFrame, CaptureConfig, CaptureEngine, PlaybackError,
    PlaybackScheduler,
};
use crate::error::SessionError;
use crate::metrics::{MetricsHistory, MetricsSummary, SessionMetrics, SessionReport};
use crate::recorder::{RecordedConversation, RecorderConfig, RecorderError, SessionRecorder};
use crate::settings::VoiceSettings;
use crate::tools::{ToolCallRequest, ToolDispatcher};
use crate::transport::{
    AgentConfig, AgentEvent, AgentEventReceiver, AudioUplink, Endpoint, TransportError,
    TransportOptions, TransportSession, UplinkStats,
};

/// Everything one session needs to open.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: Endpoint,
    pub agent: AgentConfig,
    pub transport: TransportOptions,
    pub capture: CaptureConfig,
    /// `None` disables recording
    pub recorder: Option<RecorderConfig>,
    /// Text turn sent once active, so the agent speaks first
    pub kickoff_message: Option<String>,
}

impl SessionOptions {
    /// Options for one page: settings plus the page's instruction and tools.
    pub fn from_settings(
        settings: &VoiceSettings,
        api_key: impl Into<String>,
        system_instruction: impl Into<String>,
        tools: &ToolDispatcher,
    ) -> Self {
        Self {
            endpoint: settings.endpoint(api_key),
            agent: settings.agent_config(system_instruction, tools.declarations()),
            transport: settings.transport_options(),
            capture: settings.capture_config(),
            recorder: Some(settings.recorder_config(crate::paths::scratch_dir())),
            kickoff_message: settings.kickoff_message.clone(),
        }
    }
}

/// Cancels an in-flight `start()` from outside the session's task.
#[derive(Clone, Default)]
pub struct StartAbort {
    token: Arc<Mutex<CancellationToken>>,
}

impl StartAbort {
    pub fn cancel(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn renew(&self) -> CancellationToken {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        *token = CancellationToken::new();
        token.clone()
    }

    fn current(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Resources owned by one start..stop run
struct Run {
    epoch: Instant,
    transport: Option<TransportSession>,
    events: Option<AgentEventReceiver>,
    recorder: Option<SessionRecorder>,
    user_audio: Option<mpsc::UnboundedReceiver<AudioFrame>>,
    uplink: Option<(CancellationToken, JoinHandle<UplinkStats>)>,
    cancelled_calls: Arc<Mutex<HashSet<String>>>,
    tool_tasks: Vec<JoinHandle<()>>,
    metrics: Arc<Mutex<SessionMetrics>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One voice interaction: capture → agent → playback, recorded on the side.
pub struct VoiceSession {
    options: SessionOptions,
    state: SessionState,
    capture: CaptureEngine,
    playback: PlaybackScheduler,
    tools: Arc<ToolDispatcher>,
    status_tx: watch::Sender<SessionStatus>,
    abort: StartAbort,
    run: Option<Run>,
    pending: VecDeque<SessionEvent>,
    /// Error that ended the current run
    failure: Option<SessionError>,
    /// Non-fatal problems (playback, unknown tools) since the last `take_notices`
    notices: Vec<SessionError>,
    recording: Option<Result<RecordedConversation, RecorderError>>,
    agent_text: Vec<String>,
    last_report: Option<SessionReport>,
    history: Arc<Mutex<MetricsHistory>>,
}

impl VoiceSession {
    pub fn new(devices: &AudioDevices, options: SessionOptions, tools: ToolDispatcher) -> Self {
        let capture = CaptureEngine::new(
            devices.input_backend(),
            devices.microphone(),
            options.capture,
        );
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Self {
            options,
            state: SessionState::Idle,
            capture,
            playback: devices.playback(),
            tools: Arc::new(tools),
            status_tx,
            abort: StartAbort::default(),
            run: None,
            pending: VecDeque::new(),
            failure: None,
            notices: Vec::new(),
            recording: None,
            agent_text: Vec::new(),
            last_report: None,
            history: Arc::new(Mutex::new(MetricsHistory::new())),
        }
    }

    /// Report finished runs into `history`, shared with other sessions.
    pub fn with_metrics_history(mut self, history: Arc<Mutex<MetricsHistory>>) -> Self {
        self.history = history;
        self
    }

    pub fn metrics_history(&self) -> Arc<Mutex<MetricsHistory>> {
        self.history.clone()
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        lock(&self.history).summary()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn capture(&self) -> &CaptureEngine {
        &self.capture
    }

    pub fn start_abort(&self) -> StartAbort {
        self.abort.clone()
    }

    /// Connect to the agent and start the microphone.
    ///
    /// Resolves once the session is active, or once a concurrent stop (via
    /// `StartAbort`) has torn the attempt down.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::Closed { .. }) {
            return Err(SessionError::AlreadyStarted);
        }
        self.failure = None;
        self.recording = None;
        self.agent_text.clear();
        self.abort.renew();

        self.apply(SessionEvent::Start).await;

        match &self.state {
            SessionState::Closed {
                reason: EndReason::Failed(message),
            } => Err(self
                .failure
                .take()
                .unwrap_or_else(|| SessionError::ConnectionError(message.clone()))),
            _ => Ok(()),
        }
    }

    /// Stop from any state. Devices are released before this returns.
    ///
    /// Returns the recording of the last run, `None` when recording was
    /// disabled or never started.
    pub async fn stop(&mut self) -> Result<Option<RecordedConversation>, SessionError> {
        self.apply(SessionEvent::Stop).await;
        match self.recording.take() {
            Some(Ok(recording)) => Ok(Some(recording)),
            Some(Err(RecorderError::NotStarted)) | None => Ok(None),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// Send a text turn to the agent.
    pub fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let transport = self.transport().ok_or(TransportError::NotConnected)?;
        transport.send_text_message(text)?;
        Ok(())
    }

    /// Next event from the agent; `None` when no link is open.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        let events = self.run.as_mut()?.events.as_mut()?;
        events.recv().await
    }

    /// Hand the event receiver to an outside loop (see `SessionHandle`).
    pub fn take_event_receiver(&mut self) -> Option<AgentEventReceiver> {
        self.run.as_mut()?.events.take()
    }

    /// Process agent events until the session leaves the live states.
    pub async fn run_until_closed(&mut self) {
        while self.state.is_live() {
            match self.next_event().await {
                Some(event) => self.handle_agent_event(event).await,
                None => self.handle_agent_event(AgentEvent::Closed).await,
            }
        }
    }

    pub async fn handle_agent_event(&mut self, event: AgentEvent) {
        if !self.state.is_live() {
            log::debug!("Session: dropping {:?} in {:?}", event, self.state);
            return;
        }

        match event {
            AgentEvent::Ready => log::debug!("Session: agent ready"),
            AgentEvent::AudioData(frame) => {
                self.apply(SessionEvent::AgentAudio).await;
                self.play_agent_audio(frame);
            }
            AgentEvent::Text(text) => {
                log::info!("Session: agent text: {}", text);
                self.agent_text.push(text);
            }
            AgentEvent::Interrupted => self.apply(SessionEvent::AgentInterrupted).await,
            AgentEvent::ToolCall(calls) => {
                for call in calls {
                    self.spawn_tool_call(call);
                }
            }
            AgentEvent::ToolCallCancelled(ids) => {
                log::info!("Session: agent cancelled tool calls {:?}", ids);
                if let Some(run) = &self.run {
                    lock(&run.cancelled_calls).extend(ids);
                }
            }
            AgentEvent::TurnComplete => self.apply(SessionEvent::AgentTurnComplete).await,
            AgentEvent::Error(message) => {
                log::error!("Session: transport error: {}", message);
                self.failure = Some(SessionError::ConnectionError(message.clone()));
                self.apply(SessionEvent::TransportError { message }).await;
            }
            AgentEvent::Closed => self.apply(SessionEvent::TransportClosed).await,
        }
    }

    /// Problems that did not end the session (playback unavailable, unknown tools).
    pub fn take_notices(&mut self) -> Vec<SessionError> {
        std::mem::take(&mut self.notices)
    }

    /// Text parts the agent sent during the current run.
    pub fn agent_text(&self) -> &[String] {
        &self.agent_text
    }

    /// Counters of the current run, or of the last finished one.
    pub fn report(&self) -> Option<SessionReport> {
        match &self.run {
            Some(run) => Some(lock(&run.metrics).snapshot()),
            None => self.last_report.clone(),
        }
    }

    fn transport(&self) -> Option<&TransportSession> {
        self.run.as_ref()?.transport.as_ref()
    }

    fn play_agent_audio(&mut self, frame: AudioFrame) {
        let Some(run) = &self.run else { return };
        lock(&run.metrics).agent_frame(frame.len());
        if let Some(recorder) = &run.recorder {
            recorder.add_agent_audio(&frame);
        }

        match self.playback.enqueue(frame) {
            Ok(()) => {}
            Err(PlaybackError::Unavailable(e)) => {
                // Report once per run; the link stays up
                let already = self
                    .notices
                    .iter()
                    .any(|n| matches!(n, SessionError::PlaybackUnavailable(_)));
                if !already {
                    log::error!("Session: playback unavailable: {}", e);
                    let session_id = lock(&run.metrics).session_id().to_string();
                    lock(&self.history).record_error("playback", e.clone(), Some(session_id));
                    self.notices.push(SessionError::PlaybackUnavailable(e));
                }
            }
            Err(PlaybackError::Draining) => {
                log::debug!("Session: playback draining, agent frame dropped");
            }
        }
    }

    fn spawn_tool_call(&mut self, call: ToolCallRequest) {
        let Some(run) = &mut self.run else { return };
        let Some(transport) = run.transport.clone() else { return };

        if self.tools.policy(&call.name).is_none() {
            log::warn!(
                "Session: agent requested unknown tool {} (call {}), not replying",
                call.name,
                call.call_id
            );
            let session_id = {
                let mut metrics = lock(&run.metrics);
                metrics.tool_call(false);
                metrics.session_id().to_string()
            };
            lock(&self.history).record_error(
                "tool",
                format!("unknown tool {}", call.name),
                Some(session_id),
            );
            self.notices.push(SessionError::UnknownToolName(call.name));
            return;
        }

        let tools = self.tools.clone();
        let cancelled = run.cancelled_calls.clone();
        let metrics = run.metrics.clone();
        run.tool_tasks.retain(|t| !t.is_finished());
        run.tool_tasks.push(tokio::spawn(async move {
            let outcome = tools.dispatch(&call).await;
            lock(&metrics).tool_call(outcome.is_ok());
            match outcome {
                Ok(Some(result)) => {
                    if lock(&cancelled).contains(&result.call_id) {
                        log::info!("Session: dropping result of cancelled call {}", result.call_id);
                        return;
                    }
                    if let Err(e) = transport.send_tool_result(&result.call_id, &result.name, result.payload) {
                        log::warn!("Session: result of {} not sent: {}", result.call_id, e);
                    }
                }
                Ok(None) => log::debug!("Session: result of {} withheld by policy", call.name),
                Err(e) => log::warn!("Session: tool call {} failed: {}", call.call_id, e),
            }
        }));
    }

    async fn apply(&mut self, event: SessionEvent) {
        self.pending.push_back(event);
        while let Some(event) = self.pending.pop_front() {
            let (next, effects) = reduce(&self.state, event);
            if next != self.state {
                log::info!("Session: {:?} -> {:?}", self.state, next);
            }
            self.state = next;
            for effect in effects {
                self.run_effect(effect).await;
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        log::debug!("Session: effect {:?}", effect);
        match effect {
            Effect::OpenTransport { id } => self.open_transport(id).await,
            Effect::StartCapture { id } => self.start_capture(id).await,
            Effect::StartRecording => self.start_recording(),
            Effect::SendKickoff => {
                if let (Some(text), Some(transport)) = (&self.options.kickoff_message, self.transport()) {
                    log::info!("Session: sending kickoff turn");
                    if let Err(e) = transport.send_text_message(text) {
                        log::warn!("Session: kickoff turn not sent: {}", e);
                    }
                }
            }
            Effect::BeginUtterance => self.playback.begin_utterance(),
            Effect::InterruptPlayback => {
                let discarded = self.playback.interrupt();
                log::info!("Session: barge-in, {} queued frames discarded", discarded);
                if let Some(run) = &self.run {
                    lock(&run.metrics).interrupted(discarded);
                }
            }
            Effect::DrainPlayback => self.playback.drain(),
            Effect::StopCapture => self.stop_capture().await,
            Effect::SendEndMessage => {
                if let Some(transport) = self.transport() {
                    transport.send_end_message();
                }
            }
            Effect::StopPlayback => {
                self.playback.interrupt();
                if let Some(run) = &mut self.run {
                    for task in run.tool_tasks.drain(..) {
                        task.abort();
                    }
                }
            }
            Effect::CloseTransport => {
                if let Some(run) = &mut self.run {
                    run.events = None;
                    if let Some(transport) = run.transport.take() {
                        transport.close().await;
                    }
                }
            }
            Effect::FinalizeRecording => self.finalize_recording(),
            Effect::CompleteTeardown { id } => {
                if let Some(run) = self.run.take() {
                    let mut metrics = lock(&run.metrics);
                    if let Some(failure) = &self.failure {
                        metrics.failed(failure.to_string());
                    }
                    let report = metrics.snapshot();
                    drop(metrics);
                    lock(&self.history).session_finished(report.clone());
                    self.last_report = Some(report);
                }
                self.pending.push_back(SessionEvent::TeardownComplete { id });
            }
            Effect::EmitStatus => {
                self.status_tx.send_replace(SessionStatus::from(&self.state));
            }
        }
    }

    async fn open_transport(&mut self, id: uuid::Uuid) {
        let epoch = Instant::now();
        self.capture.set_epoch(epoch);
        self.run = Some(Run {
            epoch,
            transport: None,
            events: None,
            recorder: None,
            user_audio: None,
            uplink: None,
            cancelled_calls: Arc::new(Mutex::new(HashSet::new())),
            tool_tasks: Vec::new(),
            metrics: Arc::new(Mutex::new(SessionMetrics::new(id))),
        });

        let abort = self.abort.current();
        let connect = TransportSession::connect(
            &self.options.endpoint,
            &self.options.agent,
            &self.options.transport,
            epoch,
        );
        let outcome = tokio::select! {
            outcome = connect => Some(outcome),
            _ = abort.cancelled() => None,
        };

        match outcome {
            Some(Ok((transport, events))) => {
                if let Some(run) = &mut self.run {
                    run.transport = Some(transport);
                    run.events = Some(events);
                }
                self.pending.push_back(SessionEvent::TransportReady { id });
            }
            Some(Err(e)) => {
                log::error!("Session: {}", e);
                let error = e.to_string();
                self.failure = Some(e.into());
                self.pending.push_back(SessionEvent::StartFailed { id, error });
            }
            None => {
                log::info!("Session: stopped while connecting");
                self.pending.push_back(SessionEvent::Stop);
            }
        }
    }

    async fn start_capture(&mut self, id: uuid::Uuid) {
        let Some(run) = &mut self.run else { return };
        let Some(transport) = run.transport.clone() else { return };

        // Subscribe before starting so the first frame reaches both consumers
        if self.options.recorder.is_some() {
            run.user_audio = Some(self.capture.subscribe());
        }
        let cancel = CancellationToken::new();
        let uplink = AudioUplink::new(transport, self.capture.subscribe(), cancel.clone());
        run.uplink = Some((cancel, tokio::spawn(uplink.run())));

        let abort = self.abort.current();
        let start = self.capture.start();
        tokio::pin!(start);
        let result = tokio::select! {
            result = &mut start => result,
            _ = abort.cancelled() => {
                // Let the in-flight start settle, then tear it down
                let (_, result) = tokio::join!(self.capture.stop(), &mut start);
                result.and(Err(AudioError::StartCancelled))
            }
        };

        match result {
            Ok(()) => self.pending.push_back(SessionEvent::CaptureStarted { id }),
            Err(AudioError::StartCancelled) => {
                log::info!("Session: stopped while starting capture");
                self.pending.push_back(SessionEvent::Stop);
            }
            Err(e) => {
                log::error!("Session: capture failed: {}", e);
                let error = e.to_string();
                self.failure = Some(e.into());
                self.pending.push_back(SessionEvent::StartFailed { id, error });
            }
        }
    }

    fn start_recording(&mut self) {
        let Some(run) = &mut self.run else { return };
        let Some(config) = &self.options.recorder else { return };

        let recorder = SessionRecorder::from_config(config);
        if let Err(e) = recorder.start() {
            log::error!("Session: recorder failed to start: {}", e);
            return;
        }
        if let Some(rx) = run.user_audio.take() {
            recorder.attach_user_stream(rx);
        }
        log::debug!(
            "Session: recording started {}ms after session start",
            run.epoch.elapsed().as_millis()
        );
        run.recorder = Some(recorder);
    }

    async fn stop_capture(&mut self) {
        self.capture.stop().await;
        let Some(run) = &mut self.run else { return };
        run.user_audio = None;
        if let Some((cancel, handle)) = run.uplink.take() {
            cancel.cancel();
            match handle.await {
                Ok(stats) => lock(&run.metrics).uplink_finished(stats.chunks_sent, stats.chunks_skipped),
                Err(e) => log::warn!("Session: uplink task failed: {}", e),
            }
        }
    }

    fn finalize_recording(&mut self) {
        let Some(run) = &mut self.run else { return };
        let Some(recorder) = run.recorder.take() else { return };

        let result = recorder.finalize();
        match &result {
            Ok(recording) => lock(&run.metrics).recording_finished(recording.wav_bytes().len()),
            Err(RecorderError::NoAudioCaptured) => log::warn!("Session: nothing was recorded"),
            Err(e) => {
                log::error!("Session: finalize failed: {}", e);
                let session_id = lock(&run.metrics).session_id().to_string();
                lock(&self.history).record_error("recorder", e.to_string(), Some(session_id));
            }
        }
        self.recording = Some(result);
    }
}

enum Command {
    Start(oneshot::Sender<Result<(), SessionError>>),
    Stop(oneshot::Sender<Result<Option<RecordedConversation>, SessionError>>),
    SendText(String),
}

/// A `VoiceSession` running on its own task.
///
/// Commands and agent events are handled by one loop, so the reducer stays
/// single-writer. `stop()` also works while `start()` is still in flight.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    abort: StartAbort,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(session: VoiceSession) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let status = session.status();
        let abort = session.start_abort();
        let task = tokio::spawn(run_session(session, rx));
        Self {
            commands,
            status,
            abort,
            task,
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start(reply))?;
        rx.await
            .unwrap_or_else(|_| Err(SessionError::ConnectionError("Session task ended".to_string())))
    }

    pub async fn stop(&self) -> Result<Option<RecordedConversation>, SessionError> {
        self.abort.cancel();
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop(reply)).is_err() {
            return Ok(None);
        }
        rx.await.unwrap_or(Ok(None))
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Command::SendText(text.into())).is_ok()
    }

    /// Stop the session and wait for its task to finish.
    pub async fn shutdown(self) -> Result<Option<RecordedConversation>, SessionError> {
        let result = self.stop().await;
        drop(self.commands);
        if let Err(e) = self.task.await {
            log::warn!("Session: task ended abnormally: {}", e);
        }
        result
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ConnectionError("Session task ended".to_string()))
    }
}

async fn next_agent_event(events: &mut Option<AgentEventReceiver>) -> Option<AgentEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_session(mut session: VoiceSession, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut events: Option<AgentEventReceiver> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start(reply)) => {
                    let result = session.start().await;
                    events = session.take_event_receiver();
                    let _ = reply.send(result);
                }
                Some(Command::Stop(reply)) => {
                    let result = session.stop().await;
                    events = None;
                    let _ = reply.send(result);
                }
                Some(Command::SendText(text)) => {
                    if let Err(e) = session.send_text(&text) {
                        log::warn!("Session: text turn dropped: {}", e);
                    }
                }
                None => {
                    if let Err(e) = session.stop().await {
                        log::warn!("Session: {}", e);
                    }
                    break;
                }
            },
            event = next_agent_event(&mut events) => {
                let event = event.unwrap_or(AgentEvent::Closed);
                session.handle_agent_event(event).await;
                if !session.state().is_live() {
                    events = None;
                }
            }
        }
    }
    log::debug!("Session: task finished");
}
