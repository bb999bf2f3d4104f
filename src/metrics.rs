//! Per-session diagnostics
//!
//! Counts what happened during one voice session (uplink chunks, agent
//! frames, barge-ins, tool calls) and keeps a short history of finished
//! sessions and errors for display.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Finished sessions retained in history
const MAX_SESSION_HISTORY: usize = 20;

/// Errors retained in history
const MAX_ERROR_HISTORY: usize = 20;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot of one session's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    /// Unix timestamp when the session started (seconds)
    pub started_at: u64,
    pub duration_ms: u64,
    /// Uplink chunks accepted by the transport
    pub chunks_sent: u64,
    /// Uplink chunks dropped because the link was not open
    pub chunks_skipped: u64,
    pub agent_frames: u64,
    pub agent_samples: u64,
    pub interruptions: u64,
    /// Queued frames discarded by barge-in
    pub frames_discarded: u64,
    pub tool_calls: u64,
    pub tool_failures: u64,
    pub recording_bytes: u64,
    pub error_message: Option<String>,
}

/// Record of an error that occurred during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Category of error (e.g. "transport", "recorder", "upload")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

/// Live counters for the session in progress
#[derive(Debug)]
pub struct SessionMetrics {
    report: SessionReport,
    started: Instant,
}

impl SessionMetrics {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            report: SessionReport {
                session_id: session_id.to_string(),
                started_at: unix_now(),
                ..SessionReport::default()
            },
            started: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.report.session_id
    }

    pub fn uplink_finished(&mut self, chunks_sent: u64, chunks_skipped: u64) {
        self.report.chunks_sent += chunks_sent;
        self.report.chunks_skipped += chunks_skipped;
    }

    pub fn agent_frame(&mut self, samples: usize) {
        self.report.agent_frames += 1;
        self.report.agent_samples += samples as u64;
    }

    pub fn interrupted(&mut self, frames_discarded: usize) {
        self.report.interruptions += 1;
        self.report.frames_discarded += frames_discarded as u64;
    }

    pub fn tool_call(&mut self, ok: bool) {
        self.report.tool_calls += 1;
        if !ok {
            self.report.tool_failures += 1;
        }
    }

    pub fn recording_finished(&mut self, bytes: usize) {
        self.report.recording_bytes = bytes as u64;
    }

    pub fn failed(&mut self, message: impl Into<String>) {
        self.report.error_message = Some(message.into());
    }

    /// Current counters with the elapsed time filled in.
    pub fn snapshot(&self) -> SessionReport {
        SessionReport {
            duration_ms: self.started.elapsed().as_millis() as u64,
            ..self.report.clone()
        }
    }
}

/// History of finished sessions and errors (newest first)
#[derive(Debug, Default)]
pub struct MetricsHistory {
    sessions: VecDeque<SessionReport>,
    errors: VecDeque<ErrorRecord>,
    total_sessions: u64,
    failed_sessions: u64,
}

/// Summary statistics across recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub avg_duration_ms: u64,
    pub total_interruptions: u64,
    pub total_tool_calls: u64,
    pub last_error: Option<ErrorRecord>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_finished(&mut self, report: SessionReport) {
        log::info!(
            "Metrics: session {} finished after {}ms ({} chunks up, {} agent frames, {} interruptions, {} tool calls)",
            report.session_id,
            report.duration_ms,
            report.chunks_sent,
            report.agent_frames,
            report.interruptions,
            report.tool_calls
        );
        self.total_sessions += 1;
        if let Some(message) = &report.error_message {
            self.failed_sessions += 1;
            self.record_error("session", message.clone(), Some(report.session_id.clone()));
        }
        self.sessions.push_front(report);
        while self.sessions.len() > MAX_SESSION_HISTORY {
            self.sessions.pop_back();
        }
    }

    pub fn record_error(
        &mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        session_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type: error_type.into(),
            message: message.into(),
            session_id,
        };
        log::debug!("Metrics: recording error - {:?}", error);
        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let count = self.sessions.len() as u64;
        let avg_duration_ms = if count > 0 {
            self.sessions.iter().map(|s| s.duration_ms).sum::<u64>() / count
        } else {
            0
        };
        MetricsSummary {
            total_sessions: self.total_sessions,
            failed_sessions: self.failed_sessions,
            avg_duration_ms,
            total_interruptions: self.sessions.iter().map(|s| s.interruptions).sum(),
            total_tool_calls: self.sessions.iter().map(|s| s.tool_calls).sum(),
            last_error: self.errors.front().cloned(),
        }
    }

    pub fn sessions(&self) -> Vec<SessionReport> {
        self.sessions.iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let mut metrics = SessionMetrics::new(Uuid::new_v4());
        metrics.uplink_finished(10, 2);
        metrics.agent_frame(2400);
        metrics.agent_frame(2400);
        metrics.interrupted(5);
        metrics.tool_call(true);
        metrics.tool_call(false);
        metrics.recording_finished(4844);

        let report = metrics.snapshot();
        assert_eq!(report.chunks_sent, 10);
        assert_eq!(report.chunks_skipped, 2);
        assert_eq!(report.agent_frames, 2);
        assert_eq!(report.agent_samples, 4800);
        assert_eq!(report.interruptions, 1);
        assert_eq!(report.frames_discarded, 5);
        assert_eq!(report.tool_calls, 2);
        assert_eq!(report.tool_failures, 1);
        assert_eq!(report.recording_bytes, 4844);
        assert!(report.error_message.is_none());
    }

    #[test]
    fn test_report_serializes() {
        let metrics = SessionMetrics::new(Uuid::new_v4());
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["chunks_sent"], 0);
        assert_eq!(json["session_id"], metrics.session_id());
    }

    #[test]
    fn test_history_summary() {
        let mut history = MetricsHistory::new();
        let mut ok = SessionMetrics::new(Uuid::new_v4());
        ok.interrupted(1);
        history.session_finished(ok.snapshot());

        let mut failed = SessionMetrics::new(Uuid::new_v4());
        failed.failed("Voice agent link is not open");
        history.session_finished(failed.snapshot());

        let summary = history.summary();
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.failed_sessions, 1);
        assert_eq!(summary.total_interruptions, 1);
        assert_eq!(
            summary.last_error.map(|e| e.message),
            Some("Voice agent link is not open".to_string())
        );
    }

    #[test]
    fn test_history_limit() {
        let mut history = MetricsHistory::new();
        for i in 0..(MAX_SESSION_HISTORY + 5) {
            let mut metrics = SessionMetrics::new(Uuid::new_v4());
            metrics.recording_finished(i);
            history.session_finished(metrics.snapshot());
        }
        let sessions = history.sessions();
        assert_eq!(sessions.len(), MAX_SESSION_HISTORY);
        assert!(sessions[0].recording_bytes > sessions[MAX_SESSION_HISTORY - 1].recording_bytes);
    }
}
