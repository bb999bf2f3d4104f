//! Session-level error taxonomy
//!
//! Component errors convert into `SessionError` with `?`. Device and
//! connection errors end the session; the others are reported and the
//! caller decides what to do next.

use std::path::PathBuf;

use crate::audio::{AudioError, PlaybackError};
use crate::recorder::RecorderError;
use crate::settings::SettingsError;
use crate::tools::ToolError;
use crate::transport::TransportError;
use crate::upload::UploadError;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// No microphone, no permission, or the microphone is held by another session
    DeviceUnavailable(String),
    /// Connect, handshake, or mid-session link failure
    ConnectionError(String),
    /// The output path could not be opened; the link stays up
    PlaybackUnavailable(String),
    /// Finalize produced no audio; nothing is uploaded
    NoAudioCaptured,
    /// The backend rejected the artifact. `kept_at` is the local copy.
    UploadFailed {
        message: String,
        kept_at: Option<PathBuf>,
    },
    UnknownToolName(String),
    Recorder(RecorderError),
    Tool(String),
    Configuration(String),
    /// `start()` on a session that is not idle
    AlreadyStarted,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DeviceUnavailable(e) => write!(f, "Microphone unavailable: {}", e),
            SessionError::ConnectionError(e) => write!(f, "Connection error: {}", e),
            SessionError::PlaybackUnavailable(e) => write!(f, "Audio output unavailable: {}", e),
            SessionError::NoAudioCaptured => write!(f, "No audio was captured"),
            SessionError::UploadFailed {
                message,
                kept_at: Some(path),
            } => write!(f, "Upload failed: {} (kept at {:?})", message, path),
            SessionError::UploadFailed {
                message,
                kept_at: None,
            } => write!(f, "Upload failed: {}", message),
            SessionError::UnknownToolName(name) => write!(f, "Unknown tool: {}", name),
            SessionError::Recorder(e) => write!(f, "Recording error: {}", e),
            SessionError::Tool(e) => write!(f, "Tool error: {}", e),
            SessionError::Configuration(e) => write!(f, "Configuration error: {}", e),
            SessionError::AlreadyStarted => write!(f, "Session already started"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        SessionError::DeviceUnavailable(e.to_string())
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::ConnectionError(e.to_string())
    }
}

impl From<PlaybackError> for SessionError {
    fn from(e: PlaybackError) -> Self {
        SessionError::PlaybackUnavailable(e.to_string())
    }
}

impl From<RecorderError> for SessionError {
    fn from(e: RecorderError) -> Self {
        match e {
            RecorderError::NoAudioCaptured => SessionError::NoAudioCaptured,
            other => SessionError::Recorder(other),
        }
    }
}

impl From<UploadError> for SessionError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Failed { message, kept_at } => SessionError::UploadFailed { message, kept_at },
            UploadError::Io(message) => SessionError::UploadFailed {
                message,
                kept_at: None,
            },
        }
    }
}

impl From<ToolError> for SessionError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::UnknownToolName(name) => SessionError::UnknownToolName(name),
            other => SessionError::Tool(other.to_string()),
        }
    }
}

impl From<SettingsError> for SessionError {
    fn from(e: SettingsError) -> Self {
        SessionError::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_empty_maps_to_no_audio() {
        let err: SessionError = RecorderError::NoAudioCaptured.into();
        assert_eq!(err, SessionError::NoAudioCaptured);

        let err: SessionError = RecorderError::AlreadyFinalized.into();
        assert_eq!(err, SessionError::Recorder(RecorderError::AlreadyFinalized));
    }

    #[test]
    fn test_upload_failure_keeps_path() {
        let err: SessionError = UploadError::Failed {
            message: "500".to_string(),
            kept_at: Some(PathBuf::from("/tmp/checkin_1.wav")),
        }
        .into();
        assert!(err.to_string().contains("checkin_1.wav"));
        assert!(matches!(err, SessionError::UploadFailed { kept_at: Some(_), .. }));
    }

    #[test]
    fn test_component_errors() {
        let err: SessionError = AudioError::DeviceUnavailable("busy".to_string()).into();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));

        let err: SessionError = TransportError::NotConnected.into();
        assert!(matches!(err, SessionError::ConnectionError(_)));

        let err: SessionError = ToolError::UnknownToolName("sendEmail".to_string()).into();
        assert_eq!(err, SessionError::UnknownToolName("sendEmail".to_string()));
    }
}
