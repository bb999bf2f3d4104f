//! Persistent voice settings
//!
//! Stored as pretty JSON. Missing fields fall back to their defaults, so old
//! files keep loading after new settings are added.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::capture::DEFAULT_FRAME_SAMPLES;
use crate::audio::{CaptureConfig, AGENT_SAMPLE_RATE, CAPTURE_SAMPLE_RATE};
use crate::backend::DEFAULT_BACKEND_URL;
use crate::recorder::{MixGains, RecorderConfig, RecorderStrategyKind};
use crate::transport::{AgentConfig, Endpoint, ResponseModality, TransportOptions, LIVE_API_URL};
use crate::tools::ToolDeclaration;

/// Environment variable holding the agent API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Aoede";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// WebSocket endpoint of the voice agent
    pub endpoint: String,
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,

    /// Uplink rate sent to the agent
    pub capture_sample_rate: u32,
    /// Rate of the audio the agent sends back (and of the recording)
    pub agent_sample_rate: u32,
    /// Samples per uplink frame
    pub frame_samples: usize,

    pub recorder_strategy: RecorderStrategyKind,
    pub mix_gains: MixGains,

    pub backend_url: String,
    /// Backend path the recording is uploaded to
    pub upload_path: String,
    /// Filename prefix of uploaded artifacts
    pub artifact_prefix: String,

    /// Text turn sent once the agent is ready, so it greets first
    pub kickoff_message: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            agent_sample_rate: AGENT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            recorder_strategy: RecorderStrategyKind::default(),
            mix_gains: MixGains::default(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            upload_path: "/upload-checkin".to_string(),
            artifact_prefix: "checkin".to_string(),
            kickoff_message: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl VoiceSettings {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.capture_sample_rate,
            frame_samples: self.frame_samples,
        }
    }

    pub fn recorder_config(&self, scratch_dir: PathBuf) -> RecorderConfig {
        RecorderConfig {
            strategy: self.recorder_strategy,
            sample_rate: self.agent_sample_rate,
            gains: self.mix_gains,
            scratch_dir,
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..TransportOptions::default()
        }
    }

    pub fn endpoint(&self, api_key: impl Into<String>) -> Endpoint {
        Endpoint::new(self.endpoint.clone(), api_key)
    }

    /// Session config for one page.
    pub fn agent_config(
        &self,
        system_instruction: impl Into<String>,
        tools: Vec<ToolDeclaration>,
    ) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            system_instruction: system_instruction.into(),
            voice: self.voice.clone(),
            response_modality: ResponseModality::Audio,
            tools,
        }
    }
}

/// Errors that can occur while loading or saving settings
#[derive(Debug)]
pub enum SettingsError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    MissingApiKey,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io { path, source } => write!(f, "Settings I/O error {:?}: {}", path, source),
            SettingsError::Parse { path, message } => {
                write!(f, "Failed to parse settings {:?}: {}", path, message)
            }
            SettingsError::MissingApiKey => write!(f, "{} is not set", API_KEY_ENV),
        }
    }
}

impl std::error::Error for SettingsError {}

/// Load settings from `path`. A missing or unreadable file gives the defaults.
pub fn load_settings(path: &Path) -> VoiceSettings {
    match try_load_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Settings: {}", e);
            VoiceSettings::default()
        }
    }
}

/// Like `load_settings`, but reports parse and I/O failures.
pub fn try_load_settings(path: &Path) -> Result<VoiceSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str::<VoiceSettings>(&contents).map_err(|e| SettingsError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VoiceSettings::default()),
        Err(e) => Err(SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Write settings atomically: temp file in the same directory, then rename.
pub fn save_settings(path: &Path, settings: &VoiceSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(io_err(&tmp_path))?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    log::debug!("Settings: saved to {:?}", path);
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError {
    let path = path.to_path_buf();
    move |source| SettingsError::Io { path, source }
}

/// API key from the environment, reading `.env` first if present.
pub fn api_key_from_env() -> Result<String, SettingsError> {
    let _ = dotenvy::dotenv();
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(SettingsError::MissingApiKey),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = VoiceSettings::default();
        assert_eq!(settings.capture_sample_rate, 16000);
        assert_eq!(settings.agent_sample_rate, 24000);
        assert_eq!(settings.frame_samples, 2048);
        assert_eq!(settings.recorder_strategy, RecorderStrategyKind::TimelineMerge);
        assert_eq!(settings.endpoint, LIVE_API_URL);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, VoiceSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice": "Puck", "recorder_strategy": "live_mix"}"#).unwrap();

        let settings = try_load_settings(&path).unwrap();
        assert_eq!(settings.voice, "Puck");
        assert_eq!(settings.recorder_strategy, RecorderStrategyKind::LiveMix);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            try_load_settings(&path),
            Err(SettingsError::Parse { .. })
        ));
        assert_eq!(load_settings(&path), VoiceSettings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = VoiceSettings {
            kickoff_message: Some("Hello".to_string()),
            mix_gains: MixGains {
                user: 0.8,
                agent: 0.5,
            },
            ..VoiceSettings::default()
        };

        save_settings(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(try_load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_agent_config_from_settings() {
        let settings = VoiceSettings::default();
        let config = settings.agent_config("Be kind", Vec::new());
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, DEFAULT_VOICE);
        assert_eq!(config.system_instruction, "Be kind");
        assert_eq!(config.response_modality, ResponseModality::Audio);

        let options = settings.transport_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }
}
