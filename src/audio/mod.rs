//! Audio primitives for the duplex voice pipeline
//!
//! # Architecture
//!
//! ```text
//! Microphone ──▶ CaptureEngine ──▶ AudioFrame (PCM16 16kHz, Local) ──▶ transport uplink
//!                                        │
//!                                        └──▶ SessionRecorder
//!
//! transport downlink ──▶ AudioFrame (PCM16 24kHz, Remote) ──▶ PlaybackScheduler ──▶ Speakers
//!                                        │
//!                                        └──▶ SessionRecorder
//! ```
//!
//! Device access goes through the `InputBackend` / `OutputBackend` traits so
//! the same pipeline runs against cpal or against `virtual_device` in tests.

mod cpal_backend;
pub mod capture;
pub mod devices;
pub mod pcm;
pub mod playback;
pub mod virtual_device;
pub mod wav;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

pub use capture::{CaptureConfig, CaptureEngine, InputBackend, InputFormat, InputStream, SampleSink};
pub use cpal_backend::{CpalInput, CpalOutput};
pub use devices::{AudioDevices, MicrophoneLease};
pub use playback::{OutputBackend, OutputStream, PlaybackError, PlaybackQueue, PlaybackScheduler};

/// Sample rate of the microphone uplink sent to the agent
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the audio the agent sends back
pub const AGENT_SAMPLE_RATE: u32 = 24_000;

/// Errors that can occur while acquiring or running an audio device.
#[derive(Debug, Clone)]
pub enum AudioError {
    /// No device, no permission, or the device is held by another session
    DeviceUnavailable(String),
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// A stop() arrived while this start() was still in flight
    StartCancelled,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::StartCancelled => write!(f, "Audio start cancelled by stop"),
        }
    }
}

impl std::error::Error for AudioError {}

/// Which side of the conversation a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    /// The user's microphone
    Local,
    /// The remote agent
    Remote,
}

/// A contiguous block of mono PCM16 samples.
///
/// Frames are immutable once built. Cloning shares the sample buffer, so the
/// same agent frame can go to playback and the recorder without a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    channels: u16,
    source: AudioSource,
    offset: Duration,
}

impl AudioFrame {
    /// Build a mono frame. `offset` is measured from session start.
    pub fn new(samples: Vec<i16>, sample_rate: u32, source: AudioSource, offset: Duration) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: 1,
            source,
            offset,
        }
    }

    /// Build a frame from little-endian PCM16 bytes (the wire format).
    pub fn from_pcm16_le(
        bytes: &[u8],
        sample_rate: u32,
        source: AudioSource,
        offset: Duration,
    ) -> Self {
        Self::new(pcm::decode_pcm16_le(bytes), sample_rate, source, offset)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn source(&self) -> AudioSource {
        self.source
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame at its own sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Encode as little-endian PCM16 bytes.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        pcm::encode_pcm16_le(&self.samples)
    }

    /// Same samples, converted to `target_rate`. Returns a cheap clone when
    /// the rate already matches.
    pub fn resampled(&self, target_rate: u32) -> AudioFrame {
        if self.sample_rate == target_rate {
            return self.clone();
        }
        AudioFrame {
            samples: pcm::resample_i16(&self.samples, self.sample_rate, target_rate).into(),
            sample_rate: target_rate,
            channels: self.channels,
            source: self.source,
            offset: self.offset,
        }
    }
}
