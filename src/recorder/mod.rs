//! Conversation recording
//!
//! A `SessionRecorder` collects the user's outgoing audio and the agent's
//! incoming audio and produces one WAV artifact at the end of the session.
//! How the two sides are combined is up to the `RecordingStrategy`:
//!
//! - `TimelineMerge` buffers every frame and serializes them by timestamp
//! - `LiveMix` sums both sides on a mixing bus and streams the mix to disk
//!
//! Both strategies finalize exactly once and release their buffers even when
//! finalizing fails.

mod live_mix;
mod timeline;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use live_mix::{LiveMix, MixGains};
pub use timeline::TimelineMerge;

use crate::audio::{wav, AudioFrame, AudioSource};

/// Errors that can occur while recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderError {
    /// Finalize found no audio at all
    NoAudioCaptured,
    AlreadyFinalized,
    NotStarted,
    AlreadyRecording,
    /// The container could not be written
    EncodingFailed(String),
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderError::NoAudioCaptured => write!(f, "No audio data recorded"),
            RecorderError::AlreadyFinalized => write!(f, "Recording was already finalized"),
            RecorderError::NotStarted => write!(f, "Recording was never started"),
            RecorderError::AlreadyRecording => write!(f, "Recording is already in progress"),
            RecorderError::EncodingFailed(e) => write!(f, "Failed to encode recording: {}", e),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<hound::Error> for RecorderError {
    fn from(e: hound::Error) -> Self {
        RecorderError::EncodingFailed(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderStrategyKind {
    #[default]
    TimelineMerge,
    LiveMix,
}

/// Container of the finished artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// RIFF/WAVE, mono, 16-bit PCM
    Pcm16Wav,
    /// The live mixer's 32-bit float WAV, returned when transcoding failed
    Float32Wav,
}

/// Where a stretch of the artifact came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub source: AudioSource,
    /// Start within the artifact
    pub start: Duration,
    pub duration: Duration,
    /// When the frame was captured or received, from session start
    pub captured_at: Duration,
}

/// A finished recording. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedConversation {
    wav: Vec<u8>,
    sample_rate: u32,
    duration: Duration,
    strategy: RecorderStrategyKind,
    container: ContainerFormat,
    segments: Vec<Segment>,
}

impl RecordedConversation {
    pub fn new(
        wav: Vec<u8>,
        sample_rate: u32,
        samples: u64,
        strategy: RecorderStrategyKind,
        container: ContainerFormat,
        segments: Vec<Segment>,
    ) -> Self {
        Self {
            wav,
            sample_rate,
            duration: samples_to_duration(samples, sample_rate),
            strategy,
            container,
            segments,
        }
    }

    pub fn wav_bytes(&self) -> &[u8] {
        &self.wav
    }

    pub fn into_wav_bytes(self) -> Vec<u8> {
        self.wav
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn strategy(&self) -> RecorderStrategyKind {
        self.strategy
    }

    pub fn container(&self) -> ContainerFormat {
        self.container
    }

    /// Per-segment source attribution (timeline strategy only).
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Size of the WAV `data` chunk.
    pub fn data_len(&self) -> Option<u32> {
        wav::data_chunk_len(&self.wav)
    }
}

pub(crate) fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples * 1_000_000_000 / sample_rate as u64)
}

pub(crate) fn offset_to_samples(offset: Duration, sample_rate: u32) -> u64 {
    (offset.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// How the two sides of the conversation become one artifact.
///
/// Frames handed to `push` are mono and already at the recorder rate.
pub trait RecordingStrategy: Send {
    fn kind(&self) -> RecorderStrategyKind;

    /// Prepare for the first frame (open files, reset buffers).
    fn start(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn push(&mut self, frame: &AudioFrame);

    /// Produce the artifact. Internal buffers are released whatever the outcome.
    fn finish(&mut self) -> Result<RecordedConversation, RecorderError>;
}

/// Recorder settings
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub strategy: RecorderStrategyKind,
    /// Rate of the finished artifact
    pub sample_rate: u32,
    pub gains: MixGains,
    /// Directory for the live mixer's scratch file
    pub scratch_dir: PathBuf,
}

enum RecorderState {
    Idle(Box<dyn RecordingStrategy>),
    Recording(Box<dyn RecordingStrategy>),
    Finalized,
}

struct RecorderInner {
    sample_rate: u32,
    recording: AtomicBool,
    state: Mutex<RecorderState>,
    feed: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Records one session. Cheap to clone; clones share the same recording.
#[derive(Clone)]
pub struct SessionRecorder {
    inner: Arc<RecorderInner>,
}

impl SessionRecorder {
    pub fn new(strategy: Box<dyn RecordingStrategy>, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                sample_rate,
                recording: AtomicBool::new(false),
                state: Mutex::new(RecorderState::Idle(strategy)),
                feed: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        let strategy: Box<dyn RecordingStrategy> = match config.strategy {
            RecorderStrategyKind::TimelineMerge => Box::new(TimelineMerge::new(config.sample_rate)),
            RecorderStrategyKind::LiveMix => Box::new(LiveMix::new(
                config.sample_rate,
                config.gains,
                config.scratch_dir.clone(),
            )),
        };
        Self::new(strategy, config.sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<(), RecorderError> {
        let mut state = self.state();
        match std::mem::replace(&mut *state, RecorderState::Finalized) {
            RecorderState::Idle(mut strategy) => {
                if let Err(e) = strategy.start() {
                    *state = RecorderState::Idle(strategy);
                    return Err(e);
                }
                log::info!("Recorder: started ({:?})", strategy.kind());
                *state = RecorderState::Recording(strategy);
                self.inner.recording.store(true, Ordering::SeqCst);
                Ok(())
            }
            RecorderState::Recording(strategy) => {
                *state = RecorderState::Recording(strategy);
                Err(RecorderError::AlreadyRecording)
            }
            RecorderState::Finalized => Err(RecorderError::AlreadyFinalized),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    /// Record the user's side. No-op unless recording.
    pub fn add_user_audio(&self, frame: &AudioFrame) {
        self.add(frame);
    }

    /// Record the agent's side. No-op unless recording.
    pub fn add_agent_audio(&self, frame: &AudioFrame) {
        self.add(frame);
    }

    fn add(&self, frame: &AudioFrame) {
        if !self.is_recording() || frame.is_empty() {
            return;
        }
        let frame = frame.resampled(self.inner.sample_rate);
        if let RecorderState::Recording(strategy) = &mut *self.state() {
            strategy.push(&frame);
        }
    }

    /// Feed the user's side from a capture subscription until finalize.
    pub fn attach_user_stream(&self, mut rx: mpsc::UnboundedReceiver<AudioFrame>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let recorder = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => recorder.add_user_audio(&frame),
                        None => break,
                    },
                }
            }
            log::debug!("Recorder: user audio feed stopped");
        });

        let previous = self
            .inner
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((cancel, handle));
        if let Some((old_cancel, _)) = previous {
            old_cancel.cancel();
        }
    }

    /// Produce the artifact. Only the first call can succeed.
    pub fn finalize(&self) -> Result<RecordedConversation, RecorderError> {
        let strategy = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, RecorderState::Finalized) {
                RecorderState::Recording(strategy) => {
                    self.inner.recording.store(false, Ordering::SeqCst);
                    strategy
                }
                RecorderState::Idle(strategy) => {
                    *state = RecorderState::Idle(strategy);
                    return Err(RecorderError::NotStarted);
                }
                RecorderState::Finalized => return Err(RecorderError::AlreadyFinalized),
            }
        };

        self.release_feed();

        let mut strategy = strategy;
        let result = strategy.finish();
        match &result {
            Ok(recording) => log::info!(
                "Recorder: finalized {:?} recording, {:.1}s, {} bytes",
                recording.strategy(),
                recording.duration().as_secs_f32(),
                recording.wav_bytes().len()
            ),
            Err(e) => log::warn!("Recorder: finalize failed: {}", e),
        }
        result
    }

    fn release_feed(&self) {
        let feed = self
            .inner
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = feed {
            cancel.cancel();
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AGENT_SAMPLE_RATE;

    fn timeline() -> SessionRecorder {
        SessionRecorder::new(Box::new(TimelineMerge::new(AGENT_SAMPLE_RATE)), AGENT_SAMPLE_RATE)
    }

    fn frame(source: AudioSource, rate: u32, samples: usize, offset_ms: u64) -> AudioFrame {
        AudioFrame::new(vec![1000; samples], rate, source, Duration::from_millis(offset_ms))
    }

    #[test]
    fn test_add_before_start_and_after_stop_is_noop() {
        let recorder = timeline();
        recorder.add_agent_audio(&frame(AudioSource::Remote, 24000, 240, 0));
        assert!(!recorder.is_recording());

        recorder.start().unwrap();
        recorder.add_agent_audio(&frame(AudioSource::Remote, 24000, 240, 0));
        let recording = recorder.finalize().unwrap();
        assert_eq!(recording.data_len(), Some(480));

        assert!(!recorder.is_recording());
        recorder.add_agent_audio(&frame(AudioSource::Remote, 24000, 240, 10));
        assert_eq!(recorder.finalize().unwrap_err(), RecorderError::AlreadyFinalized);
    }

    #[test]
    fn test_empty_recording() {
        let recorder = timeline();
        recorder.start().unwrap();
        assert_eq!(recorder.finalize().unwrap_err(), RecorderError::NoAudioCaptured);
        assert_eq!(recorder.finalize().unwrap_err(), RecorderError::AlreadyFinalized);
    }

    #[test]
    fn test_finalize_before_start() {
        let recorder = timeline();
        assert_eq!(recorder.finalize().unwrap_err(), RecorderError::NotStarted);
        recorder.start().unwrap();
        assert_eq!(recorder.start().unwrap_err(), RecorderError::AlreadyRecording);
    }

    #[test]
    fn test_uplink_rate_is_resampled() {
        let recorder = timeline();
        recorder.start().unwrap();
        // 1600 samples at 16kHz = 100ms = 2400 samples at 24kHz
        recorder.add_user_audio(&frame(AudioSource::Local, 16000, 1600, 0));
        let recording = recorder.finalize().unwrap();
        assert_eq!(recording.data_len(), Some(4800));
        assert_eq!(recording.duration(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_user_stream_is_released_on_finalize() {
        let recorder = timeline();
        recorder.start().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        recorder.attach_user_stream(rx);

        tx.send(frame(AudioSource::Local, 24000, 2400, 0)).unwrap();
        // Let the feed task drain the channel
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let recording = recorder.finalize().unwrap();
        assert_eq!(recording.data_len(), Some(4800));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(tx.send(frame(AudioSource::Local, 24000, 10, 200)).is_err());
    }
}
