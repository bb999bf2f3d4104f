//! Gapless playback of agent audio with barge-in support
//!
//! Agent frames are appended to a `PlaybackQueue`. The output device callback
//! pulls samples out of the queue through `PlaybackQueue::render`, so the
//! only thing shared with the audio thread is the queue lock.
//!
//! - `interrupt()` empties the queue under the lock; the next render is silence.
//! - `drain()` lets queued audio finish and refuses new frames until
//!   `begin_utterance()` or until the queue plays out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{pcm, AudioError, AudioFrame, AGENT_SAMPLE_RATE};

/// Errors returned when handing frames to playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// The output device could not be initialized
    Unavailable(String),
    /// The queue is draining the previous utterance
    Draining,
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::Unavailable(e) => write!(f, "Audio output unavailable: {}", e),
            PlaybackError::Draining => write!(f, "Playback is draining, frame rejected"),
        }
    }
}

impl std::error::Error for PlaybackError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Playing,
    Draining,
}

/// An open output stream. Dropping it closes the device.
pub trait OutputStream: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

/// Something that can open a speaker.
pub trait OutputBackend: Send + Sync {
    /// Open the output device and start rendering from `queue`.
    ///
    /// Implementations must call `PlaybackQueue::set_device_rate` before the
    /// first render.
    fn open(&self, queue: Arc<Mutex<PlaybackQueue>>) -> Result<Box<dyn OutputStream>, AudioError>;
}

/// Ordered queue of agent frames, rendered to f32 at the device rate.
pub struct PlaybackQueue {
    frames: VecDeque<AudioFrame>,
    /// Read position inside the front frame, in source samples
    cursor: f64,
    device_rate: u32,
    phase: PlaybackPhase,
    frames_played: u64,
    frames_discarded: u64,
}

impl PlaybackQueue {
    pub fn new(device_rate: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            cursor: 0.0,
            device_rate,
            phase: PlaybackPhase::Idle,
            frames_played: 0,
            frames_discarded: 0,
        }
    }

    pub fn set_device_rate(&mut self, rate: u32) {
        self.device_rate = rate;
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }

    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded
    }

    pub fn push(&mut self, frame: AudioFrame) -> Result<(), PlaybackError> {
        if self.phase == PlaybackPhase::Draining {
            return Err(PlaybackError::Draining);
        }
        if frame.is_empty() {
            return Ok(());
        }
        self.frames.push_back(frame);
        self.phase = PlaybackPhase::Playing;
        Ok(())
    }

    /// Drop everything queued, including the frame being played.
    pub fn clear(&mut self) -> usize {
        let discarded = self.frames.len();
        self.frames.clear();
        self.cursor = 0.0;
        self.phase = PlaybackPhase::Idle;
        self.frames_discarded += discarded as u64;
        discarded
    }

    pub fn drain(&mut self) {
        self.phase = if self.frames.is_empty() {
            PlaybackPhase::Idle
        } else {
            PlaybackPhase::Draining
        };
    }

    pub fn begin_utterance(&mut self) {
        if self.phase == PlaybackPhase::Draining {
            self.phase = PlaybackPhase::Playing;
        }
    }

    /// Fill `out` with interleaved samples for `channels` output channels.
    /// Mono audio is duplicated across channels; an empty queue renders silence.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let sample = self.next_sample().unwrap_or(0.0);
            frame.fill(sample);
        }
        if self.frames.is_empty() && self.phase != PlaybackPhase::Idle {
            self.phase = PlaybackPhase::Idle;
        }
    }

    fn next_sample(&mut self) -> Option<f32> {
        loop {
            let front = self.frames.front()?;
            let samples = front.samples();
            let idx = self.cursor as usize;
            if idx >= samples.len() {
                self.cursor -= samples.len() as f64;
                self.frames.pop_front();
                self.frames_played += 1;
                continue;
            }

            let frac = (self.cursor - idx as f64) as f32;
            let a = pcm::i16_to_f32(samples[idx]);
            let b = match samples.get(idx + 1) {
                Some(&s) => pcm::i16_to_f32(s),
                None => self
                    .frames
                    .get(1)
                    .and_then(|next| next.samples().first())
                    .map(|&s| pcm::i16_to_f32(s))
                    .unwrap_or(a),
            };
            self.cursor += front.sample_rate() as f64 / self.device_rate.max(1) as f64;
            return Some(a + (b - a) * frac);
        }
    }
}

struct SchedulerInner {
    backend: Arc<dyn OutputBackend>,
    queue: Arc<Mutex<PlaybackQueue>>,
    output: Mutex<Option<Box<dyn OutputStream>>>,
    initializations: AtomicUsize,
}

/// Handle to the shared playback path. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<SchedulerInner>,
}

impl PlaybackScheduler {
    pub fn new(backend: Arc<dyn OutputBackend>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backend,
                queue: Arc::new(Mutex::new(PlaybackQueue::new(AGENT_SAMPLE_RATE))),
                output: Mutex::new(None),
                initializations: AtomicUsize::new(0),
            }),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, PlaybackQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the output path on first use. Later calls are no-ops.
    fn ensure_output(&self) -> Result<(), PlaybackError> {
        let mut output = self
            .inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if output.is_some() {
            return Ok(());
        }

        let stream = self
            .inner
            .backend
            .open(self.inner.queue.clone())
            .map_err(|e| {
                log::error!("Playback: output initialization failed: {}", e);
                PlaybackError::Unavailable(e.to_string())
            })?;
        log::info!(
            "Playback: output ready ({} Hz, {} channels)",
            stream.sample_rate(),
            stream.channels()
        );
        *output = Some(stream);
        self.inner.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Queue a frame behind everything already queued.
    pub fn enqueue(&self, frame: AudioFrame) -> Result<(), PlaybackError> {
        self.ensure_output()?;
        self.queue().push(frame)
    }

    /// Stop immediately. Returns the number of frames discarded.
    pub fn interrupt(&self) -> usize {
        let discarded = self.queue().clear();
        if discarded > 0 {
            log::info!("Playback: interrupted, discarded {} queued frames", discarded);
        }
        discarded
    }

    /// Let queued audio finish; new frames are rejected until the next utterance.
    pub fn drain(&self) {
        self.queue().drain();
    }

    /// Accept frames again after a drain.
    pub fn begin_utterance(&self) {
        self.queue().begin_utterance();
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.queue().phase()
    }

    pub fn is_playing(&self) -> bool {
        self.queue().queued_frames() > 0
    }

    pub fn queued_frames(&self) -> usize {
        self.queue().queued_frames()
    }

    /// How many times the output path was opened.
    pub fn output_initializations(&self) -> usize {
        self.inner.initializations.load(Ordering::SeqCst)
    }

    pub fn output_ready(&self) -> bool {
        self.inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
