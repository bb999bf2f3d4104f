//! In-process audio devices for tests and headless runs
//!
//! `VirtualInput` lets the caller push f32 buffers as if a microphone
//! callback delivered them. `VirtualOutput` lets the caller pull rendered
//! samples as if a speaker callback requested them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::capture::{InputBackend, InputFormat, InputStream, SampleSink};
use super::playback::{OutputBackend, OutputStream, PlaybackQueue};
use super::AudioError;

struct InputShared {
    format: InputFormat,
    sink: Mutex<Option<SampleSink>>,
    opens: AtomicUsize,
    failure: Option<String>,
    open_delay: Duration,
}

/// A microphone driven by `push`.
#[derive(Clone)]
pub struct VirtualInput {
    shared: Arc<InputShared>,
}

impl VirtualInput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::build(
            InputFormat {
                sample_rate,
                channels,
            },
            None,
            Duration::ZERO,
        )
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// A microphone whose open always fails with `DeviceUnavailable`.
    pub fn failing(reason: &str) -> Self {
        Self::build(
            InputFormat {
                sample_rate: 16000,
                channels: 1,
            },
            Some(reason.to_string()),
            Duration::ZERO,
        )
    }

    /// Make `open` block for `delay`, like a slow permission prompt.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        Self::build(self.shared.format, self.shared.failure.clone(), delay)
    }

    fn build(format: InputFormat, failure: Option<String>, open_delay: Duration) -> Self {
        Self {
            shared: Arc::new(InputShared {
                format,
                sink: Mutex::new(None),
                opens: AtomicUsize::new(0),
                failure,
                open_delay,
            }),
        }
    }

    /// Deliver one interleaved buffer. Returns false when the device is closed.
    pub fn push(&self, samples: &[f32]) -> bool {
        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match sink.as_mut() {
            Some(sink) => {
                sink(self.shared.format, samples);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

impl InputBackend for VirtualInput {
    fn open(
        &self,
        _preferred_rate: u32,
        sink: SampleSink,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        if !self.shared.open_delay.is_zero() {
            std::thread::sleep(self.shared.open_delay);
        }
        if let Some(reason) = &self.shared.failure {
            return Err(AudioError::DeviceUnavailable(reason.clone()));
        }
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualInputStream {
            shared: self.shared.clone(),
        }))
    }
}

struct VirtualInputStream {
    shared: Arc<InputShared>,
}

impl InputStream for VirtualInputStream {
    fn format(&self) -> InputFormat {
        self.shared.format
    }
}

impl Drop for VirtualInputStream {
    fn drop(&mut self) {
        self.shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct OutputShared {
    sample_rate: u32,
    channels: u16,
    queue: Mutex<Option<Arc<Mutex<PlaybackQueue>>>>,
    opens: AtomicUsize,
    failure: Option<String>,
}

/// A speaker driven by `render`.
#[derive(Clone)]
pub struct VirtualOutput {
    shared: Arc<OutputShared>,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::build(sample_rate, channels, None)
    }

    /// A speaker whose open always fails.
    pub fn failing(reason: &str) -> Self {
        Self::build(24000, 1, Some(reason.to_string()))
    }

    fn build(sample_rate: u32, channels: u16, failure: Option<String>) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                sample_rate,
                channels,
                queue: Mutex::new(None),
                opens: AtomicUsize::new(0),
                failure,
            }),
        }
    }

    /// Pull `frames` output frames (times channels samples) from the queue.
    /// Returns silence when the device is not open.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let channels = self.shared.channels.max(1) as usize;
        let mut out = vec![0.0; frames * channels];
        let queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(queue) = queue {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .render(&mut out, channels);
        }
        out
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

impl OutputBackend for VirtualOutput {
    fn open(&self, queue: Arc<Mutex<PlaybackQueue>>) -> Result<Box<dyn OutputStream>, AudioError> {
        if let Some(reason) = &self.shared.failure {
            return Err(AudioError::DeviceUnavailable(reason.clone()));
        }
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_device_rate(self.shared.sample_rate);
        *self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(queue);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualOutputStream {
            shared: self.shared.clone(),
        }))
    }
}

struct VirtualOutputStream {
    shared: Arc<OutputShared>,
}

impl OutputStream for VirtualOutputStream {
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn channels(&self) -> u16 {
        self.shared.channels
    }
}

impl Drop for VirtualOutputStream {
    fn drop(&mut self) {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
