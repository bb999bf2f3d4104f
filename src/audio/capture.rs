//! Microphone capture into fixed-size PCM16 frames
//!
//! The capture engine owns the input device for the duration of a session.
//! Device callbacks deliver interleaved f32 buffers; the `FrameEncoder`
//! downmixes, resamples and converts them into `AudioFrame`s of a fixed
//! sample count, which are fanned out to every subscriber in order.
//!
//! The callback only locks the encoder and does unbounded channel sends, so
//! it never waits on the network or disk.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::devices::{MicrophoneGate, MicrophoneLease};
use super::{pcm, AudioError, AudioFrame, AudioSource, CAPTURE_SAMPLE_RATE};

/// Samples per frame (matches a 2048-sample worklet buffer)
pub const DEFAULT_FRAME_SAMPLES: usize = 2048;

/// Format of the buffers an input device delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Receives interleaved f32 buffers from the device callback.
pub type SampleSink = Box<dyn FnMut(InputFormat, &[f32]) + Send + 'static>;

/// An open input stream. Dropping it closes the device.
pub trait InputStream: Send {
    fn format(&self) -> InputFormat;
}

/// Something that can open a microphone.
pub trait InputBackend: Send + Sync {
    /// Open the input device and start delivering buffers to `sink`.
    ///
    /// May block while the device starts; callers run it off the async runtime.
    fn open(
        &self,
        preferred_rate: u32,
        sink: SampleSink,
    ) -> Result<Box<dyn InputStream>, AudioError>;
}

/// Capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Rate of the emitted frames
    pub sample_rate: u32,
    /// Samples per emitted frame
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    }
}

/// Converts device buffers into fixed-size PCM16 frames.
pub struct FrameEncoder {
    sample_rate: u32,
    frame_samples: usize,
    resampler: Option<pcm::StreamResampler>,
    pending: Vec<i16>,
    emitted_samples: u64,
    base_offset: Duration,
}

impl FrameEncoder {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_samples: config.frame_samples.max(1),
            resampler: None,
            pending: Vec::with_capacity(config.frame_samples * 2),
            emitted_samples: 0,
            base_offset: Duration::ZERO,
        }
    }

    /// Forget buffered samples and restart frame offsets at `base_offset`.
    pub fn reset(&mut self, base_offset: Duration) {
        self.resampler = None;
        self.pending.clear();
        self.emitted_samples = 0;
        self.base_offset = base_offset;
    }

    /// Feed one device buffer; returns every frame that became complete.
    pub fn encode(&mut self, format: InputFormat, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mono = pcm::downmix_to_mono(interleaved, format.channels);
        if self.resampler.as_ref().map(pcm::StreamResampler::source_rate) != Some(format.sample_rate) {
            self.resampler = Some(pcm::StreamResampler::new(format.sample_rate, self.sample_rate));
        }
        let resampled = match &mut self.resampler {
            Some(resampler) => resampler.process(&mono),
            None => mono,
        };
        self.pending
            .extend(resampled.into_iter().map(pcm::f32_to_i16));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let samples: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            let offset = self.base_offset
                + Duration::from_nanos(
                    self.emitted_samples * 1_000_000_000 / self.sample_rate.max(1) as u64,
                );
            self.emitted_samples += self.frame_samples as u64;
            frames.push(AudioFrame::new(
                samples,
                self.sample_rate,
                AudioSource::Local,
                offset,
            ));
        }
        frames
    }
}

struct ActiveCapture {
    // Field order matters: close the stream before releasing the lease
    _stream: Box<dyn InputStream>,
    _lease: MicrophoneLease,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<AudioFrame>>>>;

struct CaptureInner {
    backend: Arc<dyn InputBackend>,
    microphone: MicrophoneGate,
    config: CaptureConfig,
    encoder: OnceLock<Arc<Mutex<FrameEncoder>>>,
    encoder_loads: AtomicUsize,
    subscribers: Subscribers,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    running: AtomicBool,
    /// Bumped by every stop(); a start() that sees a newer value tears itself down
    generation: AtomicU64,
    epoch: Mutex<Instant>,
}

/// Microphone capture engine. Cheap to clone; clones share one device.
#[derive(Clone)]
pub struct CaptureEngine {
    inner: Arc<CaptureInner>,
}

impl CaptureEngine {
    pub fn new(
        backend: Arc<dyn InputBackend>,
        microphone: MicrophoneGate,
        config: CaptureConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                backend,
                microphone,
                config,
                encoder: OnceLock::new(),
                encoder_loads: AtomicUsize::new(0),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                active: tokio::sync::Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                epoch: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn config(&self) -> CaptureConfig {
        self.inner.config
    }

    /// Instant that frame offsets are measured from (the session start).
    pub fn set_epoch(&self, epoch: Instant) {
        *self
            .inner
            .epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    /// Receive every frame captured from now on, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AudioFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Acquire the microphone and start emitting frames.
    ///
    /// The returned future is tied to the moment `start()` was called: if
    /// `stop()` runs before it settles, the device is released again and the
    /// future resolves to `AudioError::StartCancelled`.
    pub fn start(&self) -> impl Future<Output = Result<(), AudioError>> + Send + 'static {
        let ticket = self.inner.generation.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        async move { inner.start(ticket).await }
    }

    /// Release the microphone. Idempotent; waits for an in-flight start.
    pub async fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut active = self.inner.active.lock().await;
        if let Some(capture) = active.take() {
            drop(capture);
            self.inner.running.store(false, Ordering::SeqCst);
            log::info!("Capture: stopped, microphone released");
        } else {
            log::debug!("Capture: stop requested while not running");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// How many times the frame encoder was constructed (1 after first start).
    pub fn encoder_loads(&self) -> usize {
        self.inner.encoder_loads.load(Ordering::SeqCst)
    }
}

impl CaptureInner {
    fn encoder(&self) -> Arc<Mutex<FrameEncoder>> {
        self.encoder
            .get_or_init(|| {
                self.encoder_loads.fetch_add(1, Ordering::SeqCst);
                log::debug!(
                    "Capture: frame encoder loaded ({} Hz, {} samples/frame)",
                    self.config.sample_rate,
                    self.config.frame_samples
                );
                Arc::new(Mutex::new(FrameEncoder::new(self.config)))
            })
            .clone()
    }

    async fn start(self: Arc<Self>, ticket: u64) -> Result<(), AudioError> {
        let mut active = self.active.lock().await;
        if self.generation.load(Ordering::SeqCst) != ticket {
            log::debug!("Capture: start superseded by stop before it began");
            return Err(AudioError::StartCancelled);
        }
        if active.is_some() {
            log::debug!("Capture: already running");
            return Ok(());
        }

        let lease = self.microphone.acquire()?;

        let encoder = self.encoder();
        {
            let epoch = *self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            let base_offset = Instant::now().saturating_duration_since(epoch);
            encoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset(base_offset);
        }

        let sink = make_sink(encoder, self.subscribers.clone());
        let backend = self.backend.clone();
        let rate = self.config.sample_rate;
        let stream = tokio::task::spawn_blocking(move || backend.open(rate, sink))
            .await
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))??;

        if self.generation.load(Ordering::SeqCst) != ticket {
            drop(stream);
            drop(lease);
            log::info!("Capture: stop arrived during start, device released");
            return Err(AudioError::StartCancelled);
        }

        let format = stream.format();
        log::info!(
            "Capture: started (device {} Hz, {} channels → {} Hz mono)",
            format.sample_rate,
            format.channels,
            rate
        );
        *active = Some(ActiveCapture {
            _stream: stream,
            _lease: lease,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn make_sink(encoder: Arc<Mutex<FrameEncoder>>, subscribers: Subscribers) -> SampleSink {
    Box::new(move |format, data| {
        let frames = encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encode(format, data);
        if frames.is_empty() {
            return;
        }
        let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in frames {
            subs.retain(|tx| tx.send(frame.clone()).is_ok());
        }
    })
}
