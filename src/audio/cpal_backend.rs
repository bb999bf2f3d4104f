//! cpal-backed input and output devices
//!
//! `cpal::Stream` is not `Send`, so each stream lives on a dedicated thread
//! that builds it, plays it, and parks until the handle is dropped.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::capture::{InputBackend, InputFormat, InputStream, SampleSink};
use super::playback::{OutputBackend, OutputStream, PlaybackQueue};
use super::{AudioError, AGENT_SAMPLE_RATE};

/// Keeps a stream thread alive; dropping it stops and joins the thread.
struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn a thread that builds a stream with `build`, plays it, and holds it
    /// until dropped. Returns once the stream is playing (or failed to start).
    fn spawn<T, F>(name: &str, build: F) -> Result<(Self, T), AudioError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(Stream, T), AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<T, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, info) = match build() {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(info));
                // Park until the handle is dropped (sender gone) or stop is sent
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let info = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamCreationFailed("audio thread exited".to_string()))??;

        Ok((
            Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            info,
        ))
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Audio thread panicked during shutdown");
            }
        }
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceUnavailable("device not available".to_string())
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

/// Pick a supported config at `preferred_rate` when the device offers one,
/// otherwise fall back to the device default.
fn choose_config(
    device: &Device,
    preferred_rate: u32,
    input: bool,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if input {
        device
            .supported_input_configs()
            .map(|r| r.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|r| r.collect())
            .unwrap_or_default()
    };

    let usable = |f: SampleFormat| matches!(f, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16);
    let preferred = ranges
        .iter()
        .filter(|r| usable(r.sample_format()))
        .filter(|r| r.min_sample_rate().0 <= preferred_rate && preferred_rate <= r.max_sample_rate().0)
        .min_by_key(|r| r.channels());

    if let Some(range) = preferred {
        let supported = range.clone().with_sample_rate(cpal::SampleRate(preferred_rate));
        let format = supported.sample_format();
        return Ok((supported.into(), format));
    }

    let default = if input {
        device.default_input_config()
    } else {
        device.default_output_config()
    }
    .map_err(|_| AudioError::NoSupportedConfig)?;
    let format = default.sample_format();
    Ok((default.into(), format))
}

/// Default cpal input device.
pub struct CpalInput;

impl InputBackend for CpalInput {
    fn open(
        &self,
        preferred_rate: u32,
        sink: SampleSink,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        let (thread, format) = StreamThread::spawn("capture-audio", move || {
            build_input(preferred_rate, sink)
        })?;
        Ok(Box::new(CpalInputStream {
            format,
            _thread: thread,
        }))
    }
}

struct CpalInputStream {
    format: InputFormat,
    _thread: StreamThread,
}

impl InputStream for CpalInputStream {
    fn format(&self) -> InputFormat {
        self.format
    }
}

fn build_input(preferred_rate: u32, sink: SampleSink) -> Result<(Stream, InputFormat), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no audio input device found".to_string()))?;
    log::info!("Capture: using input device {:?}", device.name());

    let (config, sample_format) = choose_config(&device, preferred_rate, true)?;
    let format = InputFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    log::info!(
        "Capture: device config {} Hz, {} channels, {:?}",
        format.sample_rate,
        format.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, format, sink),
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, format, sink),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, format, sink),
        _ => Err(AudioError::NoSupportedConfig),
    }?;
    Ok((stream, format))
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    format: InputFormat,
    mut sink: SampleSink,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                sink(format, &scratch);
            },
            |err| log::error!("Capture: input stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

/// Default cpal output device.
pub struct CpalOutput;

impl OutputBackend for CpalOutput {
    fn open(&self, queue: Arc<Mutex<PlaybackQueue>>) -> Result<Box<dyn OutputStream>, AudioError> {
        let (thread, (sample_rate, channels)) =
            StreamThread::spawn("playback-audio", move || build_output(queue))?;
        Ok(Box::new(CpalOutputStream {
            sample_rate,
            channels,
            _thread: thread,
        }))
    }
}

struct CpalOutputStream {
    sample_rate: u32,
    channels: u16,
    _thread: StreamThread,
}

impl OutputStream for CpalOutputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

fn build_output(queue: Arc<Mutex<PlaybackQueue>>) -> Result<(Stream, (u32, u16)), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no audio output device found".to_string()))?;
    log::info!("Playback: using output device {:?}", device.name());

    let (config, sample_format) = choose_config(&device, AGENT_SAMPLE_RATE, false)?;
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .set_device_rate(config.sample_rate.0);

    let stream = match sample_format {
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, queue),
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, queue),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, queue),
        _ => Err(AudioError::NoSupportedConfig),
    }?;
    Ok((stream, (config.sample_rate.0, config.channels)))
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<Mutex<PlaybackQueue>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render(&mut scratch, channels);
                for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(s);
                }
            },
            |err| log::error!("Playback: output stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}
