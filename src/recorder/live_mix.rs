//! Live mix: sum both sides on a bus and stream the mix to disk
//!
//! ```text
//! user frames  ──▶ gain ──┐
//!                         ├──▶ bus (VecDeque<f32>) ──flush──▶ FloatWavFile (f32, scratch)
//! agent frames ──▶ gain ──┘                                         │
//!                                                      finalize ──▶ PCM16 WAV
//! ```
//!
//! The bus is indexed in samples from session start. Its origin is the
//! position of the first recorded frame, so leading silence is not written.
//! User frames land at their capture offset. Agent frames play back to back:
//! each starts at `max(offset, end of the previous agent frame)`.
//!
//! Samples further than `MIX_WINDOW_SECS` behind the newest write are summed,
//! clamped and flushed. A frame that lands before the flushed region is
//! clipped to it.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{
    offset_to_samples, ContainerFormat, RecordedConversation, RecorderError,
    RecorderStrategyKind, RecordingStrategy,
};
use crate::audio::{pcm, wav, AudioFrame, AudioSource};

/// How far behind the newest sample the bus stays open for late frames
pub const MIX_WINDOW_SECS: u32 = 2;

/// Linear gain per side of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixGains {
    pub user: f32,
    pub agent: f32,
}

impl Default for MixGains {
    fn default() -> Self {
        Self {
            user: 1.0,
            agent: 1.0,
        }
    }
}

pub struct LiveMix {
    sample_rate: u32,
    gains: MixGains,
    scratch_dir: PathBuf,
    window: u64,
    bus: VecDeque<f32>,
    /// Absolute sample index of `bus[0]`; `None` until the first frame
    bus_start: Option<u64>,
    agent_end: u64,
    output: Option<wav::FloatWavFile>,
    write_error: Option<String>,
    clipped: u64,
}

impl LiveMix {
    pub fn new(sample_rate: u32, gains: MixGains, scratch_dir: PathBuf) -> Self {
        Self {
            sample_rate,
            gains,
            scratch_dir,
            window: MIX_WINDOW_SECS as u64 * sample_rate as u64,
            bus: VecDeque::new(),
            bus_start: None,
            agent_end: 0,
            output: None,
            write_error: None,
            clipped: 0,
        }
    }

    fn reset(&mut self) {
        self.bus.clear();
        self.bus_start = None;
        self.agent_end = 0;
        self.output = None;
        self.write_error = None;
        self.clipped = 0;
    }

    fn mix_at(&mut self, position: u64, samples: &[i16], gain: f32) {
        let start = *self.bus_start.get_or_insert(position);

        let mut samples = samples;
        let mut position = position;
        if position < start {
            let skip = (start - position).min(samples.len() as u64) as usize;
            self.clipped += skip as u64;
            samples = &samples[skip..];
            position = start;
        }

        let index = (position - start) as usize;
        let end = index + samples.len();
        if self.bus.len() < end {
            self.bus.resize(end, 0.0);
        }
        for (slot, &s) in self.bus.range_mut(index..end).zip(samples) {
            *slot += pcm::i16_to_f32(s) * gain;
        }
    }

    /// Write out everything older than the mix window.
    fn flush_behind_window(&mut self) {
        let ready = (self.bus.len() as u64).saturating_sub(self.window) as usize;
        if ready > 0 {
            self.flush(ready);
        }
    }

    fn flush(&mut self, count: usize) {
        let count = count.min(self.bus.len());
        let block: Vec<f32> = self
            .bus
            .drain(..count)
            .map(|s| s.clamp(-1.0, 1.0))
            .collect();
        if let Some(start) = self.bus_start.as_mut() {
            *start += count as u64;
        }

        if self.write_error.is_some() {
            return;
        }
        let result = match self.output.as_mut() {
            Some(output) => output.write(&block),
            None => Ok(()),
        };
        if let Err(e) = result {
            log::error!("LiveMix: failed to write mix: {}", e);
            self.write_error = Some(e.to_string());
        }
    }
}

impl RecordingStrategy for LiveMix {
    fn kind(&self) -> RecorderStrategyKind {
        RecorderStrategyKind::LiveMix
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        self.reset();
        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| RecorderError::EncodingFailed(e.to_string()))?;
        let path = self
            .scratch_dir
            .join(format!("mix-{}.wav", uuid::Uuid::new_v4()));
        log::debug!("LiveMix: streaming mix to {:?}", path);
        self.output = Some(wav::FloatWavFile::create(&path, self.sample_rate)?);
        Ok(())
    }

    fn push(&mut self, frame: &AudioFrame) {
        let offset = offset_to_samples(frame.offset(), self.sample_rate);
        match frame.source() {
            AudioSource::Local => self.mix_at(offset, frame.samples(), self.gains.user),
            AudioSource::Remote => {
                let position = offset.max(self.agent_end);
                self.agent_end = position + frame.len() as u64;
                self.mix_at(position, frame.samples(), self.gains.agent);
            }
        }
        self.flush_behind_window();
    }

    fn finish(&mut self) -> Result<RecordedConversation, RecorderError> {
        let remaining = self.bus.len();
        self.flush(remaining);
        if self.clipped > 0 {
            log::warn!("LiveMix: {} late samples clipped", self.clipped);
        }

        let output = self.output.take();
        let write_error = self.write_error.take();
        self.reset();

        // Dropping `output` on an early return removes the scratch file
        let output = output.ok_or(RecorderError::NotStarted)?;
        if let Some(e) = write_error {
            return Err(RecorderError::EncodingFailed(e));
        }
        let samples = output.samples_written();
        if samples == 0 {
            return Err(RecorderError::NoAudioCaptured);
        }

        let native = output.finish()?;
        match wav::transcode_to_pcm16(&native) {
            Ok((pcm16, rate)) => Ok(RecordedConversation::new(
                pcm16,
                rate,
                samples,
                RecorderStrategyKind::LiveMix,
                ContainerFormat::Pcm16Wav,
                Vec::new(),
            )),
            Err(e) => {
                log::warn!(
                    "LiveMix: transcoding to PCM16 failed ({}), keeping float container",
                    e
                );
                Ok(RecordedConversation::new(
                    native,
                    self.sample_rate,
                    samples,
                    RecorderStrategyKind::LiveMix,
                    ContainerFormat::Float32Wav,
                    Vec::new(),
                ))
            }
        }
    }
}
