//! WAV container helpers built on hound
//!
//! The canonical artifact is RIFF/WAVE, mono, 16-bit PCM. The live mixer
//! streams 32-bit float WAV to a scratch file while recording and
//! transcodes it to the canonical form at the end.

use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

/// MIME type used when uploading artifacts
pub const WAV_MIME: &str = "audio/wav";

fn pcm16_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Encode mono PCM16 samples as a canonical WAV file in memory.
pub fn encode_pcm16(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, pcm16_spec(sample_rate))?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Convert a normalized float to PCM16 the way WAV exporters do:
/// clamp to [-1, 1], scale negatives by 0x8000 and positives by 0x7FFF.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Re-encode any mono or multichannel WAV as canonical mono PCM16.
///
/// Returns the new bytes and the sample rate.
pub fn transcode_to_pcm16(bytes: &[u8]) -> Result<(Vec<u8>, u32), hound::Error> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map(float_to_pcm16))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits) => {
            let shift = bits.saturating_sub(16) as u32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<_, _>>()?
        }
    };

    let mono: Vec<i16> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16)
            .collect()
    };

    Ok((encode_pcm16(&mono, spec.sample_rate)?, spec.sample_rate))
}

/// Size of the `data` chunk as declared in the header.
pub fn data_chunk_len(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
        if id == b"data" {
            return Some(size);
        }
        // Chunks are word-aligned
        pos += 8 + size as usize + (size as usize & 1);
    }
    None
}

/// Streaming 32-bit float WAV writer backed by a scratch file.
pub struct FloatWavFile {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
    samples_written: u64,
}

impl FloatWavFile {
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path, spec)?;
        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            samples_written: 0,
        })
    }

    pub fn write(&mut self, samples: &[f32]) -> Result<(), hound::Error> {
        if let Some(writer) = self.writer.as_mut() {
            for &s in samples {
                writer.write_sample(s)?;
            }
            self.samples_written += samples.len() as u64;
        }
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Finalize the header, read the file back and delete it.
    pub fn finish(mut self) -> Result<Vec<u8>, hound::Error> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        let bytes = std::fs::read(&self.path)?;
        self.remove();
        Ok(bytes)
    }

    fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Recorder: failed to remove scratch file {:?}: {}", self.path, e);
            }
        }
    }
}

impl Drop for FloatWavFile {
    fn drop(&mut self) {
        // Abandoned without finish(): discard the scratch file
        if self.writer.take().is_some() {
            self.remove();
        }
    }
}
