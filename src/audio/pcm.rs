//! Sample-format helpers shared by capture, playback and recording
//!
//! The capture path converts f32 → i16 by scaling with 32768 and truncating
//! (no dithering, no rounding). Playback converts back by dividing by 32768,
//! so a PCM16 frame survives the round trip bit-exact.

/// Scale factor between normalized float samples and PCM16
const PCM16_SCALE: f32 = 32768.0;

/// Convert a normalized float sample to PCM16.
///
/// Truncates toward zero; out-of-range values saturate at the i16 bounds.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * PCM16_SCALE) as i16
}

/// Convert a PCM16 sample to a normalized float in [-1, 1).
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Encode samples as little-endian PCM16 bytes (the wire format).
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM16 bytes into samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<i16> {
    if bytes.len() % 2 != 0 {
        log::warn!(
            "PCM16 payload has odd length ({} bytes), dropping trailing byte",
            bytes.len()
        );
    }
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono float audio from `source_rate` to `target_rate`.
///
/// Integer downsampling ratios (e.g. 48kHz → 16kHz) average each group of
/// samples. Every other ratio uses linear interpolation.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let step = source_rate as f64 / target_rate as f64;
    let out_len = (samples.len() as f64 / step).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }
    out
}

/// Resampler for a continuous stream delivered in arbitrary buffer sizes.
///
/// Unlike [`resample`], leftover input and the fractional read position carry
/// over between calls, so the output length tracks the stream duration no
/// matter how the device splits its buffers.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    pending: Vec<f32>,
    /// Read position in `pending`, in source samples
    position: f64,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                source_rate,
                target_rate
            );
        }
        Self {
            source_rate,
            target_rate,
            pending: Vec::new(),
            position: 0.0,
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    fn is_passthrough(&self) -> bool {
        self.source_rate == 0 || self.target_rate == 0 || self.source_rate == self.target_rate
    }

    /// Feed the next stretch of mono input; returns the output it completes.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);

        if self.source_rate > self.target_rate && self.source_rate % self.target_rate == 0 {
            let ratio = (self.source_rate / self.target_rate) as usize;
            let whole = self.pending.len() / ratio * ratio;
            let out = self.pending[..whole]
                .chunks_exact(ratio)
                .map(|chunk| chunk.iter().sum::<f32>() / ratio as f32)
                .collect();
            self.pending.drain(..whole);
            return out;
        }

        let step = self.source_rate as f64 / self.target_rate as f64;
        let mut out = Vec::new();
        while (self.position as usize) + 1 < self.pending.len() {
            let idx = self.position as usize;
            let frac = (self.position - idx as f64) as f32;
            let a = self.pending[idx];
            let b = self.pending[idx + 1];
            out.push(a + (b - a) * frac);
            self.position += step;
        }
        let consumed = (self.position as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.position -= consumed as f64;
        out
    }
}

/// Resample PCM16 audio. Returns an exact copy when the rates match.
pub fn resample_i16(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate {
        return samples.to_vec();
    }
    let floats: Vec<f32> = samples.iter().map(|&s| s as f32).collect();
    resample(&floats, source_rate, target_rate)
        .into_iter()
        .map(|s| s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}
