//! Timeline merge: buffer everything, serialize by timestamp at the end
//!
//! Frames are ordered by their session offset (ties keep arrival order) and
//! concatenated. Overlapping speech is laid end to end rather than summed.

use super::{
    samples_to_duration, ContainerFormat, RecordedConversation, RecorderError,
    RecorderStrategyKind, RecordingStrategy, Segment,
};
use crate::audio::{wav, AudioFrame};

pub struct TimelineMerge {
    sample_rate: u32,
    frames: Vec<AudioFrame>,
}

impl TimelineMerge {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames: Vec::new(),
        }
    }
}

impl RecordingStrategy for TimelineMerge {
    fn kind(&self) -> RecorderStrategyKind {
        RecorderStrategyKind::TimelineMerge
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        self.frames.clear();
        Ok(())
    }

    fn push(&mut self, frame: &AudioFrame) {
        self.frames.push(frame.clone());
    }

    fn finish(&mut self) -> Result<RecordedConversation, RecorderError> {
        let mut frames = std::mem::take(&mut self.frames);
        if frames.iter().all(|f| f.is_empty()) {
            return Err(RecorderError::NoAudioCaptured);
        }

        // sort_by_key is stable
        frames.sort_by_key(|f| f.offset());

        let total: usize = frames.iter().map(|f| f.len()).sum();
        let mut samples = Vec::with_capacity(total);
        let mut segments = Vec::with_capacity(frames.len());
        for frame in &frames {
            let start = samples_to_duration(samples.len() as u64, self.sample_rate);
            segments.push(Segment {
                source: frame.source(),
                start,
                duration: samples_to_duration(frame.len() as u64, self.sample_rate),
                captured_at: frame.offset(),
            });
            samples.extend_from_slice(frame.samples());
        }
        drop(frames);

        log::debug!(
            "TimelineMerge: {} segments, {} samples",
            segments.len(),
            samples.len()
        );

        let bytes = wav::encode_pcm16(&samples, self.sample_rate)?;
        Ok(RecordedConversation::new(
            bytes,
            self.sample_rate,
            samples.len() as u64,
            RecorderStrategyKind::TimelineMerge,
            ContainerFormat::Pcm16Wav,
            segments,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSource;
    use std::io::Cursor;
    use std::time::Duration;

    fn frame(source: AudioSource, value: i16, samples: usize, offset_ms: u64) -> AudioFrame {
        AudioFrame::new(vec![value; samples], 24000, source, Duration::from_millis(offset_ms))
    }

    fn decode(bytes: &[u8]) -> Vec<i16> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().bits_per_sample, 16);
        reader.samples::<i16>().map(|s| s.unwrap()).collect()
    }

    #[test]
    fn test_orders_by_offset() {
        let mut strategy = TimelineMerge::new(24000);
        strategy.start().unwrap();
        strategy.push(&frame(AudioSource::Remote, 2, 3, 500));
        strategy.push(&frame(AudioSource::Local, 1, 2, 0));
        strategy.push(&frame(AudioSource::Local, 3, 1, 900));

        let recording = strategy.finish().unwrap();
        assert_eq!(decode(recording.wav_bytes()), vec![1, 1, 2, 2, 2, 3]);

        let sources: Vec<_> = recording.segments().iter().map(|s| s.source).collect();
        assert_eq!(
            sources,
            vec![AudioSource::Local, AudioSource::Remote, AudioSource::Local]
        );
        assert_eq!(recording.segments()[1].captured_at, Duration::from_millis(500));
        assert_eq!(recording.container(), ContainerFormat::Pcm16Wav);
    }

    #[test]
    fn test_equal_offsets_keep_arrival_order() {
        let mut strategy = TimelineMerge::new(24000);
        strategy.push(&frame(AudioSource::Remote, 7, 1, 100));
        strategy.push(&frame(AudioSource::Local, 8, 1, 100));
        let recording = strategy.finish().unwrap();
        assert_eq!(decode(recording.wav_bytes()), vec![7, 8]);
    }

    #[test]
    fn test_segment_positions() {
        let mut strategy = TimelineMerge::new(24000);
        strategy.push(&frame(AudioSource::Local, 1, 2400, 0));
        strategy.push(&frame(AudioSource::Remote, 1, 4800, 50));
        let recording = strategy.finish().unwrap();

        let second = &recording.segments()[1];
        assert_eq!(second.start, Duration::from_millis(100));
        assert_eq!(second.duration, Duration::from_millis(200));
        assert_eq!(recording.duration(), Duration::from_millis(300));
    }

    #[test]
    fn test_empty_and_buffers_released() {
        let mut strategy = TimelineMerge::new(24000);
        assert_eq!(strategy.finish().unwrap_err(), RecorderError::NoAudioCaptured);

        strategy.push(&frame(AudioSource::Local, 1, 10, 0));
        strategy.finish().unwrap();
        assert!(strategy.frames.is_empty());
    }
}
