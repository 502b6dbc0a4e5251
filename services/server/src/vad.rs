//! Energy-based utterance segmentation.
//!
//! The segmenter consumes the transcoder's PCM stream chunk by chunk and
//! emits one [`Utterance`] per contiguous span of speech. Trailing silence is
//! kept in the clip so playback-adjacent consumers (and the transcriber) see
//! a natural ending; leading silence is dropped. Clips shorter than the
//! configured minimum are discarded without ever reaching transcription,
//! which filters breath noise and clicks.

use std::time::{Duration, Instant};

use crate::config::VadSettings;

/// One contiguous span of detected speech, bounded by silence.
#[derive(Debug)]
pub struct Utterance {
    /// Raw little-endian pcm16 mono payload, including trailing silence.
    pub pcm: Vec<u8>,
    /// Accumulated duration of the payload.
    pub duration: Duration,
    /// When speech was first detected.
    pub started_at: Instant,
}

pub struct UtteranceSegmenter {
    settings: VadSettings,
    sample_rate: u32,
    speaking: bool,
    started_at: Option<Instant>,
    buffered_silence: Duration,
    buffer: Vec<u8>,
}

impl UtteranceSegmenter {
    pub fn new(settings: VadSettings, sample_rate: u32) -> Self {
        Self {
            settings,
            sample_rate,
            speaking: false,
            started_at: None,
            buffered_silence: Duration::ZERO,
            buffer: Vec::new(),
        }
    }

    /// Feed one PCM chunk; returns a finalized utterance when silence has
    /// persisted past the configured duration.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Utterance> {
        if chunk.is_empty() {
            return None;
        }
        let energy = rms_energy(chunk);
        let chunk_duration = pcm_duration(chunk.len(), self.sample_rate);

        if energy > self.settings.energy_threshold {
            if !self.speaking {
                self.speaking = true;
                self.started_at = Some(Instant::now());
            }
            self.buffered_silence = Duration::ZERO;
            self.buffer.extend_from_slice(chunk);
            return None;
        }

        if !self.speaking {
            // Leading silence never enters the clip.
            return None;
        }

        // Keep appending through the silence window so the clip ends
        // naturally instead of being cut at the last voiced sample.
        self.buffer.extend_from_slice(chunk);
        self.buffered_silence += chunk_duration;
        if self.buffered_silence >= self.settings.silence {
            return self.finalize();
        }
        None
    }

    /// End-of-stream: finalize whatever speech is pending.
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.speaking { self.finalize() } else { None }
    }

    fn finalize(&mut self) -> Option<Utterance> {
        let pcm = std::mem::take(&mut self.buffer);
        let started_at = self.started_at.take().unwrap_or_else(Instant::now);
        self.speaking = false;
        self.buffered_silence = Duration::ZERO;

        let duration = pcm_duration(pcm.len(), self.sample_rate);
        if duration < self.settings.min_utterance {
            tracing::debug!(
                duration_ms = duration.as_millis() as u64,
                "discarding sub-minimum utterance"
            );
            return None;
        }
        Some(Utterance {
            pcm,
            duration,
            started_at,
        })
    }
}

/// Root-mean-square energy of little-endian pcm16 samples, normalized to
/// 0.0..=1.0.
fn rms_energy(pcm: &[u8]) -> f32 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for sample in pcm.chunks_exact(2) {
        let v = i16::from_le_bytes([sample[0], sample[1]]) as f64 / i16::MAX as f64;
        sum_squares += v * v;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_squares / count as f64).sqrt() as f32
}

fn pcm_duration(bytes: usize, sample_rate: u32) -> Duration {
    let samples = bytes / 2;
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}
