//! What the caller hands to `Coordinator::play`.

use std::fmt;
use std::sync::Arc;

/// A playable source. The variant decides which backend plays it.
#[derive(Clone)]
pub enum PlaybackSource {
    /// Streaming-playable resource: http(s) URL or local path.
    Url(String),
    /// Undecoded audio payload (e.g. synthesized WAV bytes).
    Raw(Vec<u8>),
    /// Already decoded, goes straight to the buffer backend.
    Decoded(DecodedAudio),
}

impl PlaybackSource {
    pub fn url(url: impl Into<String>) -> Self {
        PlaybackSource::Url(url.into())
    }
}

impl fmt::Debug for PlaybackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackSource::Url(u) => f.debug_tuple("Url").field(u).finish(),
            PlaybackSource::Raw(b) => write!(f, "Raw({} bytes)", b.len()),
            PlaybackSource::Decoded(a) => f.debug_tuple("Decoded").field(a).finish(),
        }
    }
}

/// Decoded PCM: interleaved f32 frames at a fixed rate and channel count.
///
/// Samples sit behind an `Arc` so graph nodes and the coordinator share
/// one copy; restarting from an offset never copies audio.
#[derive(Clone)]
pub struct DecodedAudio {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Index of the first interleaved sample at `offset` seconds, frame-aligned.
    pub fn sample_index_at(&self, offset: f64) -> usize {
        let frame = (offset.max(0.0) * self.sample_rate as f64) as usize;
        (frame * self.channels as usize).min(self.samples.len())
    }
}

impl fmt::Debug for DecodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedAudio")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_from_frames() {
        // 2 seconds of stereo at 8 kHz
        let audio = DecodedAudio::new(vec![0.0; 8000 * 2 * 2], 8000, 2);
        assert_eq!(audio.frames(), 16000);
        assert!((audio.duration() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn sample_index_is_frame_aligned_and_clamped() {
        let audio = DecodedAudio::new(vec![0.0; 100 * 2], 100, 2);
        assert_eq!(audio.sample_index_at(0.5), 100);
        assert_eq!(audio.sample_index_at(-1.0), 0);
        assert_eq!(audio.sample_index_at(10.0), 200);
    }

    #[test]
    fn debug_hides_payload() {
        let src = PlaybackSource::Raw(vec![0u8; 44]);
        assert_eq!(format!("{:?}", src), "Raw(44 bytes)");
    }
}
