//! PCM plumbing shared by the native backends: sample ring, resampler,
//! channel adaptation.

use crate::models::DecodedAudio;

/// Fixed-capacity ring of interleaved f32 samples. Overflow is dropped.
pub(crate) struct SampleRing {
    buf: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl SampleRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    pub(crate) fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            if self.len < self.buf.len() {
                self.buf[self.write_pos] = s;
                self.write_pos = (self.write_pos + 1) % self.buf.len();
                self.len += 1;
            }
        }
    }

    /// Fill `out`, zero-padding on underflow. Returns samples actually read.
    pub(crate) fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        for sample in out.iter_mut().take(n) {
            *sample = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.buf.len();
            self.len -= 1;
        }
        for sample in out.iter_mut().skip(n) {
            *sample = 0.0;
        }
        n
    }

    pub(crate) fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }
}

/// Linear interpolation resampler over interleaved frames.
pub(crate) struct LinearResampler {
    ratio: f64,
    phase: f64,
    channels: usize,
}

impl LinearResampler {
    pub(crate) fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Self {
        Self {
            ratio: dst_rate as f64 / src_rate.max(1) as f64,
            phase: 0.0,
            channels: channels.max(1) as usize,
        }
    }

    pub(crate) fn is_needed(&self) -> bool {
        (self.ratio - 1.0).abs() > 0.001
    }

    pub(crate) fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if !self.is_needed() {
            return input.to_vec();
        }
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return Vec::new();
        }
        let out_frames = ((in_frames as f64) * self.ratio).ceil() as usize;
        let mut output = Vec::with_capacity(out_frames * ch);

        for _ in 0..out_frames {
            let src_idx = self.phase as usize;
            if src_idx >= in_frames {
                break;
            }
            let frac = (self.phase - src_idx as f64) as f32;

            for c in 0..ch {
                let s0 = input[src_idx * ch + c];
                let s1 = if src_idx + 1 < in_frames {
                    input[(src_idx + 1) * ch + c]
                } else {
                    s0
                };
                output.push(s0 + (s1 - s0) * frac);
            }

            self.phase += 1.0 / self.ratio;
        }

        self.phase -= in_frames as f64;
        if self.phase < 0.0 {
            self.phase = 0.0;
        }

        output
    }
}

/// Copy interleaved frames between channel layouts.
/// Mono fans out, multi-channel to mono averages, otherwise copy and zero-fill.
pub(crate) fn adapt_channels(src: &[f32], src_ch: u16, dst: &mut [f32], dst_ch: u16) {
    let src_ch = src_ch.max(1) as usize;
    let dst_ch = dst_ch.max(1) as usize;
    let frames = dst.len() / dst_ch;

    for f in 0..frames {
        let src_off = f * src_ch;
        let dst_off = f * dst_ch;

        if src_ch == 1 && dst_ch >= 2 {
            let s = src.get(src_off).copied().unwrap_or(0.0);
            for c in 0..dst_ch {
                dst[dst_off + c] = s;
            }
        } else if src_ch >= 2 && dst_ch == 1 {
            let n = src_ch.min(src.len().saturating_sub(src_off));
            let sum: f32 = (0..n).map(|c| src[src_off + c]).sum();
            dst[dst_off] = if n > 0 { sum / n as f32 } else { 0.0 };
        } else {
            let copy_ch = src_ch.min(dst_ch);
            for c in 0..copy_ch {
                dst[dst_off + c] = src.get(src_off + c).copied().unwrap_or(0.0);
            }
            for c in copy_ch..dst_ch {
                dst[dst_off + c] = 0.0;
            }
        }
    }
}

/// Convert decoded audio to the device's rate and channel count.
pub(crate) fn conform(audio: &DecodedAudio, rate: u32, channels: u16) -> DecodedAudio {
    if audio.sample_rate() == rate && audio.channels() == channels {
        return audio.clone();
    }
    let mut resampler = LinearResampler::new(audio.sample_rate(), rate, audio.channels());
    let resampled = resampler.process(audio.samples());
    if audio.channels() == channels {
        return DecodedAudio::new(resampled, rate, channels);
    }
    let frames = resampled.len() / audio.channels() as usize;
    let mut out = vec![0.0f32; frames * channels as usize];
    adapt_channels(&resampled, audio.channels(), &mut out, channels);
    DecodedAudio::new(out, rate, channels)
}
