//! symphonia decode: probe a media source, pull interleaved f32 packets.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::{Error, Result};
use crate::models::DecodedAudio;

/// A probed source with a decoder ready for its first audio track.
pub(crate) struct OpenedTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    pub(crate) sample_rate: u32,
    pub(crate) channels: u16,
    pub(crate) n_frames: Option<u64>,
}

impl OpenedTrack {
    /// Probe `mss` and pick the first track with a real codec.
    pub(crate) fn open(mss: MediaSourceStream, extension: Option<&str>) -> std::result::Result<Self, String> {
        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| format!("unrecognized format: {}", e))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| "no audio track".to_string())?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
        let channels = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let n_frames = track.codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("unsupported codec: {}", e))?;

        Ok(Self { format, decoder, track_id, sample_rate, channels, n_frames })
    }

    pub(crate) fn duration_secs(&self) -> Option<f64> {
        self.n_frames.map(|n| n as f64 / self.sample_rate.max(1) as f64)
    }

    /// Next packet as interleaved f32. `None` at end of stream.
    /// Corrupt packets are skipped.
    pub(crate) fn next_samples(&mut self) -> std::result::Result<Option<Vec<f32>>, String> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(e.to_string()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    self.sample_rate = spec.rate;
                    self.channels = spec.channels.count() as u16;
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(buf.samples().to_vec()));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("yiyan: skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Seek to `seconds`. Returns the position actually reached.
    pub(crate) fn seek(&mut self, seconds: f64) -> std::result::Result<f64, String> {
        let seconds = seconds.max(0.0);
        let time = Time::new(seconds.trunc() as u64, seconds.fract());
        let seeked = self
            .format
            .seek(SeekMode::Accurate, SeekTo::Time { time, track_id: Some(self.track_id) })
            .map_err(|e| e.to_string())?;
        self.decoder.reset();
        Ok(seeked.actual_ts as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Decode a whole in-memory payload.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty buffer".into()));
    }
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut track = OpenedTrack::open(mss, extension).map_err(Error::Decode)?;

    let capacity = track.n_frames.unwrap_or(0) as usize * track.channels as usize;
    let mut samples = Vec::with_capacity(capacity);
    while let Some(chunk) = track.next_samples().map_err(Error::Decode)? {
        samples.extend_from_slice(&chunk);
    }

    if samples.is_empty() {
        return Err(Error::Decode("no audio frames".into()));
    }
    Ok(DecodedAudio::new(samples, track.sample_rate, track.channels))
}


#[cfg(test)]
mod tests {
    use super::fixtures::wav_tone;
    use super::*;

    #[test]
    fn decodes_wav_with_expected_shape() {
        let audio = decode_bytes(wav_tone(0.5, 8000, 2), Some("wav")).unwrap();
        assert_eq!(audio.sample_rate(), 8000);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 4000);
        assert!((audio.duration() - 0.5).abs() < 1e-6);
        assert!(audio.samples().iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn decodes_without_hint() {
        let audio = decode_bytes(wav_tone(0.25, 16000, 1), None).unwrap();
        assert_eq!(audio.channels(), 1);
        assert_eq!(audio.frames(), 4000);
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_bytes(b"TTS generated fail: quota".to_vec(), None).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(decode_bytes(Vec::new(), None), Err(Error::Decode(_))));
    }
}
