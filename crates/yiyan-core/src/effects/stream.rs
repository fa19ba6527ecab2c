//! Native streaming element: a symphonia decode thread feeding a cpal output thread.
//!
//! Local paths are opened as files. http(s) URLs are fetched in full and
//! played from memory, which keeps seek and duration working for formats
//! whose readers need a seekable source.
//!
//! Position is what the device has actually played: a base (start or seek
//! target) plus frames pulled by the output callback since then.
//!
//! Only changes nobody asked for are reported to the listener: `Ended` when
//! the source drains, `Pause` when the device fails underneath us.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use symphonia::core::io::MediaSourceStream;

use super::decode::OpenedTrack;
use super::pcm::{adapt_channels, LinearResampler, SampleRing};
use super::{StreamElement, StreamEvent, StreamListener};
use crate::error::{Error, Result};

/// No seek pending.
const NO_SEEK: u64 = u64::MAX;

pub struct NativeStream {
    state: Arc<StreamState>,
    listener: Arc<Mutex<Option<StreamListener>>>,
}

struct StreamState {
    url: Mutex<Option<String>>,
    /// Decoder + output threads exist for the loaded resource.
    running: AtomicBool,
    paused: AtomicBool,
    /// f32 bits.
    volume: AtomicU32,
    base_ms: AtomicU64,
    played_frames: AtomicU64,
    output_rate: AtomicU32,
    /// 0 = unknown.
    duration_ms: AtomicU64,
    /// Where the next fresh start begins, and what `position()` reports while stopped.
    pending_ms: AtomicU64,
    samples: Mutex<SampleRing>,
    stop_signal: AtomicBool,
    seek_to_ms: AtomicU64,
    decode_done: AtomicBool,
    output_done: AtomicBool,
    /// Played to the end; next `play()` starts over.
    finished: AtomicBool,
    device_error: AtomicBool,
    events: Mutex<mpsc::Sender<(String, StreamEvent)>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamState {
    fn played_ms(&self) -> u64 {
        let rate = self.output_rate.load(Ordering::SeqCst).max(1) as u64;
        let played = self.played_frames.load(Ordering::SeqCst) * 1000 / rate;
        self.base_ms.load(Ordering::SeqCst) + played
    }

    fn emit(&self, source: &str, event: StreamEvent) {
        let _ = self.events.lock().send((source.to_string(), event));
    }
}

impl NativeStream {
    pub fn new() -> Self {
        let listener: Arc<Mutex<Option<StreamListener>>> = Arc::new(Mutex::new(None));
        let (events, rx) = mpsc::channel::<(String, StreamEvent)>();

        // Listener calls happen here, never on the audio or decode threads.
        let dispatch_listener = Arc::clone(&listener);
        thread::spawn(move || {
            for (source, event) in rx {
                let listener = dispatch_listener.lock().clone();
                if let Some(listener) = listener {
                    listener(&source, event);
                }
            }
        });

        Self {
            state: Arc::new(StreamState {
                url: Mutex::new(None),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                volume: AtomicU32::new(1.0f32.to_bits()),
                base_ms: AtomicU64::new(0),
                played_frames: AtomicU64::new(0),
                output_rate: AtomicU32::new(44100),
                duration_ms: AtomicU64::new(0),
                pending_ms: AtomicU64::new(0),
                samples: Mutex::new(SampleRing::new(48000 * 2 * 4)), // ~4s stereo
                stop_signal: AtomicBool::new(false),
                seek_to_ms: AtomicU64::new(NO_SEEK),
                decode_done: AtomicBool::new(false),
                output_done: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                device_error: AtomicBool::new(false),
                events: Mutex::new(events),
                threads: Mutex::new(Vec::new()),
            }),
            listener,
        }
    }

    /// Stop threads and wait for them. No events are fired.
    fn halt(&self) {
        let state = &self.state;
        if state.running.load(Ordering::SeqCst) {
            state.pending_ms.store(state.played_ms(), Ordering::SeqCst);
        }
        state.stop_signal.store(true, Ordering::SeqCst);
        state.paused.store(false, Ordering::SeqCst);
        state.samples.lock().clear();

        let handles: Vec<_> = state.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        state.running.store(false, Ordering::SeqCst);
    }

    fn start_fresh(&self, url: &str) -> Result<()> {
        self.halt();

        let start_ms = if self.state.finished.swap(false, Ordering::SeqCst) {
            0
        } else {
            self.state.pending_ms.load(Ordering::SeqCst)
        };

        let mut track = open_source(url).map_err(Error::StreamingStart)?;
        if let Some(secs) = track.duration_secs() {
            self.state.duration_ms.store((secs * 1000.0) as u64, Ordering::SeqCst);
        }
        let mut base_ms = 0;
        if start_ms > 0 {
            match track.seek(start_ms as f64 / 1000.0) {
                Ok(actual) => base_ms = (actual * 1000.0) as u64,
                Err(e) => log::warn!("yiyan: start offset ignored for {}: {}", url, e),
            }
        }

        let config = output_config(track.sample_rate, track.channels).map_err(Error::StreamingStart)?;

        let state = &self.state;
        state.stop_signal.store(false, Ordering::SeqCst);
        state.paused.store(false, Ordering::SeqCst);
        state.decode_done.store(false, Ordering::SeqCst);
        state.output_done.store(false, Ordering::SeqCst);
        state.device_error.store(false, Ordering::SeqCst);
        state.seek_to_ms.store(NO_SEEK, Ordering::SeqCst);
        state.base_ms.store(base_ms, Ordering::SeqCst);
        state.played_frames.store(0, Ordering::SeqCst);
        state.output_rate.store(config.sample_rate.0, Ordering::SeqCst);
        state.samples.lock().clear();
        state.running.store(true, Ordering::SeqCst);

        let mut threads = state.threads.lock();

        let decoder_state = Arc::clone(state);
        let decoder_config = config.clone();
        threads.push(thread::spawn(move || {
            if let Err(e) = decode_to_ring(&mut track, &decoder_config, &decoder_state) {
                log::error!("yiyan: stream decode error: {}", e);
            }
            decoder_state.decode_done.store(true, Ordering::SeqCst);
        }));

        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let output_state = Arc::clone(state);
        let source = url.to_string();
        threads.push(thread::spawn(move || {
            output_from_ring(&output_state, &config, &source, ready_tx);
        }));
        drop(threads);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::debug!("yiyan: streaming {} from {}ms", url, base_ms);
                Ok(())
            }
            Ok(Err(e)) => {
                self.halt();
                Err(Error::StreamingStart(e))
            }
            Err(_) => {
                self.halt();
                Err(Error::StreamingStart("output thread exited".into()))
            }
        }
    }
}

impl Default for NativeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NativeStream {
    fn drop(&mut self) {
        self.halt();
    }
}

impl StreamElement for NativeStream {
    fn load(&self, url: &str) {
        self.halt();
        *self.state.url.lock() = Some(url.to_string());
        self.state.pending_ms.store(0, Ordering::SeqCst);
        self.state.duration_ms.store(0, Ordering::SeqCst);
        self.state.finished.store(false, Ordering::SeqCst);
    }

    fn loaded(&self) -> Option<String> {
        self.state.url.lock().clone()
    }

    fn play(&self) -> Result<()> {
        let url = self
            .loaded()
            .ok_or_else(|| Error::StreamingStart("no source loaded".into()))?;
        if self.state.running.load(Ordering::SeqCst) {
            self.state.paused.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.start_fresh(&url)
    }

    fn pause(&self) {
        if self.state.running.load(Ordering::SeqCst) {
            self.state.paused.store(true, Ordering::SeqCst);
        }
    }

    fn position(&self) -> f64 {
        let state = &self.state;
        if state.running.load(Ordering::SeqCst) {
            state.played_ms() as f64 / 1000.0
        } else {
            state.pending_ms.load(Ordering::SeqCst) as f64 / 1000.0
        }
    }

    fn set_position(&self, seconds: f64) {
        let ms = (seconds.max(0.0) * 1000.0) as u64;
        let state = &self.state;
        if state.running.load(Ordering::SeqCst) {
            state.seek_to_ms.store(ms, Ordering::SeqCst);
            state.base_ms.store(ms, Ordering::SeqCst);
            state.played_frames.store(0, Ordering::SeqCst);
        } else {
            state.pending_ms.store(ms, Ordering::SeqCst);
            state.finished.store(false, Ordering::SeqCst);
        }
    }

    fn duration(&self) -> Option<f64> {
        match self.state.duration_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms as f64 / 1000.0),
        }
    }

    fn set_volume(&self, volume: f32) {
        self.state.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    fn set_listener(&self, listener: StreamListener) {
        *self.listener.lock() = Some(listener);
    }
}

/// Open a path or http(s) URL and probe it.
fn open_source(url: &str) -> std::result::Result<OpenedTrack, String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return open_remote(url);
    }
    let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
    let file = File::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    OpenedTrack::open(mss, path.extension().and_then(|e| e.to_str()))
}

#[cfg(feature = "http")]
fn open_remote(url: &str) -> std::result::Result<OpenedTrack, String> {
    let bytes = super::http::fetch_bytes(url)?;
    let mss = MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes)), Default::default());
    OpenedTrack::open(mss, super::http::extension_from_url(url).as_deref())
}

#[cfg(not(feature = "http"))]
fn open_remote(url: &str) -> std::result::Result<OpenedTrack, String> {
    Err(format!("{}: built without http support", url))
}

/// Prefer an f32 config at the track's own rate and layout; fall back to the
/// device default and let the decoder resample.
fn output_config(rate: u32, channels: u16) -> std::result::Result<cpal::StreamConfig, String> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or("no output device")?;

    let wanted = cpal::SampleRate(rate);
    if let Ok(mut ranges) = device.supported_output_configs() {
        let exact = ranges.find(|range| {
            range.sample_format() == cpal::SampleFormat::F32
                && range.channels() == channels
                && range.min_sample_rate() <= wanted
                && range.max_sample_rate() >= wanted
        });
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(wanted).into());
        }
    }

    let default_cfg = device.default_output_config().map_err(|e| e.to_string())?;
    if default_cfg.sample_format() != cpal::SampleFormat::F32 {
        return Err(format!(
            "device does not support f32 output (got {:?})",
            default_cfg.sample_format()
        ));
    }
    Ok(default_cfg.into())
}

/// Decode into the ring with back-pressure. After the source runs dry the
/// thread idles so a late seek can still pull it back.
fn decode_to_ring(
    track: &mut OpenedTrack,
    config: &cpal::StreamConfig,
    state: &StreamState,
) -> std::result::Result<(), String> {
    let out_rate = config.sample_rate.0;
    let out_ch = config.channels;
    let mut src_rate = track.sample_rate;
    let mut src_ch = track.channels;
    let mut resampler = LinearResampler::new(src_rate, out_rate, src_ch);

    'decode: loop {
        if state.stop_signal.load(Ordering::SeqCst) {
            return Ok(());
        }

        let seek = state.seek_to_ms.swap(NO_SEEK, Ordering::SeqCst);
        if seek != NO_SEEK {
            match track.seek(seek as f64 / 1000.0) {
                Ok(actual) => {
                    state.samples.lock().clear();
                    state.base_ms.store((actual * 1000.0) as u64, Ordering::SeqCst);
                    state.played_frames.store(0, Ordering::SeqCst);
                }
                Err(e) => log::warn!("yiyan: seek to {}ms failed: {}", seek, e),
            }
            resampler = LinearResampler::new(track.sample_rate, out_rate, track.channels);
        }

        let chunk = match track.next_samples()? {
            Some(chunk) => chunk,
            None => {
                state.decode_done.store(true, Ordering::SeqCst);
                loop {
                    if state.stop_signal.load(Ordering::SeqCst) || state.output_done.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if state.seek_to_ms.load(Ordering::SeqCst) != NO_SEEK {
                        state.decode_done.store(false, Ordering::SeqCst);
                        continue 'decode;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        };

        if track.sample_rate != src_rate || track.channels != src_ch {
            src_rate = track.sample_rate;
            src_ch = track.channels;
            resampler = LinearResampler::new(src_rate, out_rate, src_ch);
        }

        let resampled = resampler.process(&chunk);
        let out = if src_ch == out_ch {
            resampled
        } else {
            let frames = resampled.len() / src_ch.max(1) as usize;
            let mut buf = vec![0.0f32; frames * out_ch as usize];
            adapt_channels(&resampled, src_ch, &mut buf, out_ch);
            buf
        };

        let mut offset = 0;
        while offset < out.len() {
            if state.stop_signal.load(Ordering::SeqCst) {
                return Ok(());
            }
            if state.seek_to_ms.load(Ordering::SeqCst) != NO_SEEK {
                continue 'decode;
            }
            let mut ring = state.samples.lock();
            let n = ring.free().min(out.len() - offset);
            if n > 0 {
                ring.push(&out[offset..offset + n]);
                offset += n;
            } else {
                drop(ring);
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Own the cpal stream until stopped, drained, or the device fails.
fn output_from_ring(
    state: &Arc<StreamState>,
    config: &cpal::StreamConfig,
    source: &str,
    ready_tx: mpsc::Sender<std::result::Result<(), String>>,
) {
    let stream = match build_stream(state, config) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            state.output_done.store(true, Ordering::SeqCst);
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        if state.stop_signal.load(Ordering::SeqCst) {
            break;
        }
        if state.device_error.load(Ordering::SeqCst) {
            state.pending_ms.store(state.played_ms(), Ordering::SeqCst);
            state.running.store(false, Ordering::SeqCst);
            state.emit(source, StreamEvent::Pause);
            break;
        }
        let drained = state.decode_done.load(Ordering::SeqCst)
            && state.seek_to_ms.load(Ordering::SeqCst) == NO_SEEK
            && state.samples.lock().len() == 0;
        if drained && !state.paused.load(Ordering::SeqCst) {
            state.pending_ms.store(state.played_ms(), Ordering::SeqCst);
            state.finished.store(true, Ordering::SeqCst);
            state.running.store(false, Ordering::SeqCst);
            log::debug!("yiyan: stream ended: {}", source);
            state.emit(source, StreamEvent::Ended);
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }

    state.output_done.store(true, Ordering::SeqCst);
    drop(stream);
}

fn build_stream(
    state: &Arc<StreamState>,
    config: &cpal::StreamConfig,
) -> std::result::Result<cpal::Stream, String> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or("no output device")?;

    let cb_state = Arc::clone(state);
    let err_state = Arc::clone(state);
    let channels = config.channels.max(1) as usize;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if cb_state.paused.load(Ordering::SeqCst) {
                    data.fill(0.0);
                    return;
                }
                let n = cb_state.samples.lock().pull(data);
                let volume = f32::from_bits(cb_state.volume.load(Ordering::SeqCst));
                for sample in data.iter_mut() {
                    *sample *= volume;
                }
                cb_state
                    .played_frames
                    .fetch_add((n / channels) as u64, Ordering::SeqCst);
            },
            move |err| {
                log::error!("yiyan: cpal stream error: {}", err);
                err_state.device_error.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| e.to_string())?;
    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}
