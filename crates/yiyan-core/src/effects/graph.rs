//! Native decode/graph engine — one cpal output stream, many short-lived nodes.
//!
//! 1. `decode` runs symphonia on the payload and conforms it to the device
//!    rate/channels, so the render callback only copies and scales.
//! 2. Each `start` adds a voice (samples + cursor) to the mix list.
//! 3. The cpal callback mixes live voices through the shared gain and counts
//!    rendered frames; that count is the engine clock.
//!
//! Voices that run out are dropped by the callback and their ids handed to a
//! dispatcher thread, which calls the ended listener off the audio thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::{decode, pcm, AudioGraph, EndedListener, NodeId};
use crate::error::{Error, Result};
use crate::models::DecodedAudio;

pub struct NativeGraph {
    shared: Arc<GraphShared>,
}

struct GraphShared {
    sample_rate: u32,
    channels: u16,
    /// Frames handed to the device since the stream opened.
    frames_rendered: AtomicU64,
    /// f32 bits.
    gain: AtomicU32,
    voices: Mutex<Vec<Voice>>,
    next_id: AtomicU64,
    listener: Mutex<Option<EndedListener>>,
    shutdown: AtomicBool,
}

struct Voice {
    id: NodeId,
    audio: DecodedAudio,
    cursor: usize,
}

impl NativeGraph {
    /// Open the default output device. Blocks until the stream is running.
    pub fn open() -> Result<Self> {
        let config = output_config()?;
        let shared = Arc::new(GraphShared {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            frames_rendered: AtomicU64::new(0),
            gain: AtomicU32::new(1.0f32.to_bits()),
            voices: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let (ended_tx, ended_rx) = mpsc::channel::<NodeId>();
        let dispatch_state = Arc::clone(&shared);
        thread::spawn(move || {
            for id in ended_rx {
                let listener = dispatch_state.listener.lock().clone();
                if let Some(listener) = listener {
                    listener(id);
                }
            }
        });

        // cpal::Stream is not Send everywhere; it lives on its own thread.
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let output_state = Arc::clone(&shared);
        thread::spawn(move || {
            let stream = match build_stream(&output_state, &config, ended_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            while !output_state.shutdown.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!(
                    "yiyan: audio graph running at {}Hz x{}",
                    shared.sample_rate,
                    shared.channels
                );
                Ok(Self { shared })
            }
            Ok(Err(e)) => Err(Error::BackendInit(e)),
            Err(_) => Err(Error::BackendInit("output thread exited".into())),
        }
    }
}

impl Drop for NativeGraph {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

impl AudioGraph for NativeGraph {
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio> {
        let audio = decode::decode_bytes(bytes, None)?;
        Ok(pcm::conform(&audio, self.shared.sample_rate, self.shared.channels))
    }

    fn conform(&self, audio: DecodedAudio) -> DecodedAudio {
        pcm::conform(&audio, self.shared.sample_rate, self.shared.channels)
    }

    fn now(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::SeqCst) as f64 / self.shared.sample_rate as f64
    }

    fn start(&self, audio: &DecodedAudio, offset: f64) -> NodeId {
        // Shares the samples when `audio` came through `decode`/`conform`.
        let audio = pcm::conform(audio, self.shared.sample_rate, self.shared.channels);
        let id = NodeId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let cursor = audio.sample_index_at(offset);
        self.shared.voices.lock().push(Voice { id, audio, cursor });
        id
    }

    fn stop(&self, node: NodeId) {
        self.shared.voices.lock().retain(|v| v.id != node);
    }

    fn set_gain(&self, gain: f32) {
        self.shared.gain.store(gain.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    fn set_ended_listener(&self, listener: EndedListener) {
        *self.shared.listener.lock() = Some(listener);
    }
}

/// Default output config, insisting on f32 samples.
fn output_config() -> Result<cpal::StreamConfig> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::BackendInit("no output device".into()))?;
    let default_cfg = device
        .default_output_config()
        .map_err(|e| Error::BackendInit(e.to_string()))?;

    if default_cfg.sample_format() == cpal::SampleFormat::F32 {
        return Ok(default_cfg.into());
    }

    let rate = default_cfg.sample_rate();
    device
        .supported_output_configs()
        .map_err(|e| Error::BackendInit(e.to_string()))?
        .find(|range| {
            range.sample_format() == cpal::SampleFormat::F32
                && range.min_sample_rate() <= rate
                && range.max_sample_rate() >= rate
        })
        .map(|range| range.with_sample_rate(rate).into())
        .ok_or_else(|| {
            Error::BackendInit(format!(
                "device does not support f32 output (got {:?})",
                default_cfg.sample_format()
            ))
        })
}

fn build_stream(
    shared: &Arc<GraphShared>,
    config: &cpal::StreamConfig,
    ended_tx: mpsc::Sender<NodeId>,
) -> std::result::Result<cpal::Stream, String> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or("no output device")?;

    let cb_state = Arc::clone(shared);
    let channels = config.channels.max(1) as usize;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let gain = f32::from_bits(cb_state.gain.load(Ordering::SeqCst));
                let finished = mix_voices(&mut cb_state.voices.lock(), data, gain);
                for id in finished {
                    let _ = ended_tx.send(id);
                }
                cb_state
                    .frames_rendered
                    .fetch_add((data.len() / channels) as u64, Ordering::SeqCst);
            },
            move |err| {
                log::error!("yiyan: cpal graph error: {}", err);
            },
            None,
        )
        .map_err(|e| e.to_string())?;
    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}

/// Sum live voices into `out`, scaled by `gain`. Returns ids of voices that ran out.
fn mix_voices(voices: &mut Vec<Voice>, out: &mut [f32], gain: f32) -> Vec<NodeId> {
    out.fill(0.0);
    for voice in voices.iter_mut() {
        let samples = voice.audio.samples();
        let n = out.len().min(samples.len().saturating_sub(voice.cursor));
        for (o, s) in out.iter_mut().zip(&samples[voice.cursor..voice.cursor + n]) {
            *o += s * gain;
        }
        voice.cursor += n;
    }
    let mut finished = Vec::new();
    voices.retain(|v| {
        let done = v.cursor >= v.audio.samples().len();
        if done {
            finished.push(v.id);
        }
        !done
    });
    finished
}
