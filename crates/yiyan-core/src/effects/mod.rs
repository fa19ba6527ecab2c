//! Backend primitives the coordinator multiplexes over.
//!
//! Two seams, two traits:
//! - [`StreamElement`]: URL-addressable playback where the element owns
//!   decoding, buffering and position (think `<audio>`).
//! - [`AudioGraph`]: decode in-memory bytes once, then start/stop graph
//!   nodes at explicit offsets against an engine clock, through one gain.
//!
//! Native implementations (cpal + symphonia) live behind the `native`
//! feature. The no-op pair keeps the state machine usable headless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::Result;
use crate::models::DecodedAudio;

pub mod decode;
#[cfg(feature = "native")]
pub mod graph;
#[cfg(feature = "http")]
pub mod http;
pub mod pcm;
#[cfg(feature = "native")]
pub mod stream;

/// Lifecycle notifications from a streaming element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Play,
    Pause,
    Ended,
}

/// Receives `(source, event)` for the resource the event belongs to.
pub type StreamListener = Arc<dyn Fn(&str, StreamEvent) + Send + Sync>;

/// Streaming backend adapter.
///
/// Elements report changes they did not get asked for (natural end,
/// device loss, an external actor resuming) through the listener. Events
/// are delivered from the element's own threads, never from inside a call
/// made on the element, so a listener may lock whatever the caller holds.
pub trait StreamElement: Send + Sync {
    /// Assign a resource. Halts current playback, position back to zero.
    fn load(&self, url: &str);
    fn loaded(&self) -> Option<String>;
    /// Start or continue. Blocks until the element acknowledges start.
    fn play(&self) -> Result<()>;
    fn pause(&self);
    /// Position in seconds.
    fn position(&self) -> f64;
    fn set_position(&self, seconds: f64);
    /// Length in seconds, `None` until known.
    fn duration(&self) -> Option<f64>;
    fn set_volume(&self, volume: f32);
    fn set_listener(&self, listener: StreamListener);
}

/// Handle to one started graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Receives ids of nodes that played to their natural end.
pub type EndedListener = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Decode/graph engine. One per process, created lazily.
pub trait AudioGraph: Send + Sync {
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio>;
    /// Bring audio decoded elsewhere to the engine's output format.
    /// `decode` output already is.
    fn conform(&self, audio: DecodedAudio) -> DecodedAudio {
        audio
    }
    /// Engine clock in seconds. Monotonic.
    fn now(&self) -> f64;
    /// Create a node bound to `audio`, connect it to the gain, start at `offset` seconds.
    fn start(&self, audio: &DecodedAudio, offset: f64) -> NodeId;
    /// Stop and release. Never reported as ended.
    fn stop(&self, node: NodeId);
    fn set_gain(&self, gain: f32);
    fn set_ended_listener(&self, listener: EndedListener);
}

/// Streaming element that accepts everything and plays nothing.
///
/// Position stays at whatever was last assigned.
#[derive(Default)]
pub struct NoopStream {
    url: Mutex<Option<String>>,
    position: Mutex<f64>,
}

impl StreamElement for NoopStream {
    fn load(&self, url: &str) {
        *self.url.lock() = Some(url.to_string());
        *self.position.lock() = 0.0;
    }
    fn loaded(&self) -> Option<String> {
        self.url.lock().clone()
    }
    fn play(&self) -> Result<()> {
        Ok(())
    }
    fn pause(&self) {}
    fn position(&self) -> f64 {
        *self.position.lock()
    }
    fn set_position(&self, seconds: f64) {
        *self.position.lock() = seconds.max(0.0);
    }
    fn duration(&self) -> Option<f64> {
        None
    }
    fn set_volume(&self, _: f32) {}
    fn set_listener(&self, _: StreamListener) {}
}

/// Graph without an output device.
///
/// Decodes for real (so bad bytes still fail) and keeps a wall-clock
/// engine clock, but nodes are silent and never end.
pub struct NoopGraph {
    epoch: Instant,
    next_id: AtomicU64,
}

impl NoopGraph {
    pub fn new() -> Self {
        Self { epoch: Instant::now(), next_id: AtomicU64::new(1) }
    }
}

impl Default for NoopGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioGraph for NoopGraph {
    fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio> {
        decode::decode_bytes(bytes, None)
    }
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
    fn start(&self, _: &DecodedAudio, _: f64) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
    fn stop(&self, _: NodeId) {}
    fn set_gain(&self, _: f32) {}
    fn set_ended_listener(&self, _: EndedListener) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_stream_tracks_resource_and_position() {
        let s = NoopStream::default();
        assert_eq!(s.loaded(), None);
        s.load("https://example.com/a.mp3");
        s.set_position(3.5);
        assert_eq!(s.position(), 3.5);
        s.load("https://example.com/b.mp3");
        assert_eq!(s.loaded().as_deref(), Some("https://example.com/b.mp3"));
        assert_eq!(s.position(), 0.0);
        assert!(s.play().is_ok());
    }

    #[test]
    fn noop_graph_ids_are_unique_and_clock_moves_forward() {
        let g = NoopGraph::new();
        let audio = DecodedAudio::new(vec![0.0; 16], 8000, 1);
        let a = g.start(&audio, 0.0);
        let b = g.start(&audio, 0.0);
        assert_ne!(a, b);
        let t0 = g.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(g.now() > t0);
    }

    #[test]
    fn noop_graph_rejects_garbage() {
        let g = NoopGraph::new();
        assert!(g.decode(b"definitely not audio".to_vec()).is_err());
    }
}
