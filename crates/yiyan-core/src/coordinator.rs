//! Playback coordinator: one "now playing" slot over two backends.
//!
//! URL sources go to the streaming element; raw or decoded audio goes to the
//! graph engine, which is created on first use. Starting one backend tears
//! down the other, so at most one is ever audible.
//!
//! Locking:
//! - `inner` guards the slot and the timing fields. It is never held across
//!   element `play()`, graph creation or decode.
//! - `stream_start` serializes element load/play so two URL plays (or a play
//!   and a resume) cannot interleave on the element.
//! - The state callback runs after every lock is released.
//!
//! Every `play()`/`stop()` takes a generation ticket on entry. A `play()`
//! that comes back from a suspension point with an outdated ticket was
//! superseded; it returns `Ok(())` and starts nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

#[cfg(feature = "native")]
use crate::effects::graph::NativeGraph;
#[cfg(feature = "native")]
use crate::effects::stream::NativeStream;
use crate::effects::{AudioGraph, NodeId, NoopGraph, NoopStream, StreamElement, StreamEvent};
use crate::error::{Error, Result};
use crate::models::{DecodedAudio, PlaybackSource, PlaybackState};

/// Observer for playback state changes.
pub type StateCallback = Arc<dyn Fn(&PlaybackState) + Send + Sync>;

type GraphFactory = Box<dyn Fn() -> Result<Arc<dyn AudioGraph>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    shared: Arc<Shared>,
}

struct Shared {
    element: Arc<dyn StreamElement>,
    graph_factory: GraphFactory,
    inner: Mutex<Inner>,
    stream_start: Mutex<()>,
    graph_init: Mutex<()>,
    callback: Mutex<Option<(u64, StateCallback)>>,
    next_subscription: AtomicU64,
}

enum Slot {
    Idle,
    /// A paused or ended stream stays here with `playing: false`.
    Stream { playing: bool },
    /// `node` is `None` while paused or after the node ended.
    Buffer { audio: DecodedAudio, node: Option<NodeId> },
}

struct Inner {
    slot: Slot,
    graph: Option<Arc<dyn AudioGraph>>,
    current_source: Option<String>,
    /// Engine time at which offset 0 of the current buffer would have played.
    start_time: f64,
    pause_time: f64,
    volume: f32,
    generation: u64,
    last_emitted: PlaybackState,
}

impl Inner {
    fn snapshot(&self) -> PlaybackState {
        let is_playing = match &self.slot {
            Slot::Idle => false,
            Slot::Stream { playing } => *playing,
            Slot::Buffer { node, .. } => node.is_some(),
        };
        let current_source = match self.slot {
            Slot::Stream { .. } => self.current_source.clone(),
            _ => None,
        };
        PlaybackState { is_playing, current_source }
    }

    /// The snapshot if it differs from the last one handed to the observer.
    fn settle(&mut self) -> Option<PlaybackState> {
        let snapshot = self.snapshot();
        if snapshot == self.last_emitted {
            return None;
        }
        self.last_emitted = snapshot.clone();
        Some(snapshot)
    }

    fn stop_node(&mut self) {
        if let Slot::Buffer { node, .. } = &mut self.slot {
            if let (Some(id), Some(graph)) = (node.take(), self.graph.as_ref()) {
                graph.stop(id);
            }
        }
    }
}

impl Coordinator {
    /// Coordinator over `element`, creating the graph engine with
    /// `graph_factory` the first time buffer playback is requested.
    pub fn new<F>(element: Arc<dyn StreamElement>, graph_factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn AudioGraph>> + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            element,
            graph_factory: Box::new(graph_factory),
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                graph: None,
                current_source: None,
                start_time: 0.0,
                pause_time: 0.0,
                volume: 1.0,
                generation: 0,
                last_emitted: PlaybackState::idle(),
            }),
            stream_start: Mutex::new(()),
            graph_init: Mutex::new(()),
            callback: Mutex::new(None),
            next_subscription: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&shared);
        shared.element.set_listener(Arc::new(move |source: &str, event: StreamEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_stream_event(source, event);
            }
        }));

        Self { shared }
    }

    /// cpal/symphonia backends on the default output device.
    #[cfg(feature = "native")]
    pub fn native() -> Self {
        Self::new(Arc::new(NativeStream::new()), || {
            Ok(Arc::new(NativeGraph::open()?) as Arc<dyn AudioGraph>)
        })
    }

    /// Silent backends. The state machine behaves exactly as with real ones.
    pub fn headless() -> Self {
        Self::new(Arc::new(NoopStream::default()), || {
            Ok(Arc::new(NoopGraph::new()) as Arc<dyn AudioGraph>)
        })
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    pub fn play(&self, source: PlaybackSource) -> Result<()> {
        log::debug!("yiyan: play {:?}", source);
        match source {
            PlaybackSource::Url(url) => self.play_url(url),
            PlaybackSource::Raw(bytes) => {
                let ticket = self.shared.begin();
                let graph = self.shared.graph()?;
                let audio = graph.decode(bytes)?;
                self.start_buffer(ticket, &graph, audio)
            }
            PlaybackSource::Decoded(audio) => {
                let ticket = self.shared.begin();
                let graph = self.shared.graph()?;
                // Once here, so seeks and resumes restart from the stored copy.
                let audio = graph.conform(audio);
                self.start_buffer(ticket, &graph, audio)
            }
        }
    }

    fn play_url(&self, url: String) -> Result<()> {
        let shared = &self.shared;
        let ticket = shared.begin();
        let start = shared.stream_start.lock();
        if !shared.is_current(ticket) {
            return Ok(());
        }

        {
            let mut guard = shared.inner.lock();
            let inner = &mut *guard;
            // A buffer play may have landed since the check above.
            if inner.generation != ticket {
                return Ok(());
            }
            if shared.element.loaded().as_deref() != Some(url.as_str()) {
                shared.element.pause();
                shared.element.load(&url);
                if let Slot::Stream { playing } = &mut inner.slot {
                    *playing = false;
                    inner.current_source = None;
                }
            }
        }

        let started = shared.element.play();

        let mut inner = shared.inner.lock();
        if inner.generation != ticket {
            let stream_live = matches!(inner.slot, Slot::Stream { playing: true });
            if !stream_live && shared.element.loaded().as_deref() == Some(url.as_str()) {
                shared.element.pause();
            }
            log::debug!("yiyan: stream start for {} superseded", url);
            return Ok(());
        }

        let outcome = match started {
            Ok(()) => {
                // The buffer node is stopped only once the stream has started,
                // so a refused stream start leaves it playing. Both backends
                // can be audible for the duration of `element.play()`.
                inner.stop_node();
                inner.slot = Slot::Stream { playing: true };
                inner.current_source = Some(url);
                inner.pause_time = 0.0;
                Ok(())
            }
            Err(e) => {
                log::warn!("yiyan: stream {} failed to start: {}", url, e);
                Err(e)
            }
        };
        let change = inner.settle();
        drop(inner);
        drop(start);
        shared.notify(change);
        outcome
    }

    fn start_buffer(&self, ticket: u64, graph: &Arc<dyn AudioGraph>, audio: DecodedAudio) -> Result<()> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.generation != ticket {
            log::debug!("yiyan: buffer start superseded");
            return Ok(());
        }

        inner.stop_node();
        if matches!(inner.slot, Slot::Stream { .. }) {
            shared.element.pause();
        }

        let node = graph.start(&audio, 0.0);
        inner.start_time = graph.now();
        inner.pause_time = 0.0;
        inner.current_source = None;
        log::debug!("yiyan: buffer node {:?} started ({:.2}s)", node, audio.duration());
        inner.slot = Slot::Buffer { audio, node: Some(node) };
        let change = inner.settle();
        drop(inner);
        shared.notify(change);
        Ok(())
    }

    pub fn pause(&self) {
        let shared = &self.shared;
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        match &mut inner.slot {
            Slot::Buffer { audio, node } => {
                if let Some(id) = node.take() {
                    if let Some(graph) = inner.graph.as_ref() {
                        inner.pause_time = (graph.now() - inner.start_time).clamp(0.0, audio.duration());
                        graph.stop(id);
                    }
                }
            }
            Slot::Stream { playing } => {
                shared.element.pause();
                *playing = false;
            }
            Slot::Idle => {}
        }
        let change = inner.settle();
        drop(guard);
        shared.notify(change);
    }

    /// Continue whatever `pause()` (or a natural end) left behind.
    pub fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        let stream_ticket = {
            let mut guard = shared.inner.lock();
            let inner = &mut *guard;
            let ticket = match &mut inner.slot {
                Slot::Buffer { audio, node } => {
                    if let (None, Some(graph)) = (*node, inner.graph.as_ref()) {
                        *node = Some(graph.start(audio, inner.pause_time));
                        inner.start_time = graph.now() - inner.pause_time;
                    }
                    None
                }
                Slot::Stream { playing: false } if inner.current_source.is_some() => Some(inner.generation),
                _ => None,
            };
            let change = inner.settle();
            drop(guard);
            shared.notify(change);
            ticket
        };
        let Some(ticket) = stream_ticket else {
            return Ok(());
        };

        let start = shared.stream_start.lock();
        if !shared.is_current(ticket) {
            return Ok(());
        }
        let started = shared.element.play();

        let mut inner = shared.inner.lock();
        let still_ours = inner.generation == ticket && matches!(inner.slot, Slot::Stream { .. });
        if !still_ours {
            if !matches!(inner.slot, Slot::Stream { playing: true }) {
                shared.element.pause();
            }
            return Ok(());
        }
        started?;
        inner.slot = Slot::Stream { playing: true };
        let change = inner.settle();
        drop(inner);
        drop(start);
        shared.notify(change);
        Ok(())
    }

    pub fn stop(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.generation += 1;
        inner.stop_node();
        shared.element.pause();
        shared.element.set_position(0.0);
        inner.slot = Slot::Idle;
        inner.current_source = None;
        inner.pause_time = 0.0;
        inner.start_time = 0.0;
        let change = inner.settle();
        drop(inner);
        shared.notify(change);
    }

    /// Jump to `seconds`, clamped into the current source. NaN counts as 0.
    pub fn seek(&self, seconds: f64) {
        let seconds = if seconds.is_nan() { 0.0 } else { seconds };
        let shared = &self.shared;
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        match &mut inner.slot {
            Slot::Buffer { audio, node } => {
                let target = seconds.clamp(0.0, audio.duration());
                inner.pause_time = target;
                if let (Some(id), Some(graph)) = (*node, inner.graph.as_ref()) {
                    graph.stop(id);
                    *node = Some(graph.start(audio, target));
                    inner.start_time = graph.now() - target;
                }
            }
            Slot::Stream { .. } => {
                let mut target = seconds.max(0.0);
                if let Some(duration) = shared.element.duration() {
                    target = target.min(duration);
                }
                shared.element.set_position(target);
            }
            Slot::Idle => {}
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn current_time(&self) -> f64 {
        let inner = self.shared.inner.lock();
        match &inner.slot {
            Slot::Buffer { audio, node: Some(_) } => match inner.graph.as_ref() {
                Some(graph) => (graph.now() - inner.start_time).clamp(0.0, audio.duration()),
                None => inner.pause_time,
            },
            Slot::Buffer { node: None, .. } => inner.pause_time,
            Slot::Stream { .. } => self.shared.element.position(),
            Slot::Idle => 0.0,
        }
    }

    pub fn duration(&self) -> f64 {
        let inner = self.shared.inner.lock();
        match &inner.slot {
            Slot::Buffer { audio, .. } => audio.duration(),
            Slot::Stream { .. } => self.shared.element.duration().unwrap_or(0.0),
            Slot::Idle => 0.0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().snapshot()
    }

    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    /// Clamp to `[0, 1]`. Goes to the graph gain once the engine exists,
    /// to the element before that.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        let mut inner = self.shared.inner.lock();
        inner.volume = volume;
        match inner.graph.as_ref() {
            Some(graph) => graph.set_gain(volume),
            None => self.shared.element.set_volume(volume),
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Register the single observer, replacing any previous one.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PlaybackState) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::SeqCst);
        let callback: StateCallback = Arc::new(callback);
        *self.shared.callback.lock() = Some((id, callback));
        Subscription { id, shared: Arc::downgrade(&self.shared) }
    }
}

impl Shared {
    /// Take a ticket; everything older is superseded.
    fn begin(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.generation
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.inner.lock().generation == ticket
    }

    fn graph(self: &Arc<Self>) -> Result<Arc<dyn AudioGraph>> {
        if let Some(graph) = self.inner.lock().graph.clone() {
            return Ok(graph);
        }
        let _init = self.graph_init.lock();
        if let Some(graph) = self.inner.lock().graph.clone() {
            return Ok(graph);
        }

        let graph = (self.graph_factory)().map_err(|e| match e {
            Error::BackendInit(_) => e,
            other => Error::BackendInit(other.to_string()),
        })?;

        let weak: Weak<Shared> = Arc::downgrade(self);
        graph.set_ended_listener(Arc::new(move |node: NodeId| {
            if let Some(shared) = weak.upgrade() {
                shared.on_node_ended(node);
            }
        }));

        let mut inner = self.inner.lock();
        graph.set_gain(inner.volume);
        inner.graph = Some(Arc::clone(&graph));
        log::info!("yiyan: audio graph ready");
        Ok(graph)
    }

    fn notify(&self, change: Option<PlaybackState>) {
        let Some(state) = change else { return };
        let callback = self.callback.lock().as_ref().map(|(_, cb)| Arc::clone(cb));
        if let Some(callback) = callback {
            callback(&state);
        }
    }

    fn on_stream_event(&self, source: &str, event: StreamEvent) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Slot::Stream { playing } = &mut inner.slot else {
            return;
        };
        if inner.current_source.as_deref() != Some(source) {
            log::debug!("yiyan: ignoring {:?} for stale stream {}", event, source);
            return;
        }
        *playing = matches!(event, StreamEvent::Play);
        let change = inner.settle();
        drop(guard);
        self.notify(change);
    }

    fn on_node_ended(&self, ended: NodeId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Slot::Buffer { node, .. } = &mut inner.slot else {
            return;
        };
        if *node != Some(ended) {
            return;
        }
        *node = None;
        inner.pause_time = 0.0;
        let change = inner.settle();
        drop(guard);
        self.notify(change);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle returned by [`Coordinator::on_state_change`].
///
/// Dropping it leaves the callback registered; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the callback, unless a newer subscription already replaced it.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut callback = shared.callback.lock();
            if matches!(&*callback, Some((id, _)) if *id == self.id) {
                *callback = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::decode::{self, fixtures::wav_tone};
    use crate::effects::{EndedListener, StreamListener};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::thread;

    const SONG: &str = "https://example.com/song.mp3";
    const OTHER: &str = "https://example.com/other.mp3";

    type Gate = (mpsc::Sender<()>, mpsc::Receiver<()>);

    /// Hold the next gated call until released. Returns (entered, release).
    fn gate(slot: &Mutex<Option<Gate>>) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *slot.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    fn pass(slot: &Mutex<Option<Gate>>) {
        let held = slot.lock().take();
        if let Some((entered, release)) = held {
            let _ = entered.send(());
            let _ = release.recv();
        }
    }

    #[derive(Default)]
    struct FakeElement {
        loaded: Mutex<Option<String>>,
        playing: AtomicBool,
        position: Mutex<f64>,
        duration: Mutex<Option<f64>>,
        volume: Mutex<Option<f32>>,
        fail_play: AtomicBool,
        loads: AtomicUsize,
        listener: Mutex<Option<StreamListener>>,
        play_gate: Mutex<Option<Gate>>,
    }

    impl FakeElement {
        fn emit(&self, source: &str, event: StreamEvent) {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener(source, event);
            }
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    impl StreamElement for FakeElement {
        fn load(&self, url: &str) {
            *self.loaded.lock() = Some(url.to_string());
            *self.position.lock() = 0.0;
            self.playing.store(false, Ordering::SeqCst);
            self.loads.fetch_add(1, Ordering::SeqCst);
        }
        fn loaded(&self) -> Option<String> {
            self.loaded.lock().clone()
        }
        fn play(&self) -> Result<()> {
            pass(&self.play_gate);
            if self.fail_play.load(Ordering::SeqCst) {
                return Err(Error::StreamingStart("NotAllowedError".into()));
            }
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn pause(&self) {
            self.playing.store(false, Ordering::SeqCst);
        }
        fn position(&self) -> f64 {
            *self.position.lock()
        }
        fn set_position(&self, seconds: f64) {
            *self.position.lock() = seconds;
        }
        fn duration(&self) -> Option<f64> {
            *self.duration.lock()
        }
        fn set_volume(&self, volume: f32) {
            *self.volume.lock() = Some(volume);
        }
        fn set_listener(&self, listener: StreamListener) {
            *self.listener.lock() = Some(listener);
        }
    }

    #[derive(Default)]
    struct FakeGraph {
        clock: Mutex<f64>,
        next_id: AtomicU64,
        started: Mutex<Vec<(NodeId, f64)>>,
        stopped: Mutex<Vec<NodeId>>,
        gain: Mutex<Option<f32>>,
        listener: Mutex<Option<EndedListener>>,
        decode_gate: Mutex<Option<Gate>>,
        conforms: AtomicUsize,
    }

    impl FakeGraph {
        fn advance(&self, seconds: f64) {
            *self.clock.lock() += seconds;
        }

        fn last_started(&self) -> (NodeId, f64) {
            *self.started.lock().last().unwrap()
        }

        fn finish(&self, node: NodeId) {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener(node);
            }
        }
    }

    impl AudioGraph for FakeGraph {
        fn decode(&self, bytes: Vec<u8>) -> Result<DecodedAudio> {
            pass(&self.decode_gate);
            decode::decode_bytes(bytes, None)
        }
        fn conform(&self, audio: DecodedAudio) -> DecodedAudio {
            self.conforms.fetch_add(1, Ordering::SeqCst);
            audio
        }
        fn now(&self) -> f64 {
            *self.clock.lock()
        }
        fn start(&self, _: &DecodedAudio, offset: f64) -> NodeId {
            let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.started.lock().push((id, offset));
            id
        }
        fn stop(&self, node: NodeId) {
            self.stopped.lock().push(node);
        }
        fn set_gain(&self, gain: f32) {
            *self.gain.lock() = Some(gain);
        }
        fn set_ended_listener(&self, listener: EndedListener) {
            *self.listener.lock() = Some(listener);
        }
    }

    fn rig() -> (Coordinator, Arc<FakeElement>, Arc<FakeGraph>) {
        let element = Arc::new(FakeElement::default());
        let graph = Arc::new(FakeGraph::default());
        let factory_graph = Arc::clone(&graph);
        let coordinator = Coordinator::new(element.clone(), move || {
            Ok(Arc::clone(&factory_graph) as Arc<dyn AudioGraph>)
        });
        (coordinator, element, graph)
    }

    fn record(coordinator: &Coordinator) -> (Subscription, Arc<Mutex<Vec<PlaybackState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = coordinator.on_state_change(move |state| sink.lock().push(state.clone()));
        (sub, seen)
    }

    fn streaming(url: &str) -> PlaybackState {
        PlaybackState { is_playing: true, current_source: Some(url.into()) }
    }

    fn buffer_playing() -> PlaybackState {
        PlaybackState { is_playing: true, current_source: None }
    }

    fn tone(seconds: f32) -> PlaybackSource {
        PlaybackSource::Raw(wav_tone(seconds, 8000, 1))
    }

    #[test]
    fn starts_idle() {
        let (c, _, _) = rig();
        assert_eq!(c.state(), PlaybackState::idle());
        assert_eq!(c.current_time(), 0.0);
        assert_eq!(c.duration(), 0.0);
    }

    #[test]
    fn only_one_backend_is_active() {
        let (c, element, graph) = rig();

        c.play(PlaybackSource::url(SONG)).unwrap();
        assert_eq!(c.state(), streaming(SONG));
        assert!(element.is_playing());

        c.play(tone(2.0)).unwrap();
        assert_eq!(c.state(), buffer_playing());
        assert!(!element.is_playing());
        let (node, offset) = graph.last_started();
        assert_eq!(offset, 0.0);

        c.play(PlaybackSource::url(SONG)).unwrap();
        assert_eq!(c.state(), streaming(SONG));
        assert!(element.is_playing());
        assert_eq!(*graph.stopped.lock(), vec![node]);
    }

    #[test]
    fn same_url_continues_without_reload() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();
        element.set_position(12.0);
        c.pause();
        assert_eq!(c.state().is_playing, false);
        assert_eq!(c.state().current_source.as_deref(), Some(SONG));

        c.play(PlaybackSource::url(SONG)).unwrap();
        assert_eq!(element.loads.load(Ordering::SeqCst), 1);
        assert_eq!(c.current_time(), 12.0);
        assert_eq!(c.state(), streaming(SONG));
    }

    #[test]
    fn new_url_reloads_from_zero() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();
        element.set_position(40.0);
        c.play(PlaybackSource::url(OTHER)).unwrap();
        assert_eq!(element.loads.load(Ordering::SeqCst), 2);
        assert_eq!(c.current_time(), 0.0);
        assert_eq!(c.state(), streaming(OTHER));
    }

    #[test]
    fn buffer_pause_and_resume_keep_position() {
        let (c, _, graph) = rig();
        c.play(tone(10.0)).unwrap();
        graph.advance(5.0);
        assert!((c.current_time() - 5.0).abs() < 1e-9);

        c.pause();
        assert_eq!(c.state(), PlaybackState::idle());
        graph.advance(3.0);
        assert!((c.current_time() - 5.0).abs() < 1e-9);

        c.resume().unwrap();
        assert_eq!(c.state(), buffer_playing());
        let (_, offset) = graph.last_started();
        assert!((offset - 5.0).abs() < 1e-9);
        graph.advance(1.0);
        assert!((c.current_time() - 6.0).abs() < 1e-9);
        assert!((c.duration() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn current_time_is_clamped_to_duration() {
        let (c, _, graph) = rig();
        c.play(tone(2.0)).unwrap();
        graph.advance(30.0);
        assert!((c.current_time() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn buffer_seek_clamps_and_restarts_node() {
        let (c, _, graph) = rig();
        c.play(tone(2.0)).unwrap();

        c.seek(1.5);
        let (_, offset) = graph.last_started();
        assert!((offset - 1.5).abs() < 1e-9);
        assert!((c.current_time() - 1.5).abs() < 1e-9);
        assert_eq!(graph.stopped.lock().len(), 1);

        c.pause();
        c.seek(-3.0);
        assert_eq!(c.current_time(), 0.0);
        c.seek(100.0);
        assert!((c.current_time() - 2.0).abs() < 1e-6);
        c.seek(f64::NAN);
        assert_eq!(c.current_time(), 0.0);
        // paused seeks never start nodes
        assert_eq!(graph.started.lock().len(), 2);
    }

    #[test]
    fn stream_seek_clamps_to_known_duration() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();

        c.seek(45.0);
        assert_eq!(element.position(), 45.0);

        *element.duration.lock() = Some(30.0);
        c.seek(45.0);
        assert_eq!(element.position(), 30.0);
        c.seek(-1.0);
        assert_eq!(element.position(), 0.0);
        assert_eq!(c.duration(), 30.0);
    }

    #[test]
    fn seek_while_idle_is_a_no_op() {
        let (c, element, _) = rig();
        c.seek(5.0);
        assert_eq!(element.position(), 0.0);
        assert_eq!(c.current_time(), 0.0);
    }

    #[test]
    fn stop_always_lands_idle() {
        let (c, element, graph) = rig();
        let (_sub, seen) = record(&c);

        c.play(PlaybackSource::url(SONG)).unwrap();
        element.set_position(9.0);
        c.stop();
        assert_eq!(c.state(), PlaybackState::idle());
        assert_eq!(element.position(), 0.0);
        assert!(!element.is_playing());

        c.play(tone(1.0)).unwrap();
        let (node, _) = graph.last_started();
        c.stop();
        assert_eq!(c.state(), PlaybackState::idle());
        assert!(graph.stopped.lock().contains(&node));
        assert_eq!(c.duration(), 0.0);

        c.stop();
        assert_eq!(
            *seen.lock(),
            vec![streaming(SONG), PlaybackState::idle(), buffer_playing(), PlaybackState::idle()]
        );
    }

    #[test]
    fn one_notification_per_change() {
        let (c, _, _) = rig();
        let (sub, seen) = record(&c);

        c.play(PlaybackSource::url(SONG)).unwrap();
        c.pause();
        c.pause();
        c.set_volume(0.5);
        c.seek(3.0);
        assert_eq!(
            *seen.lock(),
            vec![
                streaming(SONG),
                PlaybackState { is_playing: false, current_source: Some(SONG.into()) },
            ]
        );

        sub.unsubscribe();
        c.resume().unwrap();
        c.stop();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn last_subscription_wins() {
        let (c, _, _) = rig();
        let (old, old_seen) = record(&c);
        let (_new, new_seen) = record(&c);

        old.unsubscribe();
        c.play(tone(1.0)).unwrap();
        assert!(old_seen.lock().is_empty());
        assert_eq!(*new_seen.lock(), vec![buffer_playing()]);
    }

    #[test]
    fn callback_may_reenter() {
        let (c, _, _) = rig();
        let c = Arc::new(c);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (inner_c, sink) = (Arc::clone(&c), Arc::clone(&seen));
        let _sub = c.on_state_change(move |state| {
            sink.lock().push(inner_c.state() == *state);
        });

        c.play(PlaybackSource::url(SONG)).unwrap();
        c.stop();
        assert_eq!(*seen.lock(), vec![true, true]);
    }

    #[test]
    fn invalid_bytes_leave_state_unchanged() {
        let (c, element, graph) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();
        let (_sub, seen) = record(&c);

        let err = c.play(PlaybackSource::Raw(b"TTS generated fail".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(c.state(), streaming(SONG));
        assert!(element.is_playing());
        assert!(graph.started.lock().is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn backend_init_failure_is_reported() {
        let element = Arc::new(FakeElement::default());
        let c = Coordinator::new(element, || Err(Error::BackendInit("no output device".into())));
        let err = c.play(tone(1.0)).unwrap_err();
        assert!(matches!(err, Error::BackendInit(_)));
        assert_eq!(c.state(), PlaybackState::idle());
    }

    #[test]
    fn stream_failure_leaves_buffer_alone() {
        let (c, element, graph) = rig();
        c.play(tone(2.0)).unwrap();
        element.fail_play.store(true, Ordering::SeqCst);

        let err = c.play(PlaybackSource::url(SONG)).unwrap_err();
        assert!(matches!(err, Error::StreamingStart(_)));
        assert_eq!(c.state(), buffer_playing());
        assert!(graph.stopped.lock().is_empty());
    }

    #[test]
    fn stream_failure_after_switch_clears_source() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();
        element.fail_play.store(true, Ordering::SeqCst);

        assert!(c.play(PlaybackSource::url(OTHER)).is_err());
        assert_eq!(c.state(), PlaybackState::idle());
        // nothing tracked, nothing to resume
        c.resume().unwrap();
        assert_eq!(c.state(), PlaybackState::idle());
    }

    #[test]
    fn later_url_play_supersedes_in_flight_decode() {
        let (c, element, graph) = rig();
        let c = Arc::new(c);
        let (entered, release) = gate(&graph.decode_gate);

        let raw = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.play(tone(1.0)))
        };
        entered.recv().unwrap();

        c.play(PlaybackSource::url(SONG)).unwrap();
        release.send(()).unwrap();
        raw.join().unwrap().unwrap();

        assert_eq!(c.state(), streaming(SONG));
        assert!(element.is_playing());
        assert!(graph.started.lock().is_empty());
    }

    #[test]
    fn stop_supersedes_in_flight_stream_start() {
        let (c, element, _) = rig();
        let c = Arc::new(c);
        let (entered, release) = gate(&element.play_gate);

        let url = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.play(PlaybackSource::url(SONG)))
        };
        entered.recv().unwrap();

        c.stop();
        release.send(()).unwrap();
        url.join().unwrap().unwrap();

        assert_eq!(c.state(), PlaybackState::idle());
        assert!(!element.is_playing());
    }

    #[test]
    fn buffer_play_supersedes_in_flight_stream_start() {
        let (c, element, graph) = rig();
        let c = Arc::new(c);
        let (entered, release) = gate(&element.play_gate);

        let url = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.play(PlaybackSource::url(SONG)))
        };
        entered.recv().unwrap();

        c.play(tone(1.0)).unwrap();
        release.send(()).unwrap();
        url.join().unwrap().unwrap();

        assert_eq!(c.state(), buffer_playing());
        assert!(!element.is_playing());
        assert_eq!(graph.started.lock().len(), 1);
        assert!(graph.stopped.lock().is_empty());
    }

    #[test]
    fn queued_url_play_superseded_before_load_never_loads() {
        let (c, element, _) = rig();
        let c = Arc::new(c);
        let (entered, release) = gate(&element.play_gate);

        let first = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.play(PlaybackSource::url(SONG)))
        };
        entered.recv().unwrap();

        // The second play takes its ticket, then waits for the first to finish
        // with the element.
        let second = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.play(PlaybackSource::url(OTHER)))
        };
        while c.shared.inner.lock().generation < 2 {
            thread::yield_now();
        }
        c.stop();
        release.send(()).unwrap();
        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        assert_eq!(element.loads.load(Ordering::SeqCst), 1);
        assert_eq!(element.loaded().as_deref(), Some(SONG));
        assert_eq!(c.state(), PlaybackState::idle());
        assert!(!element.is_playing());
    }

    #[test]
    fn stream_events_apply_to_the_active_stream_only() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();

        element.emit(SONG, StreamEvent::Pause);
        assert_eq!(c.state().is_playing, false);
        element.emit(SONG, StreamEvent::Play);
        assert_eq!(c.state(), streaming(SONG));

        element.emit(OTHER, StreamEvent::Ended);
        assert_eq!(c.state(), streaming(SONG));

        element.emit(SONG, StreamEvent::Ended);
        assert_eq!(
            c.state(),
            PlaybackState { is_playing: false, current_source: Some(SONG.into()) }
        );

        c.play(tone(1.0)).unwrap();
        element.emit(SONG, StreamEvent::Play);
        assert_eq!(c.state(), buffer_playing());
    }

    #[test]
    fn stream_resume_calls_element_play() {
        let (c, element, _) = rig();
        c.play(PlaybackSource::url(SONG)).unwrap();
        c.pause();
        assert!(!element.is_playing());
        c.resume().unwrap();
        assert!(element.is_playing());
        assert_eq!(c.state(), streaming(SONG));
        assert_eq!(element.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn natural_end_rewinds_buffer() {
        let (c, _, graph) = rig();
        c.play(tone(2.0)).unwrap();
        let (node, _) = graph.last_started();
        graph.advance(2.0);

        graph.finish(node);
        assert_eq!(c.state(), PlaybackState::idle());
        assert_eq!(c.current_time(), 0.0);
        assert!((c.duration() - 2.0).abs() < 1e-6);

        c.resume().unwrap();
        assert_eq!(graph.last_started().1, 0.0);
        assert_eq!(c.state(), buffer_playing());
    }

    #[test]
    fn stale_ended_is_ignored() {
        let (c, _, graph) = rig();
        c.play(tone(1.0)).unwrap();
        let (first, _) = graph.last_started();
        c.play(tone(1.0)).unwrap();

        graph.finish(first);
        assert_eq!(c.state(), buffer_playing());
    }

    #[test]
    fn volume_routes_to_element_then_gain() {
        let (c, element, graph) = rig();
        c.set_volume(1.5);
        assert_eq!(*element.volume.lock(), Some(1.0));
        assert_eq!(*graph.gain.lock(), None);

        c.set_volume(0.4);
        c.play(tone(1.0)).unwrap();
        assert_eq!(*graph.gain.lock(), Some(0.4));

        c.set_volume(-2.0);
        assert_eq!(*graph.gain.lock(), Some(0.0));
        assert_eq!(*element.volume.lock(), Some(0.4));
        assert_eq!(c.volume(), 0.0);
    }

    #[test]
    fn decoded_source_starts_at_zero() {
        let (c, _, graph) = rig();
        let audio = DecodedAudio::new(vec![0.0; 8000], 8000, 1);
        c.play(PlaybackSource::Decoded(audio)).unwrap();
        assert_eq!(graph.last_started().1, 0.0);
        assert!((c.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decoded_source_is_conformed_once() {
        let (c, _, graph) = rig();
        let audio = DecodedAudio::new(vec![0.0; 8000], 8000, 1);
        c.play(PlaybackSource::Decoded(audio)).unwrap();
        c.seek(0.5);
        c.pause();
        c.resume().unwrap();
        assert_eq!(graph.started.lock().len(), 3);
        assert_eq!(graph.conforms.load(Ordering::SeqCst), 1);

        c.play(tone(1.0)).unwrap();
        assert_eq!(graph.conforms.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn headless_runs_the_full_state_machine() {
        let c = Coordinator::headless();
        c.play(tone(2.0)).unwrap();
        assert_eq!(c.state(), buffer_playing());
        assert!((c.duration() - 2.0).abs() < 1e-6);
        c.play(PlaybackSource::url(SONG)).unwrap();
        assert_eq!(c.state(), streaming(SONG));
        c.stop();
        assert_eq!(c.state(), PlaybackState::idle());
    }
}
