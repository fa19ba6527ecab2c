//! yiyan-core: show a quote, read it aloud.
//!
//! The interesting part is playback. One "now playing" slot sits over two
//! backends and callers only ever talk to the [`Coordinator`].
//!
//! # Architecture
//!
//! ```text
//! Layer 0: Backends   (effects: streaming element, decode/graph engine)
//! Layer 1: Coordinator (one slot, one contract, state-change callback)
//! Layer 2: Feeds      (quotes: store + rate-limited remote, speech: synth + cache)
//! Layer 3: Surfaces   (CLI binary, C FFI)
//! ```

pub mod config;
pub mod coordinator;
pub mod effects;
pub mod error;
pub mod models;
pub mod paths;
pub mod quotes;
pub mod speech;

pub use config::Config;
pub use coordinator::{Coordinator, StateCallback, Subscription};
pub use error::{Error, Result};
pub use models::*;
pub use quotes::{JsonQuoteStore, QuoteFeed, QuoteSource, QuoteStore};
pub use speech::{AudioCache, DirAudioCache, Narrator, SpeechRequest, Synthesizer};

#[cfg(feature = "http")]
pub use quotes::HitokotoClient;
#[cfg(feature = "http")]
pub use speech::HttpSynthesizer;
