//! Error kinds for playback, narration and local storage.
//!
//! Playback errors (`BackendInit`, `Decode`, `StreamingStart`) fail the
//! single `play()` call that hit them. `Synthesis` and `QuoteFetch` are
//! recovered by the caller through its cache fallback.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The decode/graph engine (or its output device) could not be created.
    #[error("audio engine init failed: {0}")]
    BackendInit(String),

    /// Raw bytes are not decodable audio.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The streaming element refused to start.
    #[error("streaming start failed: {0}")]
    StreamingStart(String),

    /// Speech endpoint returned a non-success status, or the call itself failed.
    #[error("speech synthesis failed{}: {message}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Synthesis { status: Option<u16>, message: String },

    /// Remote quote call failed.
    #[error("quote fetch failed: {0}")]
    QuoteFetch(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn synthesis(message: impl Into<String>) -> Self {
        Error::Synthesis { status: None, message: message.into() }
    }
}
