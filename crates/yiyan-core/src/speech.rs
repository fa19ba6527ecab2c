//! Narration: text → speech endpoint → audio cache → coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::models::PlaybackSource;
use crate::paths;

/// Body of the synthesis call: `{"text", "language"?, "voiceName"?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), language: None, voice_name: None }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

pub trait Synthesizer: Send + Sync {
    /// Audio bytes (WAV from the stock endpoint) for `request`.
    fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>>;
}

/// POSTs the request as JSON and takes the response body as audio.
#[cfg(feature = "http")]
pub struct HttpSynthesizer {
    url: String,
}

#[cfg(feature = "http")]
impl HttpSynthesizer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[cfg(feature = "http")]
impl Synthesizer for HttpSynthesizer {
    fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        if request.text.trim().is_empty() {
            return Err(Error::synthesis("text is required"));
        }
        let response = crate::effects::http::post_json(&self.url, request).map_err(Error::synthesis)?;
        if !response.is_success() {
            return Err(Error::Synthesis { status: Some(response.status), message: response.text() });
        }
        if response.body.is_empty() {
            return Err(Error::synthesis("endpoint returned no audio"));
        }
        log::debug!("yiyan: synthesized {} bytes", response.body.len());
        Ok(response.body)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Synthesized audio keyed by the exact text it speaks.
pub trait AudioCache: Send + Sync {
    fn get(&self, text: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, text: &str, audio: &[u8]) -> Result<()>;
    fn len(&self) -> Result<usize>;
}

/// One file per clip under `<data dir>/audio`, named by SHA-256 of the text.
pub struct DirAudioCache {
    data_dir: PathBuf,
}

impl DirAudioCache {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self { data_dir: data_dir.as_ref().to_path_buf() }
    }

    fn file_for(&self, text: &str) -> PathBuf {
        let digest = Sha256::digest(text.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        paths::audio_file(&self.data_dir, &hex)
    }
}

impl AudioCache for DirAudioCache {
    fn get(&self, text: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.file_for(text)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, text: &str, audio: &[u8]) -> Result<()> {
        std::fs::create_dir_all(paths::audio_dir(&self.data_dir))?;
        std::fs::write(self.file_for(text), audio)?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let dir = paths::audio_dir(&self.data_dir);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in std::fs::read_dir(dir)? {
            if entry?.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Narrator
// ---------------------------------------------------------------------------

pub struct Narrator {
    coordinator: Arc<Coordinator>,
    synthesizer: Box<dyn Synthesizer>,
    cache: Box<dyn AudioCache>,
    language: Option<String>,
    voice_name: Option<String>,
}

impl Narrator {
    pub fn new(
        coordinator: Arc<Coordinator>,
        synthesizer: Box<dyn Synthesizer>,
        cache: Box<dyn AudioCache>,
    ) -> Self {
        Self { coordinator, synthesizer, cache, language: None, voice_name: None }
    }

    pub fn with_voice(mut self, language: Option<String>, voice_name: Option<String>) -> Self {
        self.language = language;
        self.voice_name = voice_name;
        self
    }

    pub fn cache(&self) -> &dyn AudioCache {
        self.cache.as_ref()
    }

    /// Speak `text`. Returns `true` when the audio came from the cache.
    ///
    /// Fresh audio is cached only once it has decoded, so an endpoint that
    /// answers 200 with garbage never poisons the cache.
    pub fn say(&self, text: &str) -> Result<bool> {
        if let Some(audio) = self.cache.get(text)? {
            log::debug!("yiyan: narration cache hit ({} bytes)", audio.len());
            self.coordinator.play(PlaybackSource::Raw(audio))?;
            return Ok(true);
        }

        let request = SpeechRequest {
            text: text.to_string(),
            language: self.language.clone(),
            voice_name: self.voice_name.clone(),
        };
        let audio = self.synthesizer.synthesize(&request)?;
        self.coordinator.play(PlaybackSource::Raw(audio.clone()))?;
        if let Err(e) = self.cache.put(text, &audio) {
            log::warn!("yiyan: could not cache narration: {}", e);
        }
        Ok(false)
    }
}
