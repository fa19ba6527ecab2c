//! Settings file and data-dir resolution.
//!
//! `config.json` lives in the data dir. Every field has a default, so a
//! missing file (or a partial one) is fine; a file that is not valid JSON
//! for this shape is an error rather than silently ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths;

pub const ENV_HOME: &str = "YIYAN_HOME";
pub const ENV_QUOTE_URL: &str = "YIYAN_QUOTE_URL";
pub const ENV_SPEECH_URL: &str = "YIYAN_SPEECH_URL";

pub const DEFAULT_QUOTE_URL: &str = "https://v1.hitokoto.cn/?c=b";
pub const DEFAULT_SPEECH_URL: &str = "http://localhost:3000/x";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quote_url: String,
    pub speech_url: String,
    /// Minimum spacing between remote quote fetches.
    pub fetch_interval_secs: u64,
    pub language: Option<String>,
    pub voice_name: Option<String>,
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quote_url: DEFAULT_QUOTE_URL.into(),
            speech_url: DEFAULT_SPEECH_URL.into(),
            fetch_interval_secs: 10,
            language: None,
            voice_name: None,
            volume: 0.8,
        }
    }
}

impl Config {
    /// Read `config.json` from `data_dir`, then apply env overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = paths::config_file(data_dir);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Config>(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            log::debug!("yiyan: no config at {}, using defaults", path.display());
            Config::default()
        };

        if let Ok(url) = std::env::var(ENV_QUOTE_URL) {
            config.quote_url = url;
        }
        if let Ok(url) = std::env::var(ENV_SPEECH_URL) {
            config.speech_url = url;
        }
        config.volume = config.volume.clamp(0.0, 1.0);
        Ok(config)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// `$YIYAN_HOME`, else `$HOME/.yiyan`, else `./.yiyan`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_HOME).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home).join(".yiyan"),
        None => PathBuf::from(".yiyan"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn clean_env() -> std::sync::MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::remove_var(ENV_QUOTE_URL);
        std::env::remove_var(ENV_SPEECH_URL);
        guard
    }

    #[test]
    fn missing_file_gives_defaults() {
        let _guard = clean_env();
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.fetch_interval_secs, 10);
        assert_eq!(config.quote_url, "https://v1.hitokoto.cn/?c=b");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let _guard = clean_env();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            paths::config_file(dir.path()),
            r#"{"voice_name": "zh-CN-XiaoxiaoNeural", "volume": 3.0}"#,
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.voice_name.as_deref(), Some("zh-CN-XiaoxiaoNeural"));
        assert_eq!(config.volume, 1.0);
        assert_eq!(config.speech_url, DEFAULT_SPEECH_URL);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let _guard = clean_env();
        let dir = TempDir::new().unwrap();
        std::fs::write(paths::config_file(dir.path()), "{ not json").unwrap();
        assert!(matches!(Config::load(dir.path()), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_urls() {
        let _guard = clean_env();
        let dir = TempDir::new().unwrap();
        std::env::set_var(ENV_QUOTE_URL, "http://127.0.0.1:9/quote");
        std::env::set_var(ENV_SPEECH_URL, "http://127.0.0.1:9/x");
        let config = Config::load(dir.path());
        std::env::remove_var(ENV_QUOTE_URL);
        std::env::remove_var(ENV_SPEECH_URL);

        let config = config.unwrap();
        assert_eq!(config.quote_url, "http://127.0.0.1:9/quote");
        assert_eq!(config.speech_url, "http://127.0.0.1:9/x");
    }

    #[test]
    fn data_dir_prefers_yiyan_home() {
        let _guard = clean_env();
        let previous = std::env::var_os(ENV_HOME);
        std::env::set_var(ENV_HOME, "/srv/yiyan");
        let dir = data_dir();
        match previous {
            Some(p) => std::env::set_var(ENV_HOME, p),
            None => std::env::remove_var(ENV_HOME),
        }
        assert_eq!(dir, PathBuf::from("/srv/yiyan"));
    }
}
