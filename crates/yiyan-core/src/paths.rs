//! yiyan data-dir layout.
//!
//! Pure functions from the data dir to the files inside it. Resolving the
//! data dir itself lives in `config`.

use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "config.json";

pub fn config_file(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

pub const QUOTES_FILE: &str = "quotes.json";

pub fn quotes_file(data_dir: &Path) -> PathBuf {
    data_dir.join(QUOTES_FILE)
}

/// Time of the last remote quote fetch attempt, shared across runs.
pub const FETCH_STAMP_FILE: &str = "last_fetch";

pub fn fetch_stamp_file(data_dir: &Path) -> PathBuf {
    data_dir.join(FETCH_STAMP_FILE)
}

// ---------------------------------------------------------------------------
// Synthesized audio
// ---------------------------------------------------------------------------

pub const AUDIO_DIR: &str = "audio";

pub fn audio_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(AUDIO_DIR)
}

/// One cached clip, named by the hex digest of its text.
pub fn audio_file(data_dir: &Path, digest: &str) -> PathBuf {
    audio_dir(data_dir).join(format!("{}.wav", digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_data_dir() {
        let root = Path::new("/tmp/yiyan");
        assert_eq!(config_file(root), Path::new("/tmp/yiyan/config.json"));
        assert_eq!(quotes_file(root), Path::new("/tmp/yiyan/quotes.json"));
        assert_eq!(fetch_stamp_file(root), Path::new("/tmp/yiyan/last_fetch"));
        assert_eq!(audio_file(root, "ab12"), Path::new("/tmp/yiyan/audio/ab12.wav"));
    }
}
