//! The observable playback snapshot.

use serde::{Deserialize, Serialize};

/// What observers see. Serializes as `{"isPlaying": .., "currentSource": ..}`.
///
/// `current_source` is only set while the streaming backend is active;
/// buffer playback reports `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_source: Option<String>,
}

impl PlaybackState {
    pub fn idle() -> Self {
        Self::default()
    }
}
