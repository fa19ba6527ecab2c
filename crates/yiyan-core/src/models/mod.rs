//! yiyan data models.
//!
//! Tagged enums where Rust dispatch needs them, plain serde structs for
//! the records that cross the JSON boundary (state snapshots, quotes).

pub mod quote;
pub mod source;
pub mod state;

pub use quote::Quote;
pub use source::{DecodedAudio, PlaybackSource};
pub use state::PlaybackState;
