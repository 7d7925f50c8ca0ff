//! Media source contract.
//!
//! The archiver never looks at how items, streams or captions are fetched; it
//! only talks to a [`MediaProvider`]. [`ytdlp::YtDlpProvider`] is the bundled
//! implementation.

pub mod ytdlp;

use crate::progress::ProgressSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use ytdlp::YtDlpProvider;

/// Error type for provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider tool could not be run or exited unsuccessfully
    #[error("Provider command failed: {0}")]
    Command(String),

    /// The provider returned data that could not be understood
    #[error("Failed to parse provider output: {0}")]
    Parse(String),

    /// The requested playlist or item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP error while fetching a resource
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error while writing a fetched resource
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Playlist-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

/// One media item as listed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Playback length, used to turn muxing progress into a fraction.
    pub duration: Option<Duration>,
}

/// A video-carrying stream variant.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoVariant {
    /// Location handed to the encoder as an input.
    pub url: String,
    pub height: u32,
    pub frame_rate: f64,
}

/// An audio-only stream variant.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioVariant {
    /// Location handed to the encoder as an input.
    pub url: String,
    pub bitrate_kbps: f64,
}

/// All stream variants of one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSet {
    pub video: Vec<VideoVariant>,
    pub audio: Vec<AudioVariant>,
}

/// A caption track for one language.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionTrack {
    /// Language code, e.g. `en`.
    pub language: String,
    /// File extension of the track format, e.g. `vtt`.
    pub format: String,
    pub url: String,
    /// Machine generated tracks are never archived.
    pub auto_generated: bool,
}

/// Source of playlists, items, streams and captions.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Playlist title and description.
    async fn playlist(&self, playlist_id: &str) -> Result<Playlist, ProviderError>;

    /// Every item of the playlist in provider order.
    async fn list_playlist_items(&self, playlist_id: &str) -> Result<Vec<Item>, ProviderError>;

    /// A single item.
    async fn item(&self, item_id: &str) -> Result<Item, ProviderError>;

    /// Stream variants available for an item.
    async fn streams(&self, item_id: &str) -> Result<StreamSet, ProviderError>;

    /// Caption tracks available for an item, including auto-generated ones.
    async fn caption_tracks(&self, item_id: &str) -> Result<Vec<CaptionTrack>, ProviderError>;

    /// Writes a caption track to `destination`.
    async fn download_caption(
        &self,
        track: &CaptionTrack,
        destination: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<(), ProviderError>;
}

/// Highest resolution video variant, ties broken by the higher frame rate.
pub fn best_video(variants: &[VideoVariant]) -> Option<&VideoVariant> {
    variants.iter().max_by(|a, b| {
        a.height
            .cmp(&b.height)
            .then_with(|| a.frame_rate.total_cmp(&b.frame_rate))
    })
}

/// Highest bitrate audio variant.
pub fn best_audio(variants: &[AudioVariant]) -> Option<&AudioVariant> {
    variants
        .iter()
        .max_by(|a, b| a.bitrate_kbps.total_cmp(&b.bitrate_kbps))
}
