//! [`MediaProvider`] backed by the `yt-dlp` command line tool.
//!
//! Metadata comes from `yt-dlp -J`, which prints a single JSON document for a
//! playlist or a video. Stream URLs are handed straight to the encoder;
//! captions are fetched over HTTP.

use super::{
    AudioVariant, CaptionTrack, Item, MediaProvider, Playlist, ProviderError, StreamSet,
    VideoVariant,
};
use crate::progress::ProgressSink;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Caption formats in order of preference.
const CAPTION_FORMATS: &[&str] = &["vtt", "srt", "srv3", "ttml"];

#[derive(Debug, Deserialize)]
struct RawPlaylist {
    id: String,
    title: Option<String>,
    description: Option<String>,
    // Unavailable entries come back as null.
    #[serde(default)]
    entries: Vec<Option<RawVideo>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawVideo {
    id: String,
    title: Option<String>,
    description: Option<String>,
    timestamp: Option<i64>,
    upload_date: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    #[serde(default)]
    subtitles: BTreeMap<String, Vec<RawSubtitle>>,
    #[serde(default)]
    automatic_captions: BTreeMap<String, Vec<RawSubtitle>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFormat {
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f64>,
    abr: Option<f64>,
    tbr: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSubtitle {
    ext: Option<String>,
    url: Option<String>,
}

fn has_codec(codec: &Option<String>) -> bool {
    codec.as_deref().is_some_and(|c| c != "none")
}

impl RawVideo {
    fn to_item(&self) -> Item {
        Item {
            id: self.id.clone(),
            title: self.title.clone().unwrap_or_else(|| self.id.clone()),
            description: self.description.clone().filter(|d| !d.is_empty()),
            uploaded_at: upload_time(self.timestamp, self.upload_date.as_deref()),
            duration: self
                .duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(Duration::from_secs_f64),
        }
    }

    fn to_streams(&self) -> StreamSet {
        let mut streams = StreamSet::default();

        for format in &self.formats {
            let Some(url) = format.url.clone() else {
                continue;
            };
            let (video, audio) = (has_codec(&format.vcodec), has_codec(&format.acodec));

            if video {
                if let Some(height) = format.height {
                    streams.video.push(VideoVariant {
                        url,
                        height,
                        frame_rate: format.fps.unwrap_or(0.0),
                    });
                }
            } else if audio {
                streams.audio.push(AudioVariant {
                    url,
                    bitrate_kbps: format.abr.or(format.tbr).unwrap_or(0.0),
                });
            }
        }

        streams
    }

    fn to_caption_tracks(&self) -> Vec<CaptionTrack> {
        let manual = self
            .subtitles
            .iter()
            .filter_map(|(language, tracks)| pick_caption(language, tracks, false));
        let automatic = self
            .automatic_captions
            .iter()
            .filter_map(|(language, tracks)| pick_caption(language, tracks, true));
        manual.chain(automatic).collect()
    }
}

/// Picks the preferred format among the tracks of one language.
fn pick_caption(language: &str, tracks: &[RawSubtitle], auto_generated: bool) -> Option<CaptionTrack> {
    let usable = || {
        tracks
            .iter()
            .filter_map(|t| Some((t.ext.as_deref()?, t.url.as_deref()?)))
    };
    let (format, url) = CAPTION_FORMATS
        .iter()
        .find_map(|wanted| usable().find(|(ext, _)| ext == wanted))
        .or_else(|| usable().next())?;

    Some(CaptionTrack {
        language: language.to_string(),
        format: format.to_string(),
        url: url.to_string(),
        auto_generated,
    })
}

/// Upload time from the epoch `timestamp`, else from the `YYYYMMDD` date.
fn upload_time(timestamp: Option<i64>, upload_date: Option<&str>) -> Option<DateTime<Utc>> {
    timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .or_else(|| {
            let date = NaiveDate::parse_from_str(upload_date?, "%Y%m%d").ok()?;
            Some(date.and_hms_opt(0, 0, 0)?.and_utc())
        })
}

fn playlist_url(id: &str) -> String {
    if id.starts_with("http://") || id.starts_with("https://") {
        id.to_string()
    } else {
        format!("https://www.youtube.com/playlist?list={}", id)
    }
}

fn video_url(id: &str) -> String {
    if id.starts_with("http://") || id.starts_with("https://") {
        id.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", id)
    }
}

/// Build a yt-dlp command printing the JSON document for `url`
///
/// # Arguments
/// * `binary` - Path or name of the yt-dlp executable
/// * `url` - Playlist or video URL
/// * `flat` - List playlist entries without resolving each video
pub fn build_info_command(binary: &Path, url: &str, flat: bool) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("-J").arg("--skip-download").arg("--no-warnings");
    if flat {
        cmd.arg("--flat-playlist");
    } else {
        cmd.arg("--ignore-errors");
    }
    cmd.arg("--").arg(url);
    cmd
}

/// Provider running the yt-dlp executable.
#[derive(Debug)]
pub struct YtDlpProvider {
    binary: PathBuf,
    client: reqwest::Client,
    // Last resolved video, shared by `streams` and `caption_tracks`.
    last_video: Mutex<Option<RawVideo>>,
}

impl YtDlpProvider {
    /// Provider running `binary` and downloading captions with `client`.
    pub fn new(binary: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            binary: binary.into(),
            client,
            last_video: Mutex::new(None),
        }
    }

    async fn run_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        flat: bool,
    ) -> Result<T, ProviderError> {
        debug!(url, flat, "Running yt-dlp");
        let output = tokio::process::Command::from(build_info_command(&self.binary, url, flat))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProviderError::Command(format!("{}: {}", self.binary.display(), e))
            })?;

        // With --ignore-errors yt-dlp exits non-zero but still prints the document.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            return Err(if message.contains("does not exist") || message.contains("Video unavailable") {
                ProviderError::NotFound(url.to_string())
            } else {
                ProviderError::Command(format!("{} ({})", message, output.status))
            });
        }
        if !output.status.success() {
            warn!(url, status = %output.status, "yt-dlp reported errors");
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ProviderError::Parse(e.to_string()))
    }

    async fn video(&self, item_id: &str) -> Result<RawVideo, ProviderError> {
        if let Some(video) = self.cached(item_id) {
            return Ok(video);
        }
        let video: RawVideo = self.run_json(&video_url(item_id), false).await?;
        if let Ok(mut last) = self.last_video.lock() {
            *last = Some(video.clone());
        }
        Ok(video)
    }

    fn cached(&self, item_id: &str) -> Option<RawVideo> {
        let last = self.last_video.lock().ok()?;
        last.as_ref().filter(|v| v.id == item_id).cloned()
    }
}

#[async_trait]
impl MediaProvider for YtDlpProvider {
    async fn playlist(&self, playlist_id: &str) -> Result<Playlist, ProviderError> {
        let raw: RawPlaylist = self.run_json(&playlist_url(playlist_id), true).await?;
        Ok(Playlist {
            title: raw.title.unwrap_or_else(|| raw.id.clone()),
            description: raw.description.filter(|d| !d.is_empty()),
            id: raw.id,
        })
    }

    async fn list_playlist_items(&self, playlist_id: &str) -> Result<Vec<Item>, ProviderError> {
        let raw: RawPlaylist = self.run_json(&playlist_url(playlist_id), false).await?;
        Ok(raw.entries.iter().flatten().map(RawVideo::to_item).collect())
    }

    async fn item(&self, item_id: &str) -> Result<Item, ProviderError> {
        Ok(self.video(item_id).await?.to_item())
    }

    async fn streams(&self, item_id: &str) -> Result<StreamSet, ProviderError> {
        // Stream URLs expire, so they are always resolved fresh.
        let video: RawVideo = self.run_json(&video_url(item_id), false).await?;
        let streams = video.to_streams();
        if let Ok(mut last) = self.last_video.lock() {
            *last = Some(video);
        }
        Ok(streams)
    }

    async fn caption_tracks(&self, item_id: &str) -> Result<Vec<CaptionTrack>, ProviderError> {
        Ok(self.video(item_id).await?.to_caption_tracks())
    }

    async fn download_caption(
        &self,
        track: &CaptionTrack,
        destination: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<(), ProviderError> {
        let mut response = self
            .client
            .get(&track.url)
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length().filter(|len| *len > 0);

        let mut file = tokio::fs::File::create(destination).await?;
        let mut written: u64 = 0;
        progress.report(0.0);
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                progress.report(written as f64 / total as f64);
            }
        }
        file.flush().await?;
        progress.report(1.0);
        Ok(())
    }
}
