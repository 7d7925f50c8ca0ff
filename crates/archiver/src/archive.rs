//! Archival orchestrator.
//!
//! Drives one run: list the source, drop what the ledger already holds, then
//! process the remaining items strictly one at a time. An item id reaches the
//! ledger only after its media, captions and sidecar are on disk, so a run
//! interrupted at any point is resumed by simply running again.

use crate::encode::{EncodeError, Encoder, MuxRequest};
use crate::ledger::Ledger;
use crate::metadata::{Episode, LocalMetadata, MetadataError, Movie, TvShow, SHOW_NFO_FILE_NAME};
use crate::progress::{NoProgress, ProgressSink};
use crate::provider::{best_audio, best_video, Item, MediaProvider, Playlist, ProviderError};
use crate::sequence::{episode_prefix, last_ordinal};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use tubeshelf_config::ArchiveConfig;

/// Characters rejected in file names by at least one mainstream filesystem.
const INVALID_FILE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Error type for archival runs
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The target or season directory could not be created or read
    #[error("Cannot use directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Listing the playlist or fetching the item failed
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Show-level metadata could not be written
    #[error("Failed to write show metadata: {0}")]
    ShowMetadata(#[source] MetadataError),

    /// Streams of an item could not be resolved
    #[error("Failed to resolve streams for {id}: {source}")]
    Streams {
        id: String,
        #[source]
        source: ProviderError,
    },

    /// The item offers no stream of the required kind
    #[error("Item {id} has no {kind} stream")]
    NoStream { id: String, kind: &'static str },

    /// Muxing the item failed
    #[error("Encoding failed for {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: EncodeError,
    },

    /// The item sidecar or poster could not be written
    #[error("Failed to write metadata for {id}: {source}")]
    ItemMetadata {
        id: String,
        #[source]
        source: MetadataError,
    },

    /// The ledger could not be read or appended to
    #[error("Ledger error: {0}")]
    Ledger(#[source] io::Error),
}

impl ArchiveError {
    /// True when the failure belongs to a single item, which stays unledgered
    /// and is retried by the next run.
    pub fn is_item_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::Streams { .. }
                | ArchiveError::NoStream { .. }
                | ArchiveError::Encode { .. }
                | ArchiveError::ItemMetadata { .. }
        )
    }
}

fn directory_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Directory {
        path: path.to_path_buf(),
        source,
    }
}

/// Archive a whole playlist as a season of a show.
#[derive(Debug, Clone)]
pub struct PlaylistRequest {
    pub playlist_id: String,
    pub target_dir: PathBuf,
    pub season: u32,
    /// Process oldest uploads first instead of in playlist order.
    pub reorder: bool,
}

/// Archive one item on its own.
#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub item_id: String,
    pub target_dir: PathBuf,
}

/// Output settings shared by both archival modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOptions {
    /// Output container extension, e.g. `mp4`
    pub container: String,
    /// Caption languages to fetch, in order
    pub caption_languages: Vec<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self::from(&ArchiveConfig::default())
    }
}

impl From<&ArchiveConfig> for ArchiveOptions {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            container: config.container.clone(),
            caption_languages: config.caption_languages.clone(),
        }
    }
}

/// A caption track that was skipped during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedCaption {
    pub item_id: String,
    pub language: String,
    pub reason: String,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveReport {
    /// Ids of items processed in this run, in processing order
    pub processed: Vec<String>,
    pub skipped_captions: Vec<SkippedCaption>,
}

/// Hooks for presenting a run to a user.
///
/// Every method has a do-nothing default.
pub trait ArchiveObserver: Send + Sync {
    /// Poster location for the show or movie titled `title`. None means no poster.
    fn poster_source(&self, _title: &str) -> Option<String> {
        None
    }

    /// An item is about to be processed. `ordinal` is None in single-item mode.
    fn item_started(&self, _item: &Item, _ordinal: Option<u32>) {}

    /// Sink receiving the muxing and caption progress of an item.
    fn progress_sink(&self, _item: &Item, _ordinal: Option<u32>) -> Box<dyn ProgressSink> {
        Box::new(NoProgress)
    }

    /// A caption track could not be fetched and was skipped.
    fn caption_skipped(&self, _item: &Item, _language: &str, _error: &ProviderError) {}

    /// An item has been fully written.
    fn item_finished(&self, _item: &Item) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl ArchiveObserver for SilentObserver {}

/// Strips characters that are invalid in file names and trailing dots and
/// spaces. An empty result falls back to `fallback`.
pub fn sanitize_file_name(title: &str, fallback: &str) -> String {
    let clean = |s: &str| -> String {
        let kept: String = s
            .chars()
            .filter(|c| !INVALID_FILE_NAME_CHARS.contains(c) && !c.is_control())
            .collect();
        kept.trim_start()
            .trim_end_matches(|c: char| c == '.' || c.is_whitespace())
            .to_string()
    };

    let name = clean(title);
    if name.is_empty() {
        clean(fallback)
    } else {
        name
    }
}

/// Base file name of an episode, e.g. `S01E06 Title`.
pub fn episode_base_name(season: u32, ordinal: u32, title: &str, id: &str) -> String {
    format!(
        "{}{:02} {}",
        episode_prefix(season),
        ordinal,
        sanitize_file_name(title, id)
    )
}

/// Name of the directory holding one season.
pub fn season_dir_name(season: u32) -> String {
    format!("Season {}", season)
}

/// Items still to process, in processing order.
///
/// Duplicate ids keep their first occurrence, ids in `seen` are dropped, and
/// with `reorder` the rest is stably sorted by upload time with undated items
/// last.
pub fn select_pending(items: Vec<Item>, seen: &HashSet<String>, reorder: bool) -> Vec<Item> {
    let mut listed = HashSet::new();
    let mut pending: Vec<Item> = items
        .into_iter()
        .filter(|item| listed.insert(item.id.clone()))
        .filter(|item| !seen.contains(&item.id))
        .collect();

    if reorder {
        pending.sort_by_key(|item| (item.uploaded_at.is_none(), item.uploaded_at));
    }
    pending
}

/// Runs archival jobs against a provider and an encoder.
pub struct Archiver {
    provider: Arc<dyn MediaProvider>,
    encoder: Arc<dyn Encoder>,
    metadata: LocalMetadata,
    observer: Arc<dyn ArchiveObserver>,
    options: ArchiveOptions,
}

impl Archiver {
    /// Archiver with a silent observer and a default metadata writer.
    pub fn new(
        provider: Arc<dyn MediaProvider>,
        encoder: Arc<dyn Encoder>,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            provider,
            encoder,
            metadata: LocalMetadata::default(),
            observer: Arc::new(SilentObserver),
            options,
        }
    }

    /// Replace the observer.
    pub fn with_observer(mut self, observer: Arc<dyn ArchiveObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the metadata writer.
    pub fn with_metadata(mut self, metadata: LocalMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Archive every item of a playlist not yet in the target's ledger.
    ///
    /// # Arguments
    /// * `request` - Playlist id, target directory, season and ordering
    ///
    /// # Returns
    /// The ids processed in this run. The first item-level failure stops the
    /// run and is returned; everything processed before it stays ledgered.
    pub async fn archive_playlist(
        &self,
        request: &PlaylistRequest,
    ) -> Result<ArchiveReport, ArchiveError> {
        let target = &request.target_dir;
        tokio::fs::create_dir_all(target)
            .await
            .map_err(directory_error(target))?;

        let playlist = self.provider.playlist(&request.playlist_id).await?;
        let items = self
            .provider
            .list_playlist_items(&request.playlist_id)
            .await?;
        info!(playlist = %playlist.id, items = items.len(), "Listed playlist");

        self.ensure_show(&playlist, &items, target).await?;

        let ledger = Ledger::for_directory(target);
        let seen = ledger.ids().map_err(ArchiveError::Ledger)?;
        let pending = select_pending(items, &seen, request.reorder);
        info!(pending = pending.len(), "Selected items to archive");

        let season_dir = target.join(season_dir_name(request.season));
        tokio::fs::create_dir_all(&season_dir)
            .await
            .map_err(directory_error(&season_dir))?;
        let mut ordinal = last_ordinal(&season_dir, &episode_prefix(request.season))
            .map_err(directory_error(&season_dir))?;

        let mut report = ArchiveReport::default();
        for item in &pending {
            ordinal = ordinal.saturating_add(1);
            let base = episode_base_name(request.season, ordinal, &item.title, &item.id);
            info!(id = %item.id, ordinal, "Archiving item");
            self.observer.item_started(item, Some(ordinal));

            self.process_item(item, &season_dir, &base, Some(ordinal), &mut report)
                .await?;

            let episode = Episode {
                title: item.title.clone(),
                plot: item.description.clone(),
                aired: item.uploaded_at.map(|t| t.date_naive()),
            };
            self.metadata
                .write_episode(&episode, &season_dir, &base)
                .await
                .map_err(|source| ArchiveError::ItemMetadata {
                    id: item.id.clone(),
                    source,
                })?;

            ledger.append(&item.id).map_err(ArchiveError::Ledger)?;
            report.processed.push(item.id.clone());
            self.observer.item_finished(item);
        }

        Ok(report)
    }

    /// Archive a single item as a movie. The ledger is not consulted.
    pub async fn archive_item(&self, request: &ItemRequest) -> Result<ArchiveReport, ArchiveError> {
        let target = &request.target_dir;
        tokio::fs::create_dir_all(target)
            .await
            .map_err(directory_error(target))?;

        let item = self.provider.item(&request.item_id).await?;
        let base = sanitize_file_name(&item.title, &item.id);
        info!(id = %item.id, "Archiving item");

        // Poster prompt and sidecar come before any media is fetched.
        let movie = Movie {
            title: item.title.clone(),
            plot: item.description.clone(),
            release_date: item.uploaded_at.map(|t| t.date_naive()),
            poster: self.observer.poster_source(&item.title),
        };
        self.metadata
            .save_movie(&movie, target, &base)
            .await
            .map_err(|source| ArchiveError::ItemMetadata {
                id: item.id.clone(),
                source,
            })?;

        self.observer.item_started(&item, None);
        let mut report = ArchiveReport::default();
        self.process_item(&item, target, &base, None, &mut report)
            .await?;

        report.processed.push(item.id.clone());
        self.observer.item_finished(&item);
        Ok(report)
    }

    /// Writes `tvshow.nfo` and the show poster unless the sidecar exists.
    async fn ensure_show(
        &self,
        playlist: &Playlist,
        items: &[Item],
        target: &Path,
    ) -> Result<(), ArchiveError> {
        if target.join(SHOW_NFO_FILE_NAME).exists() {
            debug!("Show metadata already present");
            return Ok(());
        }

        let show = TvShow {
            title: playlist.title.clone(),
            plot: playlist.description.clone(),
            premiered: items
                .iter()
                .filter_map(|item| item.uploaded_at)
                .min()
                .map(|t| t.date_naive()),
            poster: self.observer.poster_source(&playlist.title),
        };
        self.metadata
            .save_show(&show, target)
            .await
            .map_err(ArchiveError::ShowMetadata)
    }

    /// Muxes the best streams of `item` into `<dir>/<base>.<container>`, then
    /// fetches its captions next to it. Captions are only fetched once the
    /// media is on disk.
    async fn process_item(
        &self,
        item: &Item,
        dir: &Path,
        base: &str,
        ordinal: Option<u32>,
        report: &mut ArchiveReport,
    ) -> Result<(), ArchiveError> {
        let streams = self
            .provider
            .streams(&item.id)
            .await
            .map_err(|source| ArchiveError::Streams {
                id: item.id.clone(),
                source,
            })?;
        let video = best_video(&streams.video).ok_or_else(|| ArchiveError::NoStream {
            id: item.id.clone(),
            kind: "video",
        })?;
        let audio = best_audio(&streams.audio).ok_or_else(|| ArchiveError::NoStream {
            id: item.id.clone(),
            kind: "audio",
        })?;
        debug!(id = %item.id, height = video.height, fps = video.frame_rate, kbps = audio.bitrate_kbps, "Selected streams");

        let request = MuxRequest {
            video: video.url.clone(),
            audio: audio.url.clone(),
            output: dir.join(format!("{}.{}", base, self.options.container)),
            duration: item.duration,
        };
        let sink = self.observer.progress_sink(item, ordinal);

        self.encoder
            .mux(&request, &*sink)
            .await
            .map_err(|source| ArchiveError::Encode {
                id: item.id.clone(),
                source,
            })?;

        let skipped = self.download_captions(item, dir, base, &*sink).await;
        report.skipped_captions.extend(skipped);
        Ok(())
    }

    /// Downloads the configured, non auto-generated caption tracks. Failures
    /// are reported and skipped.
    async fn download_captions(
        &self,
        item: &Item,
        dir: &Path,
        base: &str,
        sink: &dyn ProgressSink,
    ) -> Vec<SkippedCaption> {
        let mut skipped = Vec::new();
        let mut skip = |language: &str, error: &ProviderError| {
            warn!(id = %item.id, language, error = %error, "Skipping caption");
            self.observer.caption_skipped(item, language, error);
            skipped.push(SkippedCaption {
                item_id: item.id.clone(),
                language: language.to_string(),
                reason: error.to_string(),
            });
        };

        let tracks = match self.provider.caption_tracks(&item.id).await {
            Ok(tracks) => tracks,
            Err(e) => {
                for language in &self.options.caption_languages {
                    skip(language.as_str(), &e);
                }
                return skipped;
            }
        };

        for language in &self.options.caption_languages {
            let Some(track) = tracks
                .iter()
                .find(|t| !t.auto_generated && &t.language == language)
            else {
                debug!(id = %item.id, language = %language, "No caption track");
                continue;
            };

            let destination = dir.join(format!("{}.{}.{}", base, track.language, track.format));
            if let Err(e) = self.provider.download_caption(track, &destination, sink).await {
                skip(language.as_str(), &e);
            }
        }

        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LEDGER_FILE_NAME;
    use crate::provider::{AudioVariant, CaptionTrack, StreamSet, VideoVariant};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn at(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).single()
    }

    fn item(id: &str, title: &str, uploaded_at: Option<DateTime<Utc>>) -> Item {
        Item {
            id: id.to_string(),
            title: title.to_string(),
            description: Some(format!("About {}", title)),
            uploaded_at,
            duration: None,
        }
    }

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn record(events: &EventLog, event: &str) {
        events.lock().unwrap().push(event.to_string());
    }

    fn position(events: &[String], event: &str) -> usize {
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{} not recorded in {:?}", event, events))
    }

    #[derive(Default)]
    struct FakeProvider {
        items: Vec<Item>,
        fail_listing: bool,
        failing_languages: Vec<String>,
        listings: Mutex<usize>,
        events: EventLog,
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        async fn playlist(&self, playlist_id: &str) -> Result<Playlist, ProviderError> {
            Ok(Playlist {
                id: playlist_id.to_string(),
                title: "My Channel".to_string(),
                description: None,
            })
        }

        async fn list_playlist_items(&self, _: &str) -> Result<Vec<Item>, ProviderError> {
            *self.listings.lock().unwrap() += 1;
            if self.fail_listing {
                return Err(ProviderError::Command("listing unavailable".to_string()));
            }
            Ok(self.items.clone())
        }

        async fn item(&self, item_id: &str) -> Result<Item, ProviderError> {
            self.items
                .iter()
                .find(|i| i.id == item_id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(item_id.to_string()))
        }

        async fn streams(&self, item_id: &str) -> Result<StreamSet, ProviderError> {
            Ok(StreamSet {
                video: vec![
                    VideoVariant {
                        url: format!("video://{}/480", item_id),
                        height: 480,
                        frame_rate: 30.0,
                    },
                    VideoVariant {
                        url: format!("video://{}/1080", item_id),
                        height: 1080,
                        frame_rate: 30.0,
                    },
                ],
                audio: vec![AudioVariant {
                    url: format!("audio://{}", item_id),
                    bitrate_kbps: 128.0,
                }],
            })
        }

        async fn caption_tracks(&self, item_id: &str) -> Result<Vec<CaptionTrack>, ProviderError> {
            record(&self.events, "caption_list");
            let track = |language: &str, auto_generated: bool| CaptionTrack {
                language: language.to_string(),
                format: "vtt".to_string(),
                url: format!("caption://{}/{}", item_id, language),
                auto_generated,
            };
            Ok(vec![track("en", false), track("de", false), track("fr", true)])
        }

        async fn download_caption(
            &self,
            track: &CaptionTrack,
            destination: &Path,
            progress: &dyn ProgressSink,
        ) -> Result<(), ProviderError> {
            record(&self.events, "caption_download");
            if self.failing_languages.contains(&track.language) {
                return Err(ProviderError::Command("caption gone".to_string()));
            }
            fs::write(destination, "WEBVTT\n")?;
            progress.report(1.0);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEncoder {
        fail_on: Option<String>,
        muxed: Mutex<Vec<String>>,
        events: EventLog,
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn mux(
            &self,
            request: &MuxRequest,
            progress: &dyn ProgressSink,
        ) -> Result<(), EncodeError> {
            let id = request.audio.trim_start_matches("audio://").to_string();
            assert!(request.video.ends_with("/1080"), "best video not chosen");
            record(&self.events, "mux_start");
            tokio::task::yield_now().await;
            if self.fail_on.as_deref() == Some(id.as_str()) {
                record(&self.events, "mux_failed");
                return Err(EncodeError::FfmpegFailed {
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            fs::write(&request.output, b"media")?;
            progress.report(1.0);
            self.muxed.lock().unwrap().push(id);
            record(&self.events, "mux_end");
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        poster: Option<String>,
        poster_requests: Mutex<Vec<String>>,
        skipped: Mutex<Vec<(String, String)>>,
        finished: Mutex<Vec<String>>,
        events: EventLog,
    }

    impl ArchiveObserver for RecordingObserver {
        fn poster_source(&self, title: &str) -> Option<String> {
            self.poster_requests.lock().unwrap().push(title.to_string());
            record(&self.events, "poster");
            self.poster.clone()
        }

        fn caption_skipped(&self, item: &Item, language: &str, _error: &ProviderError) {
            self.skipped
                .lock()
                .unwrap()
                .push((item.id.clone(), language.to_string()));
        }

        fn item_finished(&self, item: &Item) {
            self.finished.lock().unwrap().push(item.id.clone());
        }
    }

    struct Harness {
        provider: Arc<FakeProvider>,
        encoder: Arc<FakeEncoder>,
        observer: Arc<RecordingObserver>,
        archiver: Archiver,
    }

    fn harness(provider: FakeProvider, encoder: FakeEncoder, observer: RecordingObserver) -> Harness {
        let provider = Arc::new(provider);
        let encoder = Arc::new(encoder);
        let observer = Arc::new(observer);
        let archiver = Archiver::new(
            provider.clone(),
            encoder.clone(),
            ArchiveOptions {
                container: "mp4".to_string(),
                caption_languages: vec!["en".to_string(), "de".to_string(), "fr".to_string()],
            },
        )
        .with_observer(observer.clone());
        Harness {
            provider,
            encoder,
            observer,
            archiver,
        }
    }

    fn playlist_request(target: &Path, reorder: bool) -> PlaylistRequest {
        PlaylistRequest {
            playlist_id: "PL1".to_string(),
            target_dir: target.to_path_buf(),
            season: 1,
            reorder,
        }
    }

    fn out_of_order_items() -> Vec<Item> {
        vec![
            item("c", "Newest", at(2021, 1, 1)),
            item("a", "Oldest", at(2019, 1, 1)),
            item("b", "Middle", at(2020, 1, 1)),
        ]
    }

    fn ledger_lines(target: &Path) -> Vec<String> {
        fs::read_to_string(target.join(LEDGER_FILE_NAME))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_second_run_processes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );
        let request = playlist_request(temp_dir.path(), true);

        let first = h.archiver.archive_playlist(&request).await.unwrap();
        let second = h.archiver.archive_playlist(&request).await.unwrap();

        assert_eq!(first.processed.len(), 3);
        assert!(second.processed.is_empty());
        assert_eq!(h.encoder.muxed.lock().unwrap().len(), 3);
        assert_eq!(*h.provider.listings.lock().unwrap(), 2);
        assert_eq!(ledger_lines(temp_dir.path()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reorder_processes_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let report = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["a", "b", "c"]);
        let season = temp_dir.path().join("Season 1");
        assert!(season.join("S01E01 Oldest.mp4").exists());
        assert!(season.join("S01E02 Middle.mp4").exists());
        assert!(season.join("S01E03 Newest.mp4").exists());
        assert!(season.join("S01E01 Oldest.nfo").exists());
    }

    #[tokio::test]
    async fn test_without_reorder_keeps_playlist_order() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let report = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), false))
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["c", "a", "b"]);
        assert_eq!(ledger_lines(temp_dir.path()), vec!["c", "a", "b"]);
        assert!(temp_dir
            .path()
            .join("Season 1")
            .join("S01E01 Newest.mp4")
            .exists());
    }

    #[tokio::test]
    async fn test_numbering_continues_after_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let season = temp_dir.path().join("Season 1");
        fs::create_dir_all(&season).unwrap();
        fs::write(season.join("S01E05 Foo.mp4"), b"old").unwrap();
        let h = harness(
            FakeProvider {
                items: vec![item("new", "Fresh", at(2022, 5, 5))],
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        h.archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap();

        assert!(season.join("S01E06 Fresh.mp4").exists());
        assert!(season.join("S01E06 Fresh.en.vtt").exists());
        assert!(season.join("S01E06 Fresh.nfo").exists());
    }

    #[tokio::test]
    async fn test_caption_failure_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: vec![item("a", "Only", at(2020, 1, 1))],
                failing_languages: vec!["de".to_string()],
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let report = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["a"]);
        assert_eq!(report.skipped_captions.len(), 1);
        assert_eq!(report.skipped_captions[0].language, "de");
        assert_eq!(
            *h.observer.skipped.lock().unwrap(),
            vec![("a".to_string(), "de".to_string())]
        );

        let season = temp_dir.path().join("Season 1");
        assert!(season.join("S01E01 Only.en.vtt").exists());
        assert!(!season.join("S01E01 Only.de.vtt").exists());
        // Auto-generated tracks are never fetched.
        assert!(!season.join("S01E01 Only.fr.vtt").exists());
        assert_eq!(ledger_lines(temp_dir.path()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_encoder_failure_stops_run_and_leaves_item_unledgered() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder {
                fail_on: Some("b".to_string()),
                ..Default::default()
            },
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap_err();

        assert!(err.is_item_fatal());
        assert!(matches!(err, ArchiveError::Encode { ref id, .. } if id == "b"));
        assert_eq!(ledger_lines(temp_dir.path()), vec!["a"]);
        assert_eq!(*h.observer.finished.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_item_is_retried_under_the_same_ordinal() {
        let temp_dir = TempDir::new().unwrap();
        let failing = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder {
                fail_on: Some("b".to_string()),
                ..Default::default()
            },
            RecordingObserver::default(),
        );
        let request = playlist_request(temp_dir.path(), true);
        assert!(failing.archiver.archive_playlist(&request).await.is_err());

        let season = temp_dir.path().join("Season 1");
        let mut leftovers: Vec<String> = fs::read_dir(&season)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with("S01E01 "))
            .collect();
        leftovers.sort();
        assert!(leftovers.is_empty(), "failed item left files: {:?}", leftovers);

        let healthy = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );
        let report = healthy.archiver.archive_playlist(&request).await.unwrap();

        assert_eq!(report.processed, vec!["b", "c"]);
        assert!(season.join("S01E02 Middle.mp4").exists());
        assert!(season.join("S01E02 Middle.en.vtt").exists());
        assert!(season.join("S01E03 Newest.mp4").exists());
        assert!(!season.join("S01E04 Newest.mp4").exists());
        assert_eq!(ledger_lines(temp_dir.path()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_captions_are_fetched_after_mux_completes() {
        let temp_dir = TempDir::new().unwrap();
        let events = EventLog::default();
        let h = harness(
            FakeProvider {
                items: vec![item("a", "Only", at(2020, 1, 1))],
                events: events.clone(),
                ..Default::default()
            },
            FakeEncoder {
                events: events.clone(),
                ..Default::default()
            },
            RecordingObserver::default(),
        );

        h.archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap();

        let events = events.lock().unwrap().clone();
        assert!(position(&events, "mux_end") < position(&events, "caption_list"));
        assert!(position(&events, "mux_end") < position(&events, "caption_download"));
    }

    #[tokio::test]
    async fn test_failed_encode_fetches_no_captions() {
        let temp_dir = TempDir::new().unwrap();
        let events = EventLog::default();
        let h = harness(
            FakeProvider {
                items: vec![item("a", "Only", at(2020, 1, 1))],
                events: events.clone(),
                ..Default::default()
            },
            FakeEncoder {
                fail_on: Some("a".to_string()),
                events: events.clone(),
                ..Default::default()
            },
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Encode { .. }));
        assert_eq!(*events.lock().unwrap(), vec!["mux_start", "mux_failed"]);
        let season = temp_dir.path().join("Season 1");
        assert_eq!(fs::read_dir(&season).unwrap().count(), 0);
        assert!(ledger_lines(temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_ledger_write_failure_is_run_fatal() {
        let temp_dir = TempDir::new().unwrap();
        // A line break cannot be recorded as a ledger line.
        let h = harness(
            FakeProvider {
                items: vec![item("bad\nid", "Broken", at(2020, 1, 1))],
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Ledger(_)));
        assert!(!err.is_item_fatal());
        assert!(temp_dir
            .path()
            .join("Season 1")
            .join("S01E01 Broken.mp4")
            .exists());
        assert!(h.observer.finished.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_ledger_is_run_fatal() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Ledger(_)));
        assert!(!err.is_item_fatal());
        assert!(h.encoder.muxed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_item_asks_for_poster_before_download() {
        let temp_dir = TempDir::new().unwrap();
        let events = EventLog::default();
        let h = harness(
            FakeProvider {
                items: vec![item("solo", "Keynote", at(2023, 9, 12))],
                ..Default::default()
            },
            FakeEncoder {
                events: events.clone(),
                ..Default::default()
            },
            RecordingObserver {
                events: events.clone(),
                ..Default::default()
            },
        );

        h.archiver
            .archive_item(&ItemRequest {
                item_id: "solo".to_string(),
                target_dir: temp_dir.path().to_path_buf(),
            })
            .await
            .unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(events, vec!["poster", "mux_start", "mux_end"]);
        assert_eq!(*h.observer.poster_requests.lock().unwrap(), vec!["Keynote"]);
    }

    #[tokio::test]
    async fn test_single_item_bad_poster_fails_before_download() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.png");
        let h = harness(
            FakeProvider {
                items: vec![item("solo", "Keynote", at(2023, 9, 12))],
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver {
                poster: Some(missing.to_string_lossy().into_owned()),
                ..Default::default()
            },
        );

        let err = h
            .archiver
            .archive_item(&ItemRequest {
                item_id: "solo".to_string(),
                target_dir: temp_dir.path().to_path_buf(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::ItemMetadata { ref id, .. } if id == "solo"));
        assert!(h.encoder.muxed.lock().unwrap().is_empty());
        assert!(!temp_dir.path().join("Keynote.mp4").exists());
    }

    #[tokio::test]
    async fn test_listing_failure_is_run_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                fail_listing: true,
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_playlist(&playlist_request(temp_dir.path(), true))
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Provider(_)));
        assert!(!err.is_item_fatal());
        assert!(!temp_dir.path().join(SHOW_NFO_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_show_metadata_written_once_with_earliest_date() {
        let temp_dir = TempDir::new().unwrap();
        let poster_dir = TempDir::new().unwrap();
        let poster = poster_dir.path().join("art.png");
        fs::write(&poster, b"png").unwrap();
        let h = harness(
            FakeProvider {
                items: out_of_order_items(),
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver {
                poster: Some(poster.to_string_lossy().into_owned()),
                ..Default::default()
            },
        );
        let request = playlist_request(temp_dir.path(), false);

        h.archiver.archive_playlist(&request).await.unwrap();
        h.archiver.archive_playlist(&request).await.unwrap();

        let show = fs::read_to_string(temp_dir.path().join(SHOW_NFO_FILE_NAME)).unwrap();
        assert!(show.contains("<title>My Channel</title>"));
        assert!(show.contains("<plot/>"));
        assert!(show.contains("<premiered>2019-01-01</premiered>"));
        assert_eq!(fs::read(temp_dir.path().join("folder.png")).unwrap(), b"png");
        assert_eq!(*h.observer.poster_requests.lock().unwrap(), vec!["My Channel"]);
    }

    #[tokio::test]
    async fn test_single_item_ignores_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider {
                items: vec![item("solo", "Keynote: Part 1?", at(2023, 9, 12))],
                ..Default::default()
            },
            FakeEncoder::default(),
            RecordingObserver::default(),
        );
        let request = ItemRequest {
            item_id: "solo".to_string(),
            target_dir: temp_dir.path().to_path_buf(),
        };

        h.archiver.archive_item(&request).await.unwrap();
        let report = h.archiver.archive_item(&request).await.unwrap();

        assert_eq!(report.processed, vec!["solo"]);
        assert_eq!(h.encoder.muxed.lock().unwrap().len(), 2);
        assert!(!temp_dir.path().join(LEDGER_FILE_NAME).exists());
        assert!(temp_dir.path().join("Keynote Part 1.mp4").exists());
        assert!(temp_dir.path().join("Keynote Part 1.en.vtt").exists());
        let movie = fs::read_to_string(temp_dir.path().join("Keynote Part 1.nfo")).unwrap();
        assert!(movie.contains("<releasedate>2023-09-12</releasedate>"));
    }

    #[tokio::test]
    async fn test_unknown_single_item_is_provider_error() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(
            FakeProvider::default(),
            FakeEncoder::default(),
            RecordingObserver::default(),
        );

        let err = h
            .archiver
            .archive_item(&ItemRequest {
                item_id: "missing".to_string(),
                target_dir: temp_dir.path().to_path_buf(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Provider(ProviderError::NotFound(_))));
    }

    #[test]
    fn test_select_pending_orders_undated_last() {
        let items = vec![
            item("x", "Undated", None),
            item("b", "B", at(2020, 1, 1)),
            item("a", "A", at(2019, 1, 1)),
        ];

        let ids: Vec<String> = select_pending(items, &HashSet::new(), true)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "x"]);
    }

    #[test]
    fn test_select_pending_drops_seen_and_duplicates() {
        let items = vec![
            item("a", "A", at(2019, 1, 1)),
            item("b", "B", at(2020, 1, 1)),
            item("a", "A again", at(2018, 1, 1)),
            item("c", "C", at(2021, 1, 1)),
        ];
        let seen: HashSet<String> = ["b".to_string()].into_iter().collect();

        let pending = select_pending(items, &seen, true);

        let ids: Vec<&str> = pending.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(pending[0].title, "A");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Plain title", "id"), "Plain title");
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f\"g<h>i|j", "id"), "abcdefghij");
        assert_eq!(sanitize_file_name("Trailing dots... ", "id"), "Trailing dots");
        assert_eq!(sanitize_file_name("tab\there", "id"), "tabhere");
        assert_eq!(sanitize_file_name("???", "dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(sanitize_file_name("Übersicht 日本", "id"), "Übersicht 日本");
    }

    #[test]
    fn test_episode_base_name() {
        assert_eq!(episode_base_name(1, 6, "Fresh", "id"), "S01E06 Fresh");
        assert_eq!(episode_base_name(2, 123, "A/B", "id"), "S02E123 AB");
    }

    #[test]
    fn test_options_from_config() {
        let config = ArchiveConfig {
            container: "mkv".to_string(),
            caption_languages: vec!["de".to_string()],
            ..ArchiveConfig::default()
        };
        let options = ArchiveOptions::from(&config);
        assert_eq!(options.container, "mkv");
        assert_eq!(options.caption_languages, vec!["de"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_select_pending_is_unique_and_unseen(
            listing in proptest::collection::vec(("[a-e]", proptest::option::of(0i64..1_000_000)), 0..20),
            seen in proptest::collection::hash_set("[a-e]", 0..3),
            reorder in any::<bool>(),
        ) {
            let items: Vec<Item> = listing
                .iter()
                .map(|(id, ts)| item(id, id, ts.and_then(|t| DateTime::from_timestamp(t, 0))))
                .collect();

            let pending = select_pending(items, &seen, reorder);

            let mut ids = HashSet::new();
            for item in &pending {
                prop_assert!(!seen.contains(&item.id));
                prop_assert!(ids.insert(item.id.clone()));
            }
            if reorder {
                let dated: Vec<_> = pending.iter().map(|i| (i.uploaded_at.is_none(), i.uploaded_at)).collect();
                prop_assert!(dated.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
