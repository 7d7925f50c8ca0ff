//! tubeshelf
//!
//! Incremental archival of playlists into media-center libraries: a ledger of
//! processed items, episode numbering recovered from disk, sidecar metadata,
//! and an ffmpeg bootstrap.

pub mod archive;
pub mod bootstrap;
pub mod encode;
pub mod ledger;
pub mod metadata;
pub mod progress;
pub mod provider;
pub mod sequence;

pub use archive::{
    episode_base_name, sanitize_file_name, season_dir_name, select_pending, ArchiveError,
    ArchiveObserver, ArchiveOptions, ArchiveReport, Archiver, ItemRequest, PlaylistRequest,
    SilentObserver, SkippedCaption,
};
pub use bootstrap::{default_binary_path, extract_binary, BinaryState, BootstrapError, Bootstrapper};
pub use encode::{build_mux_command, parse_progress_line, EncodeError, Encoder, FfmpegEncoder, MuxRequest};
pub use ledger::{ledger_path, Ledger, LEDGER_FILE_NAME};
pub use metadata::{Episode, LocalMetadata, MetadataError, Movie, PosterSource, TvShow};
pub use progress::{clamp_fraction, ConcurrentProgress, NoProgress, ProgressSink};
pub use provider::{
    best_audio, best_video, AudioVariant, CaptionTrack, Item, MediaProvider, Playlist,
    ProviderError, StreamSet, VideoVariant, YtDlpProvider,
};
pub use sequence::{episode_prefix, last_ordinal, next_ordinal, parse_ordinal};
pub use tubeshelf_config as config;
pub use tubeshelf_config::Config;
