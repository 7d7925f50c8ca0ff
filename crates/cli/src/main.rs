//! CLI entry point for tubeshelf
//!
//! Parses command line arguments, makes sure ffmpeg is available and runs a
//! single archival job. Logs go to stderr; progress and prompts go to stdout.

use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubeshelf::{
    ArchiveObserver, ArchiveOptions, Archiver, Bootstrapper, ConcurrentProgress, Config,
    FfmpegEncoder, Item, ItemRequest, PlaylistRequest, ProgressSink, ProviderError,
    YtDlpProvider,
};

/// tubeshelf - Archive playlists and videos into a media-center library
#[derive(Parser, Debug)]
#[command(name = "tubeshelf")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a configuration file (tubeshelf.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use this ffmpeg binary instead of the bootstrapped one
    #[arg(long, global = true)]
    ffmpeg_path: Option<PathBuf>,

    /// Poster path or URL; skips the interactive prompt
    #[arg(long, global = true)]
    poster: Option<String>,

    /// Never download ffmpeg, even when it is missing
    #[arg(long, global = true, default_value = "false")]
    skip_bootstrap: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Mode {
    /// Archive every new item of a playlist as episodes of a season
    Playlist {
        /// Playlist id or URL
        #[arg(long)]
        id: String,

        /// Show directory receiving the season folder
        #[arg(long)]
        download_folder: PathBuf,

        /// Season number (defaults to the configured season)
        #[arg(long)]
        season: Option<u32>,

        /// Keep playlist order instead of sorting by upload date
        #[arg(long, default_value = "false")]
        do_not_reorder: bool,
    },
    /// Archive a single video as a movie
    Video {
        /// Video id or URL
        #[arg(long)]
        id: String,

        /// Directory receiving the movie files
        #[arg(long)]
        download_folder: PathBuf,
    },
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Progress line for one item, e.g. `  42.00% Downloading abc 3 Title`.
fn progress_line(fraction: f64, label: &str) -> String {
    format!("{:>6.2}% Downloading {}", fraction * 100.0, label)
}

fn item_label(item: &Item, ordinal: Option<u32>) -> String {
    match ordinal {
        Some(ordinal) => format!("{} {} {}", item.id, ordinal, item.title),
        None => format!("{} {}", item.id, item.title),
    }
}

/// Turns a prompt answer into a poster source; blank means none.
fn poster_answer(answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        None
    } else {
        Some(answer.to_string())
    }
}

/// Blocks on one line of `input`.
fn read_answer(input: &mut impl BufRead) -> io::Result<String> {
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer)
}

/// Renders a run on the terminal.
struct TerminalObserver {
    /// Poster given on the command line, used instead of prompting
    poster: Option<String>,
}

impl ArchiveObserver for TerminalObserver {
    fn poster_source(&self, title: &str) -> Option<String> {
        if let Some(poster) = &self.poster {
            return poster_answer(poster);
        }

        println!("{}", title);
        print!("Input poster path or URL: ");
        let _ = io::stdout().flush();

        match tokio::task::block_in_place(|| read_answer(&mut io::stdin().lock())) {
            Ok(answer) => poster_answer(&answer),
            Err(e) => {
                warn!(error = %e, "Could not read poster answer");
                None
            }
        }
    }

    fn progress_sink(&self, item: &Item, ordinal: Option<u32>) -> Box<dyn ProgressSink> {
        let label = item_label(item, ordinal);
        print!("\r{}", progress_line(0.0, &label));
        let _ = io::stdout().flush();

        Box::new(ConcurrentProgress::new(move |fraction: f64| {
            print!("\r{}", progress_line(fraction, &label));
            let _ = io::stdout().flush();
        }))
    }

    fn caption_skipped(&self, item: &Item, language: &str, error: &ProviderError) {
        println!();
        println!("Skipped {} captions for {}: {}", language, item.id, error);
    }

    fn item_finished(&self, _item: &Item) {
        println!();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, tubeshelf::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::from_env()),
    }
}

/// Locates ffmpeg, downloading it unless bootstrapping is disabled or no
/// archive is configured. Without an archive, a bare binary name is resolved
/// through PATH when ffmpeg is spawned.
async fn prepare_ffmpeg(args: &Args, config: &Config) -> Result<PathBuf, tubeshelf::BootstrapError> {
    let override_path = args.ffmpeg_path.clone().or_else(|| config.encoder.path.clone());

    let Some(archive_url) = config.encoder.archive_url.as_deref() else {
        let path = override_path.unwrap_or_else(|| PathBuf::from(&config.encoder.binary_name));
        info!(ffmpeg = %path.display(), "No ffmpeg archive configured, skipping bootstrap");
        return Ok(path);
    };

    let mut bootstrapper = Bootstrapper::new(archive_url, &config.encoder.binary_name)?;
    if let Some(path) = override_path {
        bootstrapper = bootstrapper.with_target(path);
    }

    if args.skip_bootstrap {
        warn!("Skipping ffmpeg bootstrap (--skip-bootstrap enabled)");
        return Ok(bootstrapper.target().to_path_buf());
    }
    bootstrapper.ensure_exists().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let mut config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Mode::Playlist { season: Some(season), .. } = &args.mode {
        config.archive.season = *season;
    }

    let ffmpeg = match prepare_ffmpeg(&args, &config).await {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Failed to prepare ffmpeg: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(ffmpeg = %ffmpeg.display(), "Using ffmpeg");

    let client = reqwest::Client::new();
    let archiver = Archiver::new(
        Arc::new(YtDlpProvider::new(&config.provider.ytdlp_path, client.clone())),
        Arc::new(FfmpegEncoder::new(ffmpeg)),
        ArchiveOptions::from(&config.archive),
    )
    .with_metadata(tubeshelf::LocalMetadata::new(client))
    .with_observer(Arc::new(TerminalObserver {
        poster: args.poster.clone(),
    }));

    let result = match args.mode {
        Mode::Playlist {
            id,
            download_folder,
            do_not_reorder,
            ..
        } => {
            archiver
                .archive_playlist(&PlaylistRequest {
                    playlist_id: id,
                    target_dir: download_folder,
                    season: config.archive.season,
                    reorder: config.archive.reorder && !do_not_reorder,
                })
                .await
        }
        Mode::Video {
            id,
            download_folder,
        } => {
            archiver
                .archive_item(&ItemRequest {
                    item_id: id,
                    target_dir: download_folder,
                })
                .await
        }
    };

    match result {
        Ok(report) => {
            println!("Archived {} item(s)", report.processed.len());
            if !report.skipped_captions.is_empty() {
                println!(
                    "Skipped {} caption track(s)",
                    report.skipped_captions.len()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!();
            eprintln!("Archive failed: {}", e);
            if e.is_item_fatal() {
                eprintln!("The item was not recorded and will be retried on the next run.");
            }
            ExitCode::FAILURE
        }
    }
}
