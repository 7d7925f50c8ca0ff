//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Release archive of the Windows ffmpeg build.
///
/// Its entries are `*/bin/ffmpeg.exe` and friends, so it is only a default
/// on Windows.
pub const DEFAULT_FFMPEG_ARCHIVE_URL: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Archive layout and pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    /// Season folder used for playlist items (default 1)
    #[serde(default = "default_season")]
    pub season: u32,
    /// Sort playlist items by upload date before processing (default true)
    #[serde(default = "default_reorder")]
    pub reorder: bool,
    /// Output container extension (default "mp4")
    #[serde(default = "default_container")]
    pub container: String,
    /// Caption languages to fetch; auto-generated tracks are never fetched
    #[serde(default = "default_caption_languages")]
    pub caption_languages: Vec<String>,
}

fn default_season() -> u32 {
    1
}

fn default_reorder() -> bool {
    true
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_caption_languages() -> Vec<String> {
    vec!["en".to_string()]
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            season: default_season(),
            reorder: default_reorder(),
            container: default_container(),
            caption_languages: default_caption_languages(),
        }
    }
}

/// Encoder binary location and bootstrap source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Custom ffmpeg path; the temp-directory cache is used when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Archive downloaded when the binary is missing. Without one, ffmpeg is
    /// looked up on PATH.
    #[serde(default = "default_archive_url")]
    pub archive_url: Option<String>,
    /// Name of the archive entry holding the binary
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
}

fn default_archive_url() -> Option<String> {
    if cfg!(windows) {
        Some(DEFAULT_FFMPEG_ARCHIVE_URL.to_string())
    } else {
        None
    }
}

/// Platform file name of the ffmpeg executable
pub fn default_binary_name() -> String {
    if cfg!(windows) {
        "ffmpeg.exe".to_string()
    } else {
        "ffmpeg".to_string()
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            path: None,
            archive_url: default_archive_url(),
            binary_name: default_binary_name(),
        }
    }
}

/// Media source settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// yt-dlp executable (looked up on PATH when relative)
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: PathBuf,
}

fn default_ytdlp_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TUBESHELF_SEASON -> archive.season
    /// - TUBESHELF_REORDER -> archive.reorder
    /// - TUBESHELF_CONTAINER -> archive.container
    /// - TUBESHELF_CAPTION_LANGUAGES -> archive.caption_languages (comma separated)
    /// - TUBESHELF_FFMPEG_PATH -> encoder.path
    /// - TUBESHELF_FFMPEG_ARCHIVE_URL -> encoder.archive_url
    /// - TUBESHELF_YTDLP_PATH -> provider.ytdlp_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TUBESHELF_SEASON") {
            if let Ok(season) = val.parse::<u32>() {
                self.archive.season = season;
            }
        }

        if let Ok(val) = env::var("TUBESHELF_REORDER") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.archive.reorder = true,
                "false" | "0" | "no" => self.archive.reorder = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("TUBESHELF_CONTAINER") {
            let container = val.trim().trim_start_matches('.');
            if !container.is_empty() {
                self.archive.container = container.to_string();
            }
        }

        if let Ok(val) = env::var("TUBESHELF_CAPTION_LANGUAGES") {
            self.archive.caption_languages = parse_language_list(&val);
        }

        if let Ok(val) = env::var("TUBESHELF_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.encoder.path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("TUBESHELF_FFMPEG_ARCHIVE_URL") {
            if !val.trim().is_empty() {
                self.encoder.archive_url = Some(val);
            }
        }

        if let Ok(val) = env::var("TUBESHELF_YTDLP_PATH") {
            if !val.trim().is_empty() {
                self.provider.ytdlp_path = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

/// Split a comma separated language list, dropping blanks.
pub fn parse_language_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .map(String::from)
        .collect()
}
