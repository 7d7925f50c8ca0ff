//! Bootstrap of the external ffmpeg binary.
//!
//! The encoder binary is expected at a well-known location. When it is
//! missing, a release archive is downloaded once and the binary is extracted
//! from it. When it is present, nothing touches the network.

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;
use zip::ZipArchive;

/// Directory under the system temp dir holding downloaded helper binaries.
pub const HELPERS_DIR_NAME: &str = "MediaServerHelpers";

const FALLBACK_ARCHIVE_NAME: &str = "download.zip";

/// Error type for bootstrap operations
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Archive URL or redirect target is not a valid URL
    #[error("Invalid archive URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Download failed or returned an error status
    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A redirect response carried no usable Location header
    #[error("Redirect from {0} has no Location header")]
    MissingLocation(String),

    /// More than one redirect was needed
    #[error("Too many redirects while downloading {0}")]
    TooManyRedirects(String),

    /// The archive could not be read
    #[error("Invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// No archive entry carries the binary name
    #[error("Archive contains no entry named {0}")]
    BinaryNotFound(String),

    /// Several archive entries carry the binary name
    #[error("Archive contains {count} entries named {name}")]
    AmbiguousBinary { name: String, count: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Whether the binary exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryState {
    Absent,
    Present,
}

/// Default location of a helper binary: `<tmp>/MediaServerHelpers/<name>`.
pub fn default_binary_path(binary_name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(HELPERS_DIR_NAME)
        .join(binary_name)
}

/// Makes sure a helper binary exists, downloading it when needed.
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    target: PathBuf,
    archive_url: String,
    binary_name: String,
    client: reqwest::Client,
}

impl Bootstrapper {
    /// Bootstrapper for `binary_name` at its default location.
    ///
    /// # Arguments
    /// * `archive_url` - Zip archive containing the binary
    /// * `binary_name` - File name of the archive entry to extract
    ///
    /// # Returns
    /// A bootstrapper whose HTTP client follows no redirects on its own
    pub fn new(archive_url: &str, binary_name: &str) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            target: default_binary_path(binary_name),
            archive_url: archive_url.to_string(),
            binary_name: binary_name.to_string(),
            client,
        })
    }

    /// Use a custom binary path instead of the default location.
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    /// Replace the HTTP client. It should not follow redirects itself.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Path where the binary is expected.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Current state of the binary.
    pub fn state(&self) -> BinaryState {
        if self.target.exists() {
            BinaryState::Present
        } else {
            BinaryState::Absent
        }
    }

    /// Returns the binary path, downloading and extracting it first if absent.
    pub async fn ensure_exists(&self) -> Result<PathBuf, BootstrapError> {
        if self.state() == BinaryState::Present {
            debug!(path = %self.target.display(), "Binary already present");
            return Ok(self.target.clone());
        }

        let download_dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&download_dir).await?;

        let result = self.download_and_extract(&download_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&download_dir).await {
            debug!(dir = %download_dir.display(), error = %e, "Failed to remove download directory");
        }

        result?;
        info!(path = %self.target.display(), "Binary installed");
        Ok(self.target.clone())
    }

    async fn download_and_extract(&self, download_dir: &Path) -> Result<(), BootstrapError> {
        let url = Url::parse(&self.archive_url)?;
        let archive_path = download_dir.join(archive_file_name(&url));

        info!(url = %url, "Downloading {}", self.binary_name);
        self.download(url, &archive_path).await?;

        let binary_name = self.binary_name.clone();
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || extract_binary(&archive_path, &binary_name, &target))
            .await
            .map_err(io::Error::other)?
    }

    async fn download(&self, url: Url, destination: &Path) -> Result<(), BootstrapError> {
        let mut response = self.client.get(url.clone()).send().await?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| BootstrapError::MissingLocation(url.to_string()))?;
            let next = url.join(location)?;
            debug!(from = %url, to = %next, "Following redirect");
            response = self.client.get(next).send().await?;

            if response.status().is_redirection() {
                return Err(BootstrapError::TooManyRedirects(url.to_string()));
            }
        }

        let mut response = response.error_for_status()?;
        let mut file = tokio::fs::File::create(destination).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Last path segment of the archive URL, used as the download file name.
fn archive_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_ARCHIVE_NAME)
        .to_string()
}

/// Final component of an archive entry name, accepting either separator.
fn entry_file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Extracts the single file entry named `binary_name` from a zip archive.
///
/// The entry is written next to `target` first and renamed into place, so an
/// interrupted extraction never leaves a truncated binary at `target`.
///
/// # Arguments
/// * `archive` - Path of the zip archive
/// * `binary_name` - File name the entry must carry, in any directory
/// * `target` - Destination path; parent directories are created
///
/// # Errors
/// Fails when no entry or more than one entry carries the name.
pub fn extract_binary(archive: &Path, binary_name: &str, target: &Path) -> Result<(), BootstrapError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    let mut matches = Vec::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        if entry.is_file() && entry_file_name(entry.name()) == binary_name {
            matches.push(index);
        }
    }

    let index = match matches.as_slice() {
        [index] => *index,
        [] => return Err(BootstrapError::BinaryNotFound(binary_name.to_string())),
        _ => {
            return Err(BootstrapError::AmbiguousBinary {
                name: binary_name.to_string(),
                count: matches.len(),
            })
        }
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = target.with_extension("part");
    {
        let mut entry = zip.by_index(index)?;
        let mut output = File::create(&partial)?;
        io::copy(&mut entry, &mut output)?;
        output.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&partial, fs::Permissions::from_mode(0o755))?;
    }

    fs::rename(&partial, target)?;
    Ok(())
}
