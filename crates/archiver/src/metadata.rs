//! Media-center sidecar metadata and poster artwork.
//!
//! Every archived show, episode and movie gets an `.nfo` XML document next to
//! its media. Documents have a fixed shape: `title`, `plot`, then one date
//! element, with absent values rendered as empty elements rather than left
//! out. Show and movie records may also name a poster, which is copied from a
//! local path or fetched over HTTP.

use chrono::NaiveDate;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

/// File name of the show-level sidecar.
pub const SHOW_NFO_FILE_NAME: &str = "tvshow.nfo";

/// Stem of the show-level poster artifact.
pub const SHOW_POSTER_STEM: &str = "folder";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Error type for metadata operations
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Records must carry a title
    #[error("Metadata record has an empty title")]
    EmptyTitle,

    /// The XML document could not be produced
    #[error("Failed to render XML: {0}")]
    Xml(String),

    /// The poster could not be fetched
    #[error("Failed to fetch poster: {0}")]
    Http(#[from] reqwest::Error),

    /// A file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Show-level record, written once per target directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TvShow {
    pub title: String,
    pub plot: Option<String>,
    pub premiered: Option<NaiveDate>,
    /// Local path or remote URL of the show poster.
    pub poster: Option<String>,
}

/// Per-item record inside a season directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub title: String,
    pub plot: Option<String>,
    pub aired: Option<NaiveDate>,
}

/// Record for an item archived on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Movie {
    pub title: String,
    pub plot: Option<String>,
    pub release_date: Option<NaiveDate>,
    /// Local path or remote URL of the movie poster.
    pub poster: Option<String>,
}

impl TvShow {
    /// Render the `tvshow` document.
    pub fn to_nfo(&self) -> Result<String, MetadataError> {
        render_document(
            "tvshow",
            &self.title,
            self.plot.as_deref(),
            ("premiered", self.premiered),
        )
    }
}

impl Episode {
    /// Render the `episodedetails` document.
    pub fn to_nfo(&self) -> Result<String, MetadataError> {
        render_document(
            "episodedetails",
            &self.title,
            self.plot.as_deref(),
            ("aired", self.aired),
        )
    }
}

impl Movie {
    /// Render the `movie` document.
    pub fn to_nfo(&self) -> Result<String, MetadataError> {
        render_document(
            "movie",
            &self.title,
            self.plot.as_deref(),
            ("releasedate", self.release_date),
        )
    }
}

fn xml_err(e: impl std::fmt::Display) -> MetadataError {
    MetadataError::Xml(e.to_string())
}

/// Writes `<name>text</name>`, or `<name/>` when there is no value.
fn write_optional(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    value: Option<&str>,
) -> Result<(), MetadataError> {
    match value {
        Some(text) => {
            writer
                .create_element(name)
                .write_text_content(BytesText::new(text))
                .map_err(xml_err)?;
        }
        None => {
            writer
                .write_event(Event::Empty(BytesStart::new(name)))
                .map_err(xml_err)?;
        }
    }
    Ok(())
}

fn render_document(
    root: &str,
    title: &str,
    plot: Option<&str>,
    (date_element, date): (&str, Option<NaiveDate>),
) -> Result<String, MetadataError> {
    if title.trim().is_empty() {
        return Err(MetadataError::EmptyTitle);
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new(root)))
        .map_err(xml_err)?;

    write_optional(&mut writer, "title", Some(title))?;
    write_optional(&mut writer, "plot", plot)?;
    let date = date.map(|d| d.format(DATE_FORMAT).to_string());
    write_optional(&mut writer, date_element, date.as_deref())?;

    writer
        .write_event(Event::End(BytesEnd::new(root)))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

/// Where a poster comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum PosterSource {
    /// Fetched with a single HTTP GET
    Remote(Url),
    /// Copied byte-for-byte
    Local(PathBuf),
}

impl PosterSource {
    /// Classify a user supplied poster location.
    ///
    /// Blank input yields None. An absolute URI with a scheme other than
    /// `file` is remote; single-letter schemes are Windows drive letters and
    /// therefore local paths. Everything else is a local path.
    pub fn parse(source: &str) -> Option<Self> {
        let source = source.trim();
        if source.is_empty() {
            return None;
        }

        let local = || Some(PosterSource::Local(PathBuf::from(source)));
        match Url::parse(source) {
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Some(PosterSource::Local(path)),
                Err(()) => local(),
            },
            Ok(url) if url.scheme().len() > 1 => Some(PosterSource::Remote(url)),
            _ => local(),
        }
    }

    /// Extension of the source, taken from the URL path for remote sources.
    pub fn extension(&self) -> Option<String> {
        let ext = match self {
            PosterSource::Remote(url) => Path::new(url.path()).extension(),
            PosterSource::Local(path) => path.extension(),
        };
        ext.and_then(|e| e.to_str()).map(String::from)
    }

    /// File name of the artifact for the given stem, e.g. `folder.jpg`.
    pub fn artifact_name(&self, stem: &str) -> String {
        match self.extension() {
            Some(ext) => format!("{}.{}", stem, ext),
            None => stem.to_string(),
        }
    }
}

/// Writes sidecars and posters into local directories.
#[derive(Debug, Clone, Default)]
pub struct LocalMetadata {
    client: reqwest::Client,
}

impl LocalMetadata {
    /// Writer fetching remote posters with `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Writes `tvshow.nfo` into `folder`, replacing any previous file.
    pub async fn write_show(&self, show: &TvShow, folder: &Path) -> Result<PathBuf, MetadataError> {
        write_file(folder.join(SHOW_NFO_FILE_NAME), show.to_nfo()?).await
    }

    /// Writes `<base>.nfo` for an episode into `folder`.
    pub async fn write_episode(
        &self,
        episode: &Episode,
        folder: &Path,
        base: &str,
    ) -> Result<PathBuf, MetadataError> {
        write_file(nfo_path(folder, base), episode.to_nfo()?).await
    }

    /// Writes `<base>.nfo` for a movie into `folder`.
    pub async fn write_movie(
        &self,
        movie: &Movie,
        folder: &Path,
        base: &str,
    ) -> Result<PathBuf, MetadataError> {
        write_file(nfo_path(folder, base), movie.to_nfo()?).await
    }

    /// Writes the show sidecar, then its poster as `folder.<ext>`.
    pub async fn save_show(&self, show: &TvShow, folder: &Path) -> Result<(), MetadataError> {
        self.write_show(show, folder).await?;
        self.resolve_poster(show.poster.as_deref(), folder, SHOW_POSTER_STEM)
            .await?;
        Ok(())
    }

    /// Writes the movie sidecar, then its poster as `<base>.<ext>`.
    pub async fn save_movie(
        &self,
        movie: &Movie,
        folder: &Path,
        base: &str,
    ) -> Result<(), MetadataError> {
        self.write_movie(movie, folder, base).await?;
        self.resolve_poster(movie.poster.as_deref(), folder, base)
            .await?;
        Ok(())
    }

    /// Materialises a poster next to the sidecar as `<stem>.<ext>`.
    ///
    /// # Arguments
    /// * `source` - Local path, `file:` URI or remote URL; None or blank skips
    /// * `folder` - Directory receiving the artifact
    /// * `stem` - Artifact file name without extension
    ///
    /// # Returns
    /// The artifact path, or None when no source was given
    pub async fn resolve_poster(
        &self,
        source: Option<&str>,
        folder: &Path,
        stem: &str,
    ) -> Result<Option<PathBuf>, MetadataError> {
        let Some(source) = source.and_then(PosterSource::parse) else {
            return Ok(None);
        };
        let target = folder.join(source.artifact_name(stem));

        match &source {
            PosterSource::Remote(url) => {
                info!(url = %url, "Fetching poster");
                let mut response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await?
                    .error_for_status()?;
                let mut file = tokio::fs::File::create(&target).await?;
                while let Some(chunk) = response.chunk().await? {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
            }
            PosterSource::Local(path) => {
                debug!(path = %path.display(), "Copying poster");
                tokio::fs::copy(path, &target).await?;
            }
        }

        Ok(Some(target))
    }
}

fn nfo_path(folder: &Path, base: &str) -> PathBuf {
    folder.join(format!("{}.nfo", base))
}

async fn write_file(path: PathBuf, content: String) -> Result<PathBuf, MetadataError> {
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
