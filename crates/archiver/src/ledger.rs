//! Ledger of already archived item ids.
//!
//! The ledger is a plain text file in the target directory holding one item id
//! per line. It is only ever appended to, and an id is appended only once the
//! whole item (media, captions, metadata) has been written. Absence from the
//! ledger is the only signal that an item still needs processing.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name of the ledger inside a target directory.
pub const LEDGER_FILE_NAME: &str = ".tubeshelf.SeenItems.txt";

/// Constructs the ledger path for a target directory.
///
/// For example: `/media/Show` -> `/media/Show/.tubeshelf.SeenItems.txt`
pub fn ledger_path(target_dir: &Path) -> PathBuf {
    target_dir.join(LEDGER_FILE_NAME)
}

/// Append-only record of processed item ids.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Ledger scoped to the given target directory.
    pub fn for_directory(target_dir: &Path) -> Self {
        Self {
            path: ledger_path(target_dir),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every recorded id.
    ///
    /// A missing ledger file yields an empty set. Blank lines and trailing
    /// carriage returns are ignored.
    pub fn ids(&self) -> io::Result<HashSet<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Returns true iff `id` appears as an exact line in the ledger.
    pub fn contains(&self, id: &str) -> io::Result<bool> {
        Ok(self.ids()?.contains(id))
    }

    /// Appends `id` and a line terminator, creating the file if needed.
    ///
    /// The write is flushed and synced before returning so that a later run
    /// never observes a half-written entry for an item it considers done.
    pub fn append(&self, id: &str) -> io::Result<()> {
        if id.is_empty() || id.contains(['\n', '\r']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid ledger id: {:?}", id),
            ));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{}\n", id).as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}
