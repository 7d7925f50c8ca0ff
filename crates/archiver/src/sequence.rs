//! Sequence numbering derived from the files already in a season directory.
//!
//! There is no counter file: the directory is the source of truth. The next
//! ordinal is always `max(existing) + 1`, so deleting or renaming earlier
//! episodes never causes an ordinal to be reused.

use regex::Regex;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// File name prefix for episodes of a season, e.g. `S01E`.
pub fn episode_prefix(season: u32) -> String {
    format!("S{:02}E", season)
}

/// Builds the matcher for `<prefix><digits>` at the start of a file name.
fn ordinal_regex(prefix: &str) -> io::Result<Regex> {
    Regex::new(&format!(r"^{}(\d+)", regex::escape(prefix)))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Extracts the ordinal following `prefix` from a file name.
///
/// Returns None when the name does not start with the prefix and a digit, or
/// when the digits do not fit in a `u32`.
pub fn parse_ordinal(file_name: &str, prefix: &str) -> Option<u32> {
    parse_with(&ordinal_regex(prefix).ok()?, file_name)
}

fn parse_with(regex: &Regex, file_name: &str) -> Option<u32> {
    regex
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

/// Highest ordinal among the immediate entries of `dir`, or 0 when none match.
///
/// Entries that do not match the prefix are ignored. Only an unreadable
/// directory is an error.
pub fn last_ordinal(dir: &Path, prefix: &str) -> io::Result<u32> {
    let regex = ordinal_regex(prefix)?;
    let mut max = 0;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(ordinal) = parse_with(&regex, name) {
            max = max.max(ordinal);
        }
    }

    Ok(max)
}

/// Ordinal to give the next item archived into `dir`.
pub fn next_ordinal(dir: &Path, prefix: &str) -> io::Result<u32> {
    Ok(last_ordinal(dir, prefix)?.saturating_add(1))
}
