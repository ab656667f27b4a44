//! Client-side view of a watched file.
//!
//! A [`WatchedFile`] is built once per filesystem event and is immutable
//! from then on; the watcher replaces the whole value on every new write in
//! a burst. The `media_prefix` is the sub-path between the configured media
//! root and the file's directory, and is what the server preserves beneath
//! its own media root.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::fsutil;

/// Field separator of the text record format.
pub const RECORD_DELIMITER: &str = "*?*";

/// The client's immutable view of a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    /// Absolute canonical path
    pub path: PathBuf,
    /// Sub-path relative to the media root, empty when the file is not
    /// beneath it
    pub media_prefix: String,
    /// Size at watch time (bytes)
    pub size: u64,
    /// Last modification time
    pub modified_time: Option<DateTime<Utc>>,
    /// When the watcher first saw this burst
    pub watch_time: Option<DateTime<Utc>>,
    /// When a worker began the transfer attempt
    pub transfer_time: Option<DateTime<Utc>>,
}

impl WatchedFile {
    /// Build a watched file from a path and the configured media root.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved or stat'ed.
    pub fn from_path(path: &Path, media_root: &Path) -> Result<Self> {
        let path = fsutil::clean_path(path)?;
        let media_prefix = media_prefix_for(media_root, &path);
        let metadata = std::fs::metadata(&path)?;

        Ok(Self {
            path,
            media_prefix,
            size: metadata.len(),
            modified_time: metadata.modified().ok().map(DateTime::from),
            watch_time: None,
            transfer_time: None,
        })
    }

    /// Serialize to the single-line `*?*` text record.
    #[must_use]
    pub fn to_record(&self) -> String {
        [
            self.path.display().to_string(),
            self.media_prefix.clone(),
            self.size.to_string(),
            time_field(self.modified_time),
            time_field(self.watch_time),
            time_field(self.transfer_time),
        ]
        .join(RECORD_DELIMITER)
    }

    /// Parse a record produced by [`Self::to_record`].
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not have six fields or a field
    /// fails to parse.
    pub fn from_record(text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split(RECORD_DELIMITER).collect();
        if tokens.len() != 6 {
            return Err(Error::RecordParse(format!(
                "expected 6 fields, got {}",
                tokens.len()
            )));
        }

        Ok(Self {
            path: PathBuf::from(tokens[0].trim()),
            media_prefix: tokens[1].trim().to_string(),
            size: tokens[2]
                .trim()
                .parse()
                .map_err(|e| Error::RecordParse(format!("bad size field: {e}")))?,
            modified_time: parse_time_field(tokens[3])?,
            watch_time: parse_time_field(tokens[4])?,
            transfer_time: parse_time_field(tokens[5])?,
        })
    }
}

/// Derive the media prefix of `path` relative to `media_root`.
///
/// The prefix is the file's directory with the media root stripped; an empty
/// string when the directory is not beneath the root, or when the file sits
/// directly inside it.
#[must_use]
pub fn media_prefix_for(media_root: &Path, path: &Path) -> String {
    let Ok(root) = fsutil::clean_path(media_root) else {
        return String::new();
    };
    let Some(dir) = path.parent() else {
        return String::new();
    };
    match dir.strip_prefix(&root) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

fn time_field(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn parse_time_field(field: &str) -> Result<Option<DateTime<Utc>>> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(field)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| Error::RecordParse(format!("bad time field '{field}': {e}")))
}
