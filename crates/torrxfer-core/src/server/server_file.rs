//! Server-side file records.
//!
//! A [`ServerFile`] describes one destination file: where it lives beneath
//! the media root, how large the client declared it, and how much of it is
//! on disk. Records are persisted in the progress store under the full-file
//! content hash as a single-line `*?*` text record, which is what survives
//! a server restart and makes resumes possible.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::protocol::FileInfo;

/// Field separator of the text record format.
const RECORD_DELIMITER: &str = "*?*";

/// The server's view of one destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFile {
    /// Absolute destination path
    pub full_path: PathBuf,
    /// Sub-path preserved beneath the media root
    pub media_prefix: String,
    /// Size declared by the client
    pub size: u64,
    /// Bytes currently on disk
    pub current_size: u64,
    /// When the record was first created
    pub created_time: Option<DateTime<Utc>>,
    /// Last modification of the destination file
    pub modified_time: Option<DateTime<Utc>>,
}

impl ServerFile {
    /// Create a record for a fresh destination with nothing on disk.
    #[must_use]
    pub fn new(full_path: PathBuf, media_prefix: String, size: u64) -> Self {
        let now = Utc::now();
        Self {
            full_path,
            media_prefix,
            size,
            current_size: 0,
            created_time: Some(now),
            modified_time: Some(now),
        }
    }

    /// Serialize to the single-line `*?*` text record.
    #[must_use]
    pub fn to_record(&self) -> String {
        [
            self.full_path.display().to_string(),
            self.media_prefix.clone(),
            self.size.to_string(),
            self.current_size.to_string(),
            time_field(self.created_time),
            time_field(self.modified_time),
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
            full_path: PathBuf::from(tokens[0].trim()),
            media_prefix: tokens[1].trim().to_string(),
            size: tokens[2]
                .trim()
                .parse()
                .map_err(|e| Error::RecordParse(format!("bad size field: {e}")))?,
            current_size: tokens[3]
                .trim()
                .parse()
                .map_err(|e| Error::RecordParse(format!("bad current size field: {e}")))?,
            created_time: parse_time_field(tokens[4])?,
            modified_time: parse_time_field(tokens[5])?,
        })
    }

    /// Build the wire response for a query, with `data_hash` set to the
    /// hash of the current on-disk partial (empty for fresh files).
    #[must_use]
    pub fn to_file_info(&self, data_hash: String) -> FileInfo {
        FileInfo {
            name: self
                .full_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            data_hash,
            media_directory: self.media_prefix.clone(),
            created_time: self.created_time,
            modified_time: self.modified_time,
            size: self.size,
            size_on_disk: self.current_size,
        }
    }

    /// Destination path of this record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.full_path
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> ServerFile {
        ServerFile {
            full_path: PathBuf::from("/srv/media/tv/show/ep1.mp4"),
            media_prefix: "tv/show".to_string(),
            size: 734_003_200,
            current_size: 3_145_728,
            created_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            modified_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()),
        }
    }

    #[test]
    fn record_roundtrip() {
        let file = sample();
        let parsed = ServerFile::from_record(&file.to_record()).expect("parse");
        assert_eq!(parsed, file);
    }

    #[test]
    fn record_roundtrip_without_times() {
        let file = ServerFile {
            created_time: None,
            modified_time: None,
            ..sample()
        };
        let parsed = ServerFile::from_record(&file.to_record()).expect("parse");
        assert_eq!(parsed, file);
    }

    #[test]
    fn record_rejects_truncated_input() {
        assert!(ServerFile::from_record("only*?*four*?*fields*?*here").is_err());
    }

    #[test]
    fn wire_response_mirrors_record() {
        let file = sample();
        let info = file.to_file_info("deadbeef".to_string());
        assert_eq!(info.name, "ep1.mp4");
        assert_eq!(info.media_directory, "tv/show");
        assert_eq!(info.size, file.size);
        assert_eq!(info.size_on_disk, file.current_size);
        assert_eq!(info.data_hash, "deadbeef");
    }
}
