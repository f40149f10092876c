//! Log positions.

use crate::constants::LOG_FILE_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A position in the log: (file number, byte offset, LSN).
///
/// Anchors are totally ordered by (file number, offset); the LSN is metadata
/// carried along for consumers and takes no part in the ordering, so the type
/// deliberately does not implement `Ord`. Use [`LogAnchor::position_cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAnchor {
    /// Number of the log file this anchor points into.
    pub log_file_number: i64,
    /// Byte offset within that file.
    pub log_file_offset: i64,
    /// LSN of the record at that offset, or [`LogAnchor::UNKNOWN_LSN`].
    pub lsn: i64,
}

impl LogAnchor {
    /// Smallest valid user log file number.
    pub const MIN_LOG_NUMBER: i64 = 1;

    /// Smallest valid offset within a log file (just past the file header).
    pub const MIN_LOG_OFFSET: i64 = LOG_FILE_HEADER_SIZE as i64;

    /// Sentinel meaning the LSN is not known at this site.
    pub const UNKNOWN_LSN: i64 = i64::MIN;

    /// Creates a new anchor.
    pub fn new(log_file_number: i64, log_file_offset: i64, lsn: i64) -> Self {
        Self {
            log_file_number,
            log_file_offset,
            lsn,
        }
    }

    /// The very first writable position in a fresh log.
    pub fn start_of_log() -> Self {
        Self::new(
            Self::MIN_LOG_NUMBER,
            Self::MIN_LOG_OFFSET,
            Self::UNKNOWN_LSN,
        )
    }

    /// Compares log positions lexicographically over (file number, offset).
    pub fn position_cmp(&self, other: &LogAnchor) -> Ordering {
        self.log_file_number
            .cmp(&other.log_file_number)
            .then(self.log_file_offset.cmp(&other.log_file_offset))
    }
}

impl std::fmt::Display for LogAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.log_file_number, self.log_file_offset)
    }
}
