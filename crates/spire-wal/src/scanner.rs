//! Forward log scan with structural validation.

use crate::anchor::LogAnchor;
use crate::constants::{
    LOG_FILE_HEADER_MAGIC, LOG_FILE_HEADER_SIZE, MAX_RECORD_PAYLOAD, RECORD_FOOTER_SIZE,
    RECORD_HEADER_MAGIC, RECORD_HEADER_SIZE,
};
use crate::files::{LogFileManager, LogFileReader};
use crate::record::{footer_matches, RecordHeader, UserLogRecord};
use bytes::{Buf, Bytes};
use spire_common::{Result, SpireError};
use std::sync::Arc;

/// Forward iterator over log records starting at an anchor.
///
/// Stops at clean end-of-log or at the first structurally invalid record.
/// `last_good_file_number` / `last_good_offset` always name the position
/// immediately after the last record successfully returned (or the starting
/// anchor if none); they never advance past a failed record, so the caller
/// can truncate there. The scanner is the sole structural validator of the
/// log; callers consume only its verdict and the last-good counters.
pub struct LogScanner {
    files: Arc<dyn LogFileManager>,
    reader: Option<Box<dyn LogFileReader>>,
    current_file_number: i64,
    current_offset: u64,
    last_good_file_number: i64,
    last_good_offset: u64,
    invalid: bool,
}

impl LogScanner {
    /// Creates a scanner positioned at `start`. The anchor's offset must be
    /// at or past the log file header.
    pub fn new(start: &LogAnchor, files: Arc<dyn LogFileManager>) -> Self {
        Self {
            files,
            reader: None,
            current_file_number: start.log_file_number,
            current_offset: start.log_file_offset as u64,
            last_good_file_number: start.log_file_number,
            last_good_offset: start.log_file_offset as u64,
            invalid: false,
        }
    }

    /// Fills `record` with the next structurally valid record. Returns false
    /// at clean end-of-log. Fails with `InvalidLog` on a torn or corrupt
    /// record; after that the scanner reports end-of-log.
    pub fn next_record(&mut self, record: &mut UserLogRecord) -> Result<bool> {
        if self.invalid {
            return Ok(false);
        }

        match self.read_next(record) {
            Err(e) if e.is_invalid_log() => {
                self.invalid = true;
                self.close();
                Err(e)
            }
            other => other,
        }
    }

    /// File number just past the last record returned.
    pub fn last_good_file_number(&self) -> i64 {
        self.last_good_file_number
    }

    /// Byte offset just past the last record returned.
    pub fn last_good_offset(&self) -> u64 {
        self.last_good_offset
    }

    /// Releases any reader the scanner opened. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            let _ = reader.close();
        }
    }

    fn read_next(&mut self, record: &mut UserLogRecord) -> Result<bool> {
        loop {
            if self.reader.is_none() {
                match self.files.reader_for(self.current_file_number) {
                    Ok(reader) => self.reader = Some(reader),
                    // Start file absent: an empty log, not corruption.
                    Err(SpireError::NotFound(_)) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }

            let reader = self.reader.as_mut().ok_or(SpireError::LogClosed)?;
            let length = reader.length()?;
            let remaining = length.saturating_sub(self.current_offset);

            if remaining == 0 {
                // Exhausted exactly at a record boundary; cross into the next
                // file if there is one.
                if !self.advance_file()? {
                    return Ok(false);
                }
                continue;
            }

            if remaining < RECORD_HEADER_SIZE as u64 {
                return Err(SpireError::InvalidLog(format!(
                    "log file {} ends inside a record header at offset {}",
                    self.current_file_number, self.current_offset
                )));
            }

            let mut header_buf = [0u8; RECORD_HEADER_SIZE];
            reader.read(&mut header_buf, self.current_offset)?;
            let header = RecordHeader::from_bytes(&header_buf);

            if header.magic != RECORD_HEADER_MAGIC {
                return Err(SpireError::InvalidLog(format!(
                    "bad record magic in log file {} at offset {}",
                    self.current_file_number, self.current_offset
                )));
            }

            let payload_len = header.payload_len as usize;
            if payload_len > MAX_RECORD_PAYLOAD {
                return Err(SpireError::InvalidLog(format!(
                    "implausible record length {} in log file {}",
                    payload_len, self.current_file_number
                )));
            }

            let frame_len = (RECORD_HEADER_SIZE + payload_len + RECORD_FOOTER_SIZE) as u64;
            if remaining < frame_len {
                return Err(SpireError::InvalidLog(format!(
                    "log file {} ends mid-record at offset {}",
                    self.current_file_number, self.current_offset
                )));
            }

            let mut payload = vec![0u8; payload_len];
            reader.read(&mut payload, self.current_offset + RECORD_HEADER_SIZE as u64)?;

            let mut footer = [0u8; RECORD_FOOTER_SIZE];
            reader.read(
                &mut footer,
                self.current_offset + (RECORD_HEADER_SIZE + payload_len) as u64,
            )?;

            if crc32fast::hash(&payload) != header.checksum {
                return Err(SpireError::InvalidLog(format!(
                    "record checksum mismatch in log file {} at offset {}",
                    self.current_file_number, self.current_offset
                )));
            }

            if !footer_matches(&header, &footer) {
                return Err(SpireError::InvalidLog(format!(
                    "record footer mismatch in log file {} at offset {}",
                    self.current_file_number, self.current_offset
                )));
            }

            record.lsn = header.lsn;
            record.data = Bytes::from(payload);

            self.current_offset += frame_len;
            self.last_good_file_number = self.current_file_number;
            self.last_good_offset = self.current_offset;

            return Ok(true);
        }
    }

    /// Moves to the next file. Returns false at clean end-of-log. On entry
    /// the last-good counters move to (next, 0) before the header is
    /// validated, so a torn header leaves them below the header size and the
    /// manager can reformat the file.
    fn advance_file(&mut self) -> Result<bool> {
        let next = self.current_file_number + 1;

        let reader = match self.files.reader_for(next) {
            Ok(reader) => reader,
            Err(SpireError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.close();
        self.reader = Some(reader);
        self.current_file_number = next;
        self.current_offset = 0;
        self.last_good_file_number = next;
        self.last_good_offset = 0;

        let reader = self.reader.as_mut().ok_or(SpireError::LogClosed)?;
        let length = reader.length()?;
        if length < LOG_FILE_HEADER_SIZE as u64 {
            return Err(SpireError::InvalidLog(format!(
                "torn header in log file {next}"
            )));
        }

        let mut header = [0u8; LOG_FILE_HEADER_SIZE];
        reader.read(&mut header, 0)?;
        let mut buf = &header[..];
        let stored_number = buf.get_i64();
        let magic = buf.get_u32();

        if stored_number != next || magic != LOG_FILE_HEADER_MAGIC {
            return Err(SpireError::InvalidLog(format!(
                "bad header in log file {next}"
            )));
        }

        self.current_offset = LOG_FILE_HEADER_SIZE as u64;
        self.last_good_offset = LOG_FILE_HEADER_SIZE as u64;
        Ok(true)
    }
}

impl Drop for LogScanner {
    fn drop(&mut self) {
        self.close();
    }
}
