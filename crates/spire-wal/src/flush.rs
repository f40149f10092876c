//! Serialised append facade over the log manager.
//!
//! Upstream subsystems hand in opaque payloads; the flush manager stamps
//! LSNs, frames the payloads, appends them to the current log file, and asks
//! the log manager to rotate once the file reaches its target size. A single
//! internal mutex serialises writers, which is what lets the rest of the core
//! assume exactly one appender.

use crate::anchor::LogAnchor;
use crate::files::LogFileWriter;
use crate::manager::LogManager;
use crate::record::frame_record;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spire_common::{Result, SpireError};
use std::sync::Arc;
use tracing::debug;

/// Default size at which the current log file is rotated (16 MiB).
pub const DEFAULT_TARGET_LOG_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Configuration for the flush manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFlushConfig {
    /// Rotate to a new log file once the current one reaches this size.
    pub target_log_file_size: u64,
    /// Sync after every append. Callers that batch can disable this and call
    /// [`LogFlushManager::sync`] themselves.
    pub sync_on_append: bool,
}

impl Default for LogFlushConfig {
    fn default() -> Self {
        Self {
            target_log_file_size: DEFAULT_TARGET_LOG_FILE_SIZE,
            sync_on_append: true,
        }
    }
}

struct FlushState {
    writer: Option<Box<dyn LogFileWriter>>,
    current_file_number: i64,
    next_lsn: i64,
}

/// Append interface for user log records.
pub struct LogFlushManager {
    log_manager: Arc<LogManager>,
    config: LogFlushConfig,
    state: Mutex<FlushState>,
}

impl LogFlushManager {
    /// Creates the flush manager, opening a writer on the current log file.
    /// LSN numbering continues past anything the recovery scan observed.
    pub fn new(log_manager: Arc<LogManager>, config: LogFlushConfig) -> Result<Self> {
        let writer = log_manager.switch_to_next_log_file(None)?;
        let current_file_number = log_manager.current_log_file_number();
        let next_lsn = if log_manager.last_lsn() == LogAnchor::UNKNOWN_LSN {
            1
        } else {
            log_manager.last_lsn() + 1
        };

        Ok(Self {
            log_manager,
            config,
            state: Mutex::new(FlushState {
                writer: Some(writer),
                current_file_number,
                next_lsn,
            }),
        })
    }

    /// Appends one record and returns the anchor at which it begins.
    pub fn append(&self, payload: &[u8]) -> Result<LogAnchor> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.writer.is_none() {
            return Err(SpireError::LogClosed);
        }

        // Rotate first so the record lands whole in one file.
        if state.writer.as_mut().ok_or(SpireError::LogClosed)?.length()?
            >= self.config.target_log_file_size
        {
            let old = state.writer.take().ok_or(SpireError::LogClosed)?;
            let writer = self.log_manager.switch_to_next_log_file(Some(old))?;
            state.writer = Some(writer);
            state.current_file_number = self.log_manager.current_log_file_number();
            debug!(file = state.current_file_number, "rotated log file");
        }

        let lsn = state.next_lsn;
        let framed = frame_record(lsn, payload)?;

        let writer = state.writer.as_mut().ok_or(SpireError::LogClosed)?;
        let offset = writer.length()?;
        writer.append(&framed)?;
        if self.config.sync_on_append {
            writer.sync()?;
        }

        state.next_lsn += 1;
        Ok(LogAnchor::new(state.current_file_number, offset as i64, lsn))
    }

    /// Makes all previously appended records durable.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.writer.as_mut().ok_or(SpireError::LogClosed)?.sync()
    }

    /// Syncs and closes the current writer. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.sync()?;
            writer.close()?;
        }
        Ok(())
    }

    /// The log manager this flush manager rotates through.
    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }
}
