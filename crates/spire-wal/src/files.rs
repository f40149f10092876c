//! Log file management: numbered files on a filesystem plus positioned
//! reader/writer handles over a single file.
//!
//! The traits are object safe so a fault-injecting double can stand in for
//! the disk-backed implementation in crash tests.

use crate::constants::{CONTROLFILE_NUMBER, CONTROLFILE_SHADOW_NUMBER};
use spire_common::{Result, SpireError, WalConfig};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Positioned sequential reader over one log file.
pub trait LogFileReader: Send + std::fmt::Debug {
    /// Fills `buf` from the absolute `offset`. Reading past end of file is an
    /// error; callers check [`LogFileReader::length`] first.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Current file length in bytes.
    fn length(&self) -> Result<u64>;

    /// Releases the handle. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Appending writer over one log file.
pub trait LogFileWriter: Send {
    /// Appends bytes at the current position and advances it.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Moves the current position to the absolute `offset`.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Current file length in bytes.
    fn length(&self) -> Result<u64>;

    /// Makes all preceding appends durable.
    fn sync(&mut self) -> Result<()>;

    /// Syncs and releases the handle. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Creates, truncates, renames, and deletes numbered log files and hands out
/// readers and writers for them.
pub trait LogFileManager: Send + Sync {
    /// Creates the file for `number` if absent. Returns true if it already
    /// existed; never fails because of existence.
    fn create_log_file(&self, number: i64) -> Result<bool>;

    /// Truncates the file for `number` to `length` bytes, durably.
    fn truncate_log_file(&self, number: i64, length: u64) -> Result<()>;

    /// Deletes the file for `number`. Best effort: failures are logged and
    /// swallowed, a missing file is not an error.
    fn delete_log_file(&self, number: i64);

    /// Atomically renames the file for `from` over the file for `to`.
    fn rename_log_file(&self, from: i64, to: i64) -> Result<()>;

    /// Opens a reader; [`SpireError::NotFound`] if the file is absent.
    fn reader_for(&self, number: i64) -> Result<Box<dyn LogFileReader>>;

    /// Opens a writer positioned at the start of the file;
    /// [`SpireError::NotFound`] if the file is absent.
    fn writer_for(&self, number: i64) -> Result<Box<dyn LogFileWriter>>;
}

/// Maps a file number to its name within the log directory. The control file
/// and its shadow use reserved negative numbers.
pub fn log_file_name(number: i64) -> String {
    match number {
        CONTROLFILE_NUMBER => "log.ctl".to_string(),
        CONTROLFILE_SHADOW_NUMBER => "log.ctl.shadow".to_string(),
        n => format!("log_{n}.db"),
    }
}

/// Disk-backed [`LogFileManager`] rooted at a configured directory.
pub struct DiskLogFileManager {
    log_dir: PathBuf,
    fsync_enabled: bool,
}

impl DiskLogFileManager {
    /// Creates the manager, creating the log directory if needed.
    pub fn new(config: &WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.log_dir)?;
        Ok(Self {
            log_dir: config.log_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        })
    }

    /// The directory holding the log files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn file_path(&self, number: i64) -> PathBuf {
        self.log_dir.join(log_file_name(number))
    }

    fn map_open_err(err: std::io::Error, number: i64) -> SpireError {
        if err.kind() == ErrorKind::NotFound {
            SpireError::NotFound(number)
        } else {
            SpireError::Io(err)
        }
    }

    // Makes the rename itself durable where the platform needs it.
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        if self.fsync_enabled {
            File::open(&self.log_dir)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }
}

impl LogFileManager for DiskLogFileManager {
    fn create_log_file(&self, number: i64) -> Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.file_path(number))
        {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_log_file(&self, number: i64, length: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.file_path(number))
            .map_err(|e| Self::map_open_err(e, number))?;
        file.set_len(length)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    fn delete_log_file(&self, number: i64) {
        if let Err(e) = fs::remove_file(self.file_path(number)) {
            if e.kind() != ErrorKind::NotFound {
                warn!(number, error = %e, "failed to delete log file");
            }
        }
    }

    fn rename_log_file(&self, from: i64, to: i64) -> Result<()> {
        fs::rename(self.file_path(from), self.file_path(to))?;
        self.sync_dir()
    }

    fn reader_for(&self, number: i64) -> Result<Box<dyn LogFileReader>> {
        let file = OpenOptions::new()
            .read(true)
            .open(self.file_path(number))
            .map_err(|e| Self::map_open_err(e, number))?;
        Ok(Box::new(DiskLogFileReader { file: Some(file) }))
    }

    fn writer_for(&self, number: i64) -> Result<Box<dyn LogFileWriter>> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.file_path(number))
            .map_err(|e| Self::map_open_err(e, number))?;
        Ok(Box::new(DiskLogFileWriter {
            file: Some(file),
            fsync_enabled: self.fsync_enabled,
        }))
    }
}

#[derive(Debug)]
struct DiskLogFileReader {
    file: Option<File>,
}

impl LogFileReader for DiskLogFileReader {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.file.as_mut().ok_or(SpireError::LogClosed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(SpireError::LogClosed)?;
        Ok(file.metadata()?.len())
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }
}

struct DiskLogFileWriter {
    file: Option<File>,
    fsync_enabled: bool,
}

impl LogFileWriter for DiskLogFileWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(SpireError::LogClosed)?;
        file.write_all(data)?;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        let file = self.file.as_mut().ok_or(SpireError::LogClosed)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(SpireError::LogClosed)?;
        Ok(file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(SpireError::LogClosed)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.fsync_enabled {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> DiskLogFileManager {
        DiskLogFileManager::new(&WalConfig::with_dir(dir)).unwrap()
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name(1), "log_1.db");
        assert_eq!(log_file_name(42), "log_42.db");
        assert_eq!(log_file_name(CONTROLFILE_NUMBER), "log.ctl");
        assert_eq!(log_file_name(CONTROLFILE_SHADOW_NUMBER), "log.ctl.shadow");
    }

    #[test]
    fn test_create_reports_existence() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());

        assert!(!files.create_log_file(1).unwrap());
        assert!(files.create_log_file(1).unwrap());
    }

    #[test]
    fn test_reader_not_found() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());

        let err = files.reader_for(7).unwrap_err();
        assert!(matches!(err, SpireError::NotFound(7)));
    }

    #[test]
    fn test_writer_append_seek_length() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());
        files.create_log_file(1).unwrap();

        let mut writer = files.writer_for(1).unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b" world").unwrap();
        assert_eq!(writer.length().unwrap(), 11);

        writer.seek(6).unwrap();
        writer.append(b"spire").unwrap();
        writer.sync().unwrap();
        writer.close().unwrap();
        writer.close().unwrap(); // idempotent

        let mut reader = files.reader_for(1).unwrap();
        let mut buf = [0u8; 11];
        reader.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello spire");
        reader.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());
        files.create_log_file(1).unwrap();

        let mut writer = files.writer_for(1).unwrap();
        writer.append(&[0xAB; 64]).unwrap();
        writer.close().unwrap();

        files.truncate_log_file(1, 16).unwrap();
        let reader = files.reader_for(1).unwrap();
        assert_eq!(reader.length().unwrap(), 16);
    }

    #[test]
    fn test_rename_replaces_target() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());

        files.create_log_file(CONTROLFILE_SHADOW_NUMBER).unwrap();
        let mut writer = files.writer_for(CONTROLFILE_SHADOW_NUMBER).unwrap();
        writer.append(b"new").unwrap();
        writer.close().unwrap();

        files.create_log_file(CONTROLFILE_NUMBER).unwrap();
        let mut writer = files.writer_for(CONTROLFILE_NUMBER).unwrap();
        writer.append(b"old-contents").unwrap();
        writer.close().unwrap();

        files
            .rename_log_file(CONTROLFILE_SHADOW_NUMBER, CONTROLFILE_NUMBER)
            .unwrap();

        let mut reader = files.reader_for(CONTROLFILE_NUMBER).unwrap();
        assert_eq!(reader.length().unwrap(), 3);
        let mut buf = [0u8; 3];
        reader.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"new");

        assert!(matches!(
            files.reader_for(CONTROLFILE_SHADOW_NUMBER).unwrap_err(),
            SpireError::NotFound(_)
        ));
    }

    #[test]
    fn test_delete_is_best_effort() {
        let dir = tempdir().unwrap();
        let files = manager(dir.path());

        // Deleting a missing file must not panic or error.
        files.delete_log_file(99);

        files.create_log_file(2).unwrap();
        files.delete_log_file(2);
        assert!(matches!(
            files.reader_for(2).unwrap_err(),
            SpireError::NotFound(_)
        ));
    }
}
