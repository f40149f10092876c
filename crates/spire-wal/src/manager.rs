//! Log manager: control file, recovery, rotation, and reclamation.

use crate::anchor::LogAnchor;
use crate::constants::{
    CONTROLFILE_CHECKSUM_LEN, CONTROLFILE_MAGIC, CONTROLFILE_NUMBER, CONTROLFILE_RECORD_SIZE,
    CONTROLFILE_SHADOW_NUMBER, LOG_FILE_HEADER_MAGIC, LOG_FILE_HEADER_SIZE,
};
use crate::files::{LogFileManager, LogFileWriter};
use crate::record::UserLogRecord;
use crate::scanner::LogScanner;
use adler32::RollingAdler32;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use spire_common::{Result, SpireError};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The checkpoint record kept in the control file.
///
/// On disk this is 44 big-endian bytes: the four i64 fields below, then an
/// 8-byte checksum slot holding the Adler-32 of the first 32 bytes (high 32
/// bits zero; the slot is wider than the sum for on-disk compatibility), then
/// the 4-byte magic.
#[derive(Debug, Clone, Copy)]
struct ControlFileRecord {
    /// Smallest file number that still exists on disk.
    min_existing_log_file: i64,
    /// Smallest file number any consumer still needs.
    min_needed_log_file: i64,
    /// Offset of the first still-needed record within that file.
    min_needed_log_file_offset: i64,
    /// LSN at that offset, possibly unknown.
    min_needed_lsn: i64,
}

impl ControlFileRecord {
    fn encode(&self) -> [u8; CONTROLFILE_RECORD_SIZE] {
        let mut buf = [0u8; CONTROLFILE_RECORD_SIZE];
        {
            let mut b = &mut buf[..];
            b.put_i64(self.min_existing_log_file);
            b.put_i64(self.min_needed_log_file);
            b.put_i64(self.min_needed_log_file_offset);
            b.put_i64(self.min_needed_lsn);
        }

        let mut adler = RollingAdler32::new();
        adler.update_buffer(&buf[..CONTROLFILE_CHECKSUM_LEN]);
        let checksum = adler.hash() as u64;

        {
            let mut b = &mut buf[CONTROLFILE_CHECKSUM_LEN..];
            b.put_u64(checksum);
            b.put_u32(CONTROLFILE_MAGIC);
        }
        buf
    }

    fn decode(buf: &[u8; CONTROLFILE_RECORD_SIZE]) -> Result<Self> {
        let mut adler = RollingAdler32::new();
        adler.update_buffer(&buf[..CONTROLFILE_CHECKSUM_LEN]);
        let computed = adler.hash() as u64;

        let mut b = &buf[..];
        let record = Self {
            min_existing_log_file: b.get_i64(),
            min_needed_log_file: b.get_i64(),
            min_needed_log_file_offset: b.get_i64(),
            min_needed_lsn: b.get_i64(),
        };
        let checksum = b.get_u64();
        let magic = b.get_u32();

        if magic != CONTROLFILE_MAGIC {
            return Err(SpireError::InvalidLog(
                "control file magic mismatch".to_string(),
            ));
        }
        if checksum != computed {
            return Err(SpireError::InvalidLog(
                "control file checksum mismatch".to_string(),
            ));
        }
        if record.min_existing_log_file < LogAnchor::MIN_LOG_NUMBER
            || record.min_needed_log_file < LogAnchor::MIN_LOG_NUMBER
            || record.min_needed_log_file_offset < LogAnchor::MIN_LOG_OFFSET
            || record.min_existing_log_file > record.min_needed_log_file
        {
            return Err(SpireError::InvalidLog(
                "control file record out of range".to_string(),
            ));
        }

        Ok(record)
    }
}

/// State touched only by the single rotation caller.
struct RotationState {
    control: ControlFileRecord,
    current_log_file_number: i64,
}

/// Owns the control file, recovery at open, rotation of the current log file,
/// and reclamation of superseded files.
///
/// Designed for one flusher thread calling [`LogManager::switch_to_next_log_file`]
/// and any number of threads calling [`LogManager::advance_min_log_anchor`] /
/// [`LogManager::min_log_anchor`].
impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("min_log_anchor", &self.min_log_anchor)
            .field("last_lsn", &self.last_lsn)
            .finish()
    }
}

pub struct LogManager {
    files: Arc<dyn LogFileManager>,
    /// Min needed point in the log. The lock is held only across the copy in
    /// or out, never across I/O.
    min_log_anchor: Mutex<LogAnchor>,
    rotation: Mutex<RotationState>,
    /// Highest LSN seen while scanning at init, or `UNKNOWN_LSN`.
    last_lsn: i64,
}

impl LogManager {
    /// Opens the log, running recovery:
    ///
    /// 1. Read and verify the control file; if absent, bootstrap a fresh log.
    /// 2. Scan forward from the recorded min anchor to find the true end of
    ///    the log and the last intact record.
    /// 3. If the tail is torn, truncate to the last record boundary, or
    ///    reformat the last file when its header itself is torn. Corruption
    ///    anywhere but the tail is unrecoverable.
    pub fn init(files: Arc<dyn LogFileManager>) -> Result<Self> {
        match Self::read_control_file(files.as_ref()) {
            Ok(control) => Self::recover(files, control),
            Err(e) if e.is_not_found() => Self::bootstrap(files),
            Err(e) => Err(e),
        }
    }

    fn recover(files: Arc<dyn LogFileManager>, control: ControlFileRecord) -> Result<Self> {
        let min_anchor = LogAnchor::new(
            control.min_needed_log_file,
            control.min_needed_log_file_offset,
            control.min_needed_lsn,
        );

        // Scan all logged records from the checkpoint to check that they are
        // valid and to find the end of the log.
        let mut scanner = LogScanner::new(&min_anchor, files.clone());
        let mut record = UserLogRecord::default();
        let mut invalid_log = false;
        let mut last_lsn = LogAnchor::UNKNOWN_LSN;

        loop {
            match scanner.next_record(&mut record) {
                Ok(true) => last_lsn = last_lsn.max(record.lsn),
                Ok(false) => break,
                Err(e) if e.is_invalid_log() => {
                    invalid_log = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let last_good_file = scanner.last_good_file_number();
        let last_good_offset = scanner.last_good_offset();
        scanner.close();

        if last_good_file < LogAnchor::MIN_LOG_NUMBER {
            return Err(SpireError::InvalidLog(
                "scan ended before the first log file".to_string(),
            ));
        }
        let scan_point = LogAnchor::new(
            last_good_file,
            last_good_offset as i64,
            LogAnchor::UNKNOWN_LSN,
        );
        if scan_point.position_cmp(&min_anchor) == Ordering::Less {
            return Err(SpireError::InvalidLog(
                "log ends before the recorded min anchor".to_string(),
            ));
        }
        // A clean scan always ends at or past a file header.
        if !invalid_log && last_good_offset < LogAnchor::MIN_LOG_OFFSET as u64 {
            return Err(SpireError::InvalidLog(
                "clean scan ended inside a file header".to_string(),
            ));
        }

        let mut state = RotationState {
            control,
            current_log_file_number: last_good_file,
        };

        if invalid_log {
            // The scan must have stopped in the last file, otherwise the
            // corruption is not at the tail.
            match files.reader_for(last_good_file + 1) {
                Ok(mut reader) => {
                    reader.close()?;
                    return Err(SpireError::InvalidLog(format!(
                        "log file {} is corrupt but file {} exists",
                        last_good_file,
                        last_good_file + 1
                    )));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            if last_good_offset >= LOG_FILE_HEADER_SIZE as u64 {
                warn!(
                    file = last_good_file,
                    offset = last_good_offset,
                    "truncating torn record at log tail"
                );
                files.truncate_log_file(last_good_file, last_good_offset)?;
            } else {
                warn!(file = last_good_file, "reformatting log file with torn header");
                Self::format_log_file(files.as_ref(), &mut state, true)?;
            }
        }

        info!(
            current = state.current_log_file_number,
            min_anchor = %min_anchor,
            "log recovered"
        );

        Ok(Self {
            files,
            min_log_anchor: Mutex::new(min_anchor),
            rotation: Mutex::new(state),
            last_lsn,
        })
    }

    /// No control file: either the very beginning, or a crash in the middle
    /// of creating the first log file. At most the first file with a
    /// formatted header may exist; anything longer is ambiguous.
    fn bootstrap(files: Arc<dyn LogFileManager>) -> Result<Self> {
        let mut file_exists = false;

        match files.reader_for(LogAnchor::MIN_LOG_NUMBER) {
            Ok(mut reader) => {
                let length = reader.length()?;
                reader.close()?;
                if length > LOG_FILE_HEADER_SIZE as u64 {
                    return Err(SpireError::InvalidLog(
                        "log records present but no control file".to_string(),
                    ));
                }
                file_exists = true;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut state = RotationState {
            control: ControlFileRecord {
                min_existing_log_file: LogAnchor::MIN_LOG_NUMBER,
                min_needed_log_file: LogAnchor::MIN_LOG_NUMBER,
                min_needed_log_file_offset: LogAnchor::MIN_LOG_OFFSET,
                min_needed_lsn: LogAnchor::UNKNOWN_LSN,
            },
            current_log_file_number: if file_exists {
                LogAnchor::MIN_LOG_NUMBER
            } else {
                LogAnchor::MIN_LOG_NUMBER - 1
            },
        };

        Self::format_log_file(files.as_ref(), &mut state, file_exists)?;

        let manager = Self {
            files,
            min_log_anchor: Mutex::new(LogAnchor::start_of_log()),
            rotation: Mutex::new(state),
            last_lsn: LogAnchor::UNKNOWN_LSN,
        };

        {
            let mut state = manager.rotation.lock();
            manager.write_control_file(&mut state)?;
        }

        info!("log bootstrapped");
        Ok(manager)
    }

    /// Called by the flush layer to switch to the next file.
    ///
    /// With a current writer: closes it, rewrites the control file (the
    /// checkpoint; this persists any anchor advance and reclaims superseded
    /// files), formats the next file, and returns a writer on it. With
    /// `None`: opens a writer on the current file (flush layer startup).
    /// Either way the writer is positioned at end of file.
    pub fn switch_to_next_log_file(
        &self,
        current_writer: Option<Box<dyn LogFileWriter>>,
    ) -> Result<Box<dyn LogFileWriter>> {
        let mut state = self.rotation.lock();

        if let Some(mut writer) = current_writer {
            writer.close()?;
            self.write_control_file(&mut state)?;
            Self::format_log_file(self.files.as_ref(), &mut state, false)?;
        }

        let mut writer = self.files.writer_for(state.current_log_file_number)?;
        let length = writer.length()?;
        if length > 0 {
            writer.seek(length)?;
        }

        Ok(writer)
    }

    /// Raises the min needed anchor. An anchor at or below the current one is
    /// ignored; the anchor never moves backward. No I/O happens here: the new
    /// value is persisted by the next rotation.
    pub fn advance_min_log_anchor(&self, new_anchor: &LogAnchor) {
        let mut current = self.min_log_anchor.lock();
        if current.position_cmp(new_anchor) == Ordering::Less {
            *current = *new_anchor;
        }
    }

    /// The anchor associated with the last valid checkpoint candidate.
    pub fn min_log_anchor(&self) -> LogAnchor {
        *self.min_log_anchor.lock()
    }

    /// Number of the file the next writer will append to.
    pub fn current_log_file_number(&self) -> i64 {
        self.rotation.lock().current_log_file_number
    }

    /// Highest LSN observed during the recovery scan, or
    /// [`LogAnchor::UNKNOWN_LSN`] for a fresh or empty log.
    pub fn last_lsn(&self) -> i64 {
        self.last_lsn
    }

    /// Writes the control file. The record is first written and synced to a
    /// shadow file, then renamed over the live control file; under POSIX
    /// rename semantics the on-disk record is always either the last
    /// committed one or the one before it, never a torn mixture.
    fn write_control_file(&self, state: &mut RotationState) -> Result<()> {
        {
            let anchor = self.min_log_anchor.lock();
            state.control.min_needed_log_file = anchor.log_file_number;
            state.control.min_needed_log_file_offset = anchor.log_file_offset;
            state.control.min_needed_lsn = anchor.lsn;
        }

        if state.control.min_needed_log_file > state.control.min_existing_log_file {
            self.delete_unneeded_log_files(
                state.control.min_existing_log_file,
                state.control.min_needed_log_file,
            );
            state.control.min_existing_log_file = state.control.min_needed_log_file;
        }

        let buf = state.control.encode();

        if self.files.create_log_file(CONTROLFILE_SHADOW_NUMBER)? {
            self.files.truncate_log_file(CONTROLFILE_SHADOW_NUMBER, 0)?;
        }

        let mut writer = self.files.writer_for(CONTROLFILE_SHADOW_NUMBER)?;
        writer.append(&buf)?;
        writer.sync()?;
        writer.close()?;

        self.files
            .rename_log_file(CONTROLFILE_SHADOW_NUMBER, CONTROLFILE_NUMBER)?;

        debug!(
            min_existing = state.control.min_existing_log_file,
            min_needed = state.control.min_needed_log_file,
            "control file written"
        );
        Ok(())
    }

    fn read_control_file(files: &dyn LogFileManager) -> Result<ControlFileRecord> {
        let mut reader = files.reader_for(CONTROLFILE_NUMBER)?;

        let length = reader.length()?;
        if length < CONTROLFILE_RECORD_SIZE as u64 {
            reader.close()?;
            return Err(SpireError::InvalidLog("control file truncated".to_string()));
        }

        let mut buf = [0u8; CONTROLFILE_RECORD_SIZE];
        let read = reader.read(&mut buf, 0);
        reader.close()?;
        read?;

        ControlFileRecord::decode(&buf)
    }

    /// Formats the next log file, or reformats the current one in place. The
    /// target must already exist exactly when reformatting; any mismatch
    /// means the directory holds a file this manager never wrote, or lost one
    /// it did.
    fn format_log_file(
        files: &dyn LogFileManager,
        state: &mut RotationState,
        reformat_existing_file: bool,
    ) -> Result<()> {
        let target = if reformat_existing_file {
            state.current_log_file_number
        } else {
            state.current_log_file_number + 1
        };

        let already_existed = files.create_log_file(target)?;
        if already_existed != reformat_existing_file {
            return Err(SpireError::InvalidLog(format!(
                "unexpected state for log file {target}"
            )));
        }

        if reformat_existing_file {
            files.truncate_log_file(target, 0)?;
        }

        let mut header = Vec::with_capacity(LOG_FILE_HEADER_SIZE);
        header.put_i64(target);
        header.put_u32(LOG_FILE_HEADER_MAGIC);

        let mut writer = files.writer_for(target)?;
        writer.append(&header)?;
        writer.sync()?;
        writer.close()?;

        state.current_log_file_number = target;
        debug!(file = target, "formatted log file");
        Ok(())
    }

    /// Purges files strictly below the new min needed file. Best effort: a
    /// file already missing was removed by an earlier attempt that crashed
    /// before persisting, and is unneeded either way.
    fn delete_unneeded_log_files(&self, from: i64, to: i64) {
        info!(from, to, "reclaiming log files");
        for number in from..to {
            self.files.delete_log_file(number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::DiskLogFileManager;
    use crate::record::frame_record;
    use spire_common::WalConfig;
    use std::path::Path;
    use tempfile::tempdir;

    fn manager_files(dir: &Path) -> Arc<dyn LogFileManager> {
        Arc::new(DiskLogFileManager::new(&WalConfig::with_dir(dir)).unwrap())
    }

    fn control_record() -> ControlFileRecord {
        ControlFileRecord {
            min_existing_log_file: 1,
            min_needed_log_file: 3,
            min_needed_log_file_offset: 64,
            min_needed_lsn: 17,
        }
    }

    #[test]
    fn test_control_record_roundtrip() {
        let record = control_record();
        let buf = record.encode();
        assert_eq!(buf.len(), CONTROLFILE_RECORD_SIZE);

        let decoded = ControlFileRecord::decode(&buf).unwrap();
        assert_eq!(decoded.min_existing_log_file, 1);
        assert_eq!(decoded.min_needed_log_file, 3);
        assert_eq!(decoded.min_needed_log_file_offset, 64);
        assert_eq!(decoded.min_needed_lsn, 17);
    }

    #[test]
    fn test_control_record_checksum_corruption() {
        let mut buf = control_record().encode();
        buf[34] ^= 0xFF; // inside the checksum slot
        let err = ControlFileRecord::decode(&buf).unwrap_err();
        assert!(err.is_invalid_log());

        let mut buf = control_record().encode();
        buf[3] ^= 0x01; // inside a covered field
        assert!(ControlFileRecord::decode(&buf).unwrap_err().is_invalid_log());
    }

    #[test]
    fn test_control_record_magic_corruption() {
        let mut buf = control_record().encode();
        buf[CONTROLFILE_RECORD_SIZE - 1] ^= 0xFF;
        let err = ControlFileRecord::decode(&buf).unwrap_err();
        assert!(err.is_invalid_log());
    }

    #[test]
    fn test_control_record_invariants() {
        // min existing above min needed
        let bad = ControlFileRecord {
            min_existing_log_file: 5,
            min_needed_log_file: 3,
            min_needed_log_file_offset: 64,
            min_needed_lsn: LogAnchor::UNKNOWN_LSN,
        };
        assert!(ControlFileRecord::decode(&bad.encode()).unwrap_err().is_invalid_log());

        // offset below the file header
        let bad = ControlFileRecord {
            min_existing_log_file: 1,
            min_needed_log_file: 1,
            min_needed_log_file_offset: 2,
            min_needed_lsn: LogAnchor::UNKNOWN_LSN,
        };
        assert!(ControlFileRecord::decode(&bad.encode()).unwrap_err().is_invalid_log());
    }

    #[test]
    fn test_bootstrap_fresh_directory() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());

        let manager = LogManager::init(files.clone()).unwrap();
        assert_eq!(manager.current_log_file_number(), 1);
        assert_eq!(manager.min_log_anchor(), LogAnchor::start_of_log());
        assert_eq!(manager.last_lsn(), LogAnchor::UNKNOWN_LSN);

        // Control file holds the start-of-log checkpoint.
        let mut reader = files.reader_for(CONTROLFILE_NUMBER).unwrap();
        let mut buf = [0u8; CONTROLFILE_RECORD_SIZE];
        reader.read(&mut buf, 0).unwrap();
        let control = ControlFileRecord::decode(&buf).unwrap();
        assert_eq!(control.min_existing_log_file, 1);
        assert_eq!(control.min_needed_log_file, 1);
        assert_eq!(control.min_needed_log_file_offset, LogAnchor::MIN_LOG_OFFSET);
        assert_eq!(control.min_needed_lsn, LogAnchor::UNKNOWN_LSN);

        // File 1 holds exactly its header.
        let reader = files.reader_for(1).unwrap();
        assert_eq!(reader.length().unwrap(), LOG_FILE_HEADER_SIZE as u64);
    }

    #[test]
    fn test_bootstrap_is_idempotent_after_header_only_crash() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());

        // Simulate a crash after formatting file 1 but before the control
        // file was written.
        drop(LogManager::init(files.clone()).unwrap());
        files.delete_log_file(CONTROLFILE_NUMBER);

        let manager = LogManager::init(files).unwrap();
        assert_eq!(manager.current_log_file_number(), 1);
    }

    #[test]
    fn test_rotation_advances_current_file() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());
        let manager = LogManager::init(files).unwrap();

        let writer = manager.switch_to_next_log_file(None).unwrap();
        let writer = manager.switch_to_next_log_file(Some(writer)).unwrap();
        assert_eq!(manager.current_log_file_number(), 2);
        let _writer = manager.switch_to_next_log_file(Some(writer)).unwrap();
        assert_eq!(manager.current_log_file_number(), 3);
    }

    #[test]
    fn test_reopen_after_clean_shutdown() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());

        {
            let manager = LogManager::init(files.clone()).unwrap();
            let mut writer = manager.switch_to_next_log_file(None).unwrap();
            writer.append(&frame_record(9, b"entry").unwrap()).unwrap();
            writer.sync().unwrap();
            writer.close().unwrap();
        }

        let manager = LogManager::init(files).unwrap();
        assert_eq!(manager.current_log_file_number(), 1);
        assert_eq!(manager.last_lsn(), 9);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());
        let manager = LogManager::init(files).unwrap();

        let ahead = LogAnchor::new(2, LogAnchor::MIN_LOG_OFFSET, 40);
        manager.advance_min_log_anchor(&ahead);
        assert_eq!(manager.min_log_anchor(), ahead);

        // Lower anchors are silently ignored.
        manager.advance_min_log_anchor(&LogAnchor::new(1, 500, 99));
        assert_eq!(manager.min_log_anchor(), ahead);

        let further = LogAnchor::new(2, 2048, 41);
        manager.advance_min_log_anchor(&further);
        assert_eq!(manager.min_log_anchor(), further);
    }

    #[test]
    fn test_missing_control_with_log_data_is_ambiguous() {
        let dir = tempdir().unwrap();
        let files = manager_files(dir.path());

        {
            let manager = LogManager::init(files.clone()).unwrap();
            let mut writer = manager.switch_to_next_log_file(None).unwrap();
            writer.append(&frame_record(1, b"data").unwrap()).unwrap();
            writer.close().unwrap();
        }
        files.delete_log_file(CONTROLFILE_NUMBER);

        let err = LogManager::init(files).unwrap_err();
        assert!(err.is_invalid_log());
    }
}
