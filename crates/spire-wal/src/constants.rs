//! On-disk format constants for log files, records, and the control file.
//!
//! All multi-byte fields are big-endian. The writer and the scanner must use
//! one consistent set of these values; changing any of them is a format break.

// Control file

/// Size of the control file record in bytes.
pub const CONTROLFILE_RECORD_SIZE: usize = 44;

/// Number of leading bytes covered by the control record checksum.
pub const CONTROLFILE_CHECKSUM_LEN: usize = CONTROLFILE_RECORD_SIZE - 8 - 4;

/// Magic number terminating the control record.
pub const CONTROLFILE_MAGIC: u32 = 0xFF11_FF11;

/// Reserved file number of the live control file.
pub const CONTROLFILE_NUMBER: i64 = -1;

/// Reserved file number of the shadow control file.
pub const CONTROLFILE_SHADOW_NUMBER: i64 = -2;

// Log file header

/// Size of the header at the start of every user log file:
/// 8-byte file number followed by the 4-byte magic.
pub const LOG_FILE_HEADER_SIZE: usize = 12;

/// Magic number identifying a formatted log file.
pub const LOG_FILE_HEADER_MAGIC: u32 = 0xFF77_11FF;

// User record frame

/// Size of the per-record header: magic, payload length, LSN, payload CRC32.
pub const RECORD_HEADER_SIZE: usize = 20;

/// Magic number opening every record frame.
pub const RECORD_HEADER_MAGIC: u32 = 0xFF00_FF00;

/// Size of the per-record footer: echoed payload length and closing magic.
pub const RECORD_FOOTER_SIZE: usize = 8;

/// Magic number closing every record frame.
pub const RECORD_FOOTER_MAGIC: u32 = 0x00FF_00FF;

/// Framing overhead added to every payload.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_FOOTER_SIZE;

/// Maximum payload size (16 MiB). Enforced by the writer, assumed by the
/// scanner when judging whether a length field is plausible.
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024 * 1024;
