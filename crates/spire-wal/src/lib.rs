//! Durable write-ahead log for the Spire directory server.
//!
//! Owns a sequence of append-only numbered log files, a small control record
//! naming the earliest still-needed log position, and the recovery logic that
//! reconciles the two after a crash. Records accepted by the flush layer and
//! synced are readable verbatim after an arbitrary crash; torn records and
//! torn files are detected and truncated or reformatted on reopen.

pub mod anchor;
pub mod constants;
pub mod files;
pub mod flush;
pub mod manager;
pub mod record;
pub mod scanner;

pub use anchor::LogAnchor;
pub use files::{DiskLogFileManager, LogFileManager, LogFileReader, LogFileWriter};
pub use flush::{LogFlushConfig, LogFlushManager};
pub use manager::LogManager;
pub use record::UserLogRecord;
pub use scanner::LogScanner;
