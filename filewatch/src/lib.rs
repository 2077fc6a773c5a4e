//! filewatch - poll-based file tailing with durable read offsets.
//!
//! This crate follows files matched by glob patterns, splits what is appended
//! to them into delimiter-separated records, and remembers how far each file
//! has been read so a restart neither skips nor repeats records.
//!
//! # Overview
//!
//! Watching is strictly poll-based: files are stat'ed on an interval and
//! compared with the previous tick. Files are identified by inode and device
//! rather than by path, which is what allows rotation (rename-and-recreate or
//! truncate-in-place) to be detected and handled.
//!
//! # Modules
//!
//! - [`tail`]: Record delivery over watched files, the main entry point
//! - [`watch`]: Glob discovery and change classification
//! - [`tokenizer`]: Delimiter-based record splitting
//! - [`sincedb`]: Durable per-file read offsets
//! - [`file_id`]: Inode/device file identity
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types

pub mod config;
pub mod error;
pub mod file_id;
pub mod sincedb;
pub mod tail;
pub mod tokenizer;
pub mod watch;

pub use config::{StartPosition, TailConfig, SINCEDB_PATH_ENV};
pub use error::{ConfigError, FilewatchError, Result, TokenizerError};
pub use file_id::FileId;
pub use sincedb::PositionStore;
pub use tail::Tail;
pub use tokenizer::{BufferedTokenizer, DEFAULT_DELIMITER};
pub use watch::{StopHandle, Watch, WatchEvent};
