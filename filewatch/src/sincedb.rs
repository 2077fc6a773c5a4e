//! Durable table of per-file read offsets.
//!
//! The sincedb maps a [`FileId`] to the byte offset up to which the file has
//! been read. It is what lets a restarted tailer continue exactly where the
//! previous run stopped.
//!
//! # Format
//!
//! Plain text, one row per identity, fields separated by whitespace:
//!
//! ```text
//! <inode> <device> <offset>
//! ```
//!
//! # Durability
//!
//! Writes go to `<path>.new` first and are then renamed over `<path>`. A
//! failure or crash before the rename leaves the previous file untouched, so
//! a reader never sees a partially written table. Write failures are logged
//! by [`PositionStore::persist`]; the in-memory table stays authoritative
//! until the next successful write.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::file_id::FileId;

/// Suffix of the temporary file written before the atomic rename.
const TEMP_SUFFIX: &str = ".new";

/// In-memory offset table bound to its on-disk location.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    positions: HashMap<FileId, u64>,
    last_write: Option<Instant>,
}

impl PositionStore {
    /// Creates an empty store that persists to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            positions: HashMap::new(),
            last_write: None,
        }
    }

    /// Loads the store persisted at `path`.
    ///
    /// A missing or unreadable file is not an error: the store starts empty
    /// and every file is treated as never seen before. Malformed rows are
    /// skipped.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);

        let contents = match fs::read_to_string(&store.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %store.path.display(), "No sincedb yet, starting empty");
                return store;
            }
            Err(e) => {
                warn!(path = %store.path.display(), error = %e, "Failed to read sincedb, starting empty");
                return store;
            }
        };

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_row(line) {
                Some((id, offset)) => {
                    store.positions.insert(id, offset);
                }
                None => {
                    warn!(
                        path = %store.path.display(),
                        line = index + 1,
                        "Skipping malformed sincedb row"
                    );
                }
            }
        }

        debug!(
            path = %store.path.display(),
            entries = store.positions.len(),
            "Loaded sincedb"
        );
        store
    }

    /// Where the store is persisted.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded offset for `id`.
    #[must_use]
    pub fn get(&self, id: FileId) -> Option<u64> {
        self.positions.get(&id).copied()
    }

    /// Records `offset` for `id`.
    pub fn set(&mut self, id: FileId, offset: u64) {
        self.positions.insert(id, offset);
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Iterates over `(identity, offset)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (FileId, u64)> + '_ {
        self.positions.iter().map(|(id, offset)| (*id, *offset))
    }

    /// Returns `true` if no successful write happened within `interval`.
    #[must_use]
    pub fn due(&self, interval: Duration) -> bool {
        self.last_write
            .is_none_or(|written| written.elapsed() >= interval)
    }

    /// Writes the table to disk atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or the
    /// rename fails. The canonical file is unchanged in either case.
    pub fn write(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        self.write_rows(&temp)?;
        fs::rename(&temp, &self.path)
    }

    /// Writes the table, logging instead of failing.
    ///
    /// Returns `true` on success. `reason` is only used for logging.
    pub fn persist(&mut self, reason: &str) -> bool {
        match self.write() {
            Ok(()) => {
                self.last_write = Some(Instant::now());
                debug!(
                    path = %self.path.display(),
                    entries = self.positions.len(),
                    reason,
                    "Wrote sincedb"
                );
                true
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    reason,
                    "Failed to write sincedb"
                );
                false
            }
        }
    }

    fn write_rows(&self, temp: &Path) -> io::Result<()> {
        let mut rows: Vec<_> = self.iter().collect();
        rows.sort_unstable();

        let mut writer = BufWriter::new(File::create(temp)?);
        for (id, offset) in rows {
            writeln!(writer, "{} {} {}", id.ino(), id.dev(), offset)?;
        }

        let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }
}

/// Parses `<inode> <device> <offset>`.
fn parse_row(line: &str) -> Option<(FileId, u64)> {
    let mut fields = line.split_whitespace();
    let ino = fields.next()?.parse().ok()?;
    let dev = fields.next()?.parse().ok()?;
    let offset = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((FileId::new(ino, dev), offset))
}
