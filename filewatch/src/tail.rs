//! Following files matched by glob patterns, record by record.
//!
//! [`Tail`] drives a [`Watch`] and reacts to its events by opening, reading
//! and closing files. Bytes read are split into records by one
//! [`BufferedTokenizer`] per file and handed to the subscriber together with
//! the path they came from.
//!
//! # Architecture
//!
//! Read progress is tracked per [`FileId`] in a [`PositionStore`] (the
//! sincedb), which is written to disk at most every
//! `sincedb_write_interval` and once more when the loop stops. When a file is
//! opened its stored offset decides where reading starts:
//!
//! - stored offset within the file: resume there;
//! - stored offset past the end: the file was truncated, start over at 0;
//! - no entry, file present at startup: [`StartPosition`] decides;
//! - no entry, file appeared later: read from 0.
//!
//! The recorded offset never includes a trailing partial record, so a
//! restart re-reads and completes it instead of losing it.
//!
//! When a deleted or rotated file is closed it is read to the end one last
//! time, so lines written just before the rotation are still delivered, and
//! any trailing partial record is flushed to the subscriber.
//!
//! # Example
//!
//! ```no_run
//! use filewatch::{Tail, TailConfig};
//!
//! #[tokio::main]
//! async fn main() -> filewatch::Result<()> {
//!     let mut tail = Tail::new(TailConfig::from_env()?)?;
//!     tail.tail("/var/log/*.log")?;
//!
//!     tail.subscribe(|path, line| {
//!         println!("{}: {line}", path.display());
//!     })
//!     .await
//! }
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::{StartPosition, TailConfig};
use crate::error::{FilewatchError, Result};
use crate::file_id::FileId;
use crate::sincedb::PositionStore;
use crate::tokenizer::BufferedTokenizer;
use crate::watch::{StopHandle, Watch, WatchEvent};

/// Bytes requested per read call.
const READ_CHUNK_SIZE: usize = 32 * 1024;

/// A file currently being followed.
#[derive(Debug)]
struct OpenFile {
    file: File,
    id: FileId,
    /// Offset of the next byte to be read from `file`.
    offset: u64,
    tokenizer: BufferedTokenizer,
}

impl OpenFile {
    /// Offset up to which every byte has been delivered as part of a record.
    fn committed_offset(&self) -> u64 {
        self.offset - self.tokenizer.buffered_len() as u64
    }
}

/// Everything the event handler mutates. Kept apart from the [`Watch`] so
/// the handler can borrow it while the watch is polling.
#[derive(Debug)]
struct Follower {
    files: HashMap<PathBuf, OpenFile>,
    last_warn: HashMap<PathBuf, Instant>,
    sincedb: PositionStore,
    delimiter: Vec<u8>,
    size_limit: Option<NonZeroUsize>,
    start_position: StartPosition,
    sincedb_write_interval: Duration,
    open_warn_interval: Duration,
    buf: Vec<u8>,
}

impl Follower {
    fn handle<F>(&mut self, event: WatchEvent, path: &Path, callback: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &str),
    {
        match event {
            WatchEvent::CreateInitial | WatchEvent::Create => {
                if self.files.contains_key(path) {
                    debug!(path = %path.display(), %event, "Already following");
                    return Ok(());
                }
                if self.open(path, event) {
                    self.read(path, callback)?;
                }
            }
            WatchEvent::Modify => {
                if !self.files.contains_key(path) {
                    debug!(path = %path.display(), "Modified file not open, opening");
                    if !self.open(path, event) {
                        return Ok(());
                    }
                }
                self.read(path, callback)?;
            }
            WatchEvent::Delete => {
                if !self.files.contains_key(path) {
                    self.last_warn.remove(path);
                    return Ok(());
                }
                let read = self.read(path, callback);
                self.close(path, read.is_ok(), callback);
                read?;
            }
        }
        Ok(())
    }

    /// Opens `path` and positions it according to the sincedb.
    ///
    /// Returns `false` if the file could not be opened; it is retried on the
    /// next event for the path.
    fn open(&mut self, path: &Path, event: WatchEvent) -> bool {
        let (mut file, metadata) = match File::open(path).and_then(|f| {
            let metadata = f.metadata()?;
            Ok((f, metadata))
        }) {
            Ok(opened) => opened,
            Err(e) => {
                self.note_open_failure(path, &e);
                return false;
            }
        };
        self.last_warn.remove(path);

        let id = FileId::from_metadata(&metadata);
        let size = metadata.len();

        let offset = match self.sincedb.get(id) {
            Some(offset) if offset <= size => {
                debug!(path = %path.display(), %id, offset, size, "Resuming from sincedb");
                offset
            }
            Some(offset) => {
                debug!(
                    path = %path.display(),
                    %id,
                    offset,
                    size,
                    "Sincedb offset past end of file, starting over"
                );
                self.sincedb.set(id, 0);
                0
            }
            None if event == WatchEvent::CreateInitial => {
                let offset = match self.start_position {
                    StartPosition::Beginning => 0,
                    StartPosition::End => size,
                };
                debug!(
                    path = %path.display(),
                    %id,
                    offset,
                    start = %self.start_position,
                    "No sincedb entry for initial file"
                );
                self.sincedb.set(id, offset);
                offset
            }
            None => {
                debug!(path = %path.display(), %id, "No sincedb entry, reading from start");
                0
            }
        };

        if offset > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                warn!(path = %path.display(), offset, error = %e, "Failed to seek");
                return false;
            }
        }

        info!(path = %path.display(), %id, offset, "Following file");
        self.files.insert(
            path.to_path_buf(),
            OpenFile {
                file,
                id,
                offset,
                tokenizer: BufferedTokenizer::new(self.delimiter.clone(), self.size_limit),
            },
        );
        true
    }

    /// Logs an open failure unless one was logged for `path` recently.
    ///
    /// Returns `true` if the failure was logged at warn level.
    fn note_open_failure(&mut self, path: &Path, err: &std::io::Error) -> bool {
        let now = Instant::now();
        let due = self
            .last_warn
            .get(path)
            .is_none_or(|last| now.duration_since(*last) >= self.open_warn_interval);

        if due {
            warn!(path = %path.display(), error = %err, "Failed to open file");
            self.last_warn.insert(path.to_path_buf(), now);
        } else {
            debug!(path = %path.display(), error = %err, "Failed to open file (warning suppressed)");
        }
        due
    }

    /// Reads `path` until no more data is available, delivering every
    /// completed record.
    fn read<F>(&mut self, path: &Path, callback: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &str),
    {
        let Some(open) = self.files.get_mut(path) else {
            return Ok(());
        };
        if self.buf.len() != READ_CHUNK_SIZE {
            self.buf.resize(READ_CHUNK_SIZE, 0);
        }

        let mut changed = false;
        loop {
            let n = match open.file.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read file");
                    break;
                }
            };
            changed = true;

            let records = match open.tokenizer.extract(&self.buf[..n]) {
                Ok(records) => records,
                Err(e) => {
                    // Rewind so the rejected bytes are read again, not skipped.
                    if let Err(seek_err) = open.file.seek(SeekFrom::Start(open.offset)) {
                        warn!(path = %path.display(), error = %seek_err, "Failed to rewind");
                    }
                    return Err(FilewatchError::overflow(path, e));
                }
            };
            open.offset += n as u64;
            trace!(path = %path.display(), bytes = n, records = records.len(), "Read chunk");

            for record in &records {
                callback(path, &String::from_utf8_lossy(record));
            }
            self.sincedb.set(open.id, open.committed_offset());
        }

        if changed && self.sincedb.due(self.sincedb_write_interval) {
            self.sincedb.persist("interval elapsed");
        }
        Ok(())
    }

    /// Stops following `path`.
    ///
    /// With `flush`, a trailing partial record is delivered. Without it the
    /// partial record is dropped and stays uncommitted in the sincedb.
    fn close<F>(&mut self, path: &Path, flush: bool, callback: &mut F)
    where
        F: FnMut(&Path, &str),
    {
        let Some(mut open) = self.files.remove(path) else {
            return;
        };

        let rest = open.tokenizer.flush();
        if !rest.is_empty() {
            if flush {
                callback(path, &String::from_utf8_lossy(&rest));
                self.sincedb.set(open.id, open.offset);
            } else {
                warn!(
                    path = %path.display(),
                    bytes = rest.len(),
                    "Discarding partial record of closed file"
                );
            }
        }
        debug!(path = %path.display(), id = %open.id, offset = open.offset, "Closed file");
    }
}

/// Follows every file matching the registered patterns.
#[derive(Debug)]
pub struct Tail {
    watch: Watch,
    follower: Follower,
    stat_interval: Duration,
    discover_interval: u32,
}

impl Tail {
    /// Creates a tail from `config` and loads its sincedb.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no sincedb location
    /// can be resolved, or an exclude pattern is not a valid glob.
    pub fn new(config: TailConfig) -> Result<Self> {
        config.validate()?;
        let sincedb_path = config.resolve_sincedb_path()?;

        let mut watch = Watch::new();
        watch.exclude(&config.exclude)?;

        let sincedb = PositionStore::load(sincedb_path);
        info!(
            sincedb = %sincedb.path().display(),
            entries = sincedb.len(),
            start = %config.start_position,
            "Initialized tail"
        );

        Ok(Self {
            watch,
            follower: Follower {
                files: HashMap::new(),
                last_warn: HashMap::new(),
                sincedb,
                delimiter: config.delimiter.into_bytes(),
                size_limit: config.size_limit,
                start_position: config.start_position,
                sincedb_write_interval: config.sincedb_write_interval,
                open_warn_interval: config.open_warn_interval,
                buf: Vec::new(),
            },
            stat_interval: config.stat_interval,
            discover_interval: config.discover_interval,
        })
    }

    /// Starts following files matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid glob.
    pub fn tail(&mut self, pattern: &str) -> Result<()> {
        self.watch.add_pattern(pattern)?;
        Ok(())
    }

    /// Polls until stopped, calling `callback` with every record.
    ///
    /// Records are decoded as UTF-8. Invalid sequences, such as Latin-1
    /// bytes, are replaced with `U+FFFD`; the sincedb offsets still count the
    /// original bytes.
    ///
    /// The sincedb is written one final time when the loop exits, whether it
    /// was stopped or failed.
    ///
    /// # Errors
    ///
    /// Returns [`FilewatchError::Overflow`] if a file produces more
    /// undelimited data than the configured size limit. Per-file I/O problems
    /// are logged and never end the loop.
    pub async fn subscribe<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Path, &str),
    {
        let Self {
            watch,
            follower,
            stat_interval,
            discover_interval,
        } = self;

        info!(patterns = ?watch.patterns(), "Subscribed");
        let result = watch
            .run(
                |event, path| follower.handle(event, path, &mut callback),
                *stat_interval,
                *discover_interval,
            )
            .await;

        follower.sincedb.persist("shutdown");
        if let Err(e) = &result {
            warn!(error = %e, "Tail stopped with error");
        } else {
            info!("Tail stopped");
        }
        result
    }

    /// Runs a single poll tick, calling `callback` with every record.
    ///
    /// For hosts that drive their own loop. Does not re-expand patterns; call
    /// [`discover`](Self::discover) for that.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub fn poll<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Path, &str),
    {
        let follower = &mut self.follower;
        self.watch
            .poll(|event, path| follower.handle(event, path, &mut callback))
    }

    /// Re-expands every registered pattern.
    pub fn discover(&mut self) {
        self.watch.discover();
    }

    /// Requests [`subscribe`](Self::subscribe) to return after the current tick.
    pub fn stop(&self) {
        self.watch.stop();
    }

    /// Returns a handle that can stop the loop from another task.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.watch.stop_handle()
    }

    /// Writes the sincedb now, regardless of the write interval.
    ///
    /// Returns `true` on success; failures are logged.
    pub fn sincedb_write(&mut self, reason: &str) -> bool {
        debug!(reason, "Caller requested sincedb write");
        self.follower.sincedb.persist(reason)
    }

    /// Recorded offset for `id`.
    #[must_use]
    pub fn position(&self, id: FileId) -> Option<u64> {
        self.follower.sincedb.get(id)
    }

    /// The in-memory position store.
    #[must_use]
    pub fn positions(&self) -> &PositionStore {
        &self.follower.sincedb
    }

    /// Where the sincedb is persisted.
    #[must_use]
    pub fn sincedb_path(&self) -> &Path {
        self.follower.sincedb.path()
    }

    /// Returns `true` if `path` is currently open.
    #[must_use]
    pub fn is_following(&self, path: &Path) -> bool {
        self.follower.files.contains_key(path)
    }

    /// The underlying watch.
    #[must_use]
    pub fn watch(&self) -> &Watch {
        &self.watch
    }
}
