//! File identity based on inode and device number.
//!
//! Rotation may rename a file or replace the file behind a path, so paths are
//! not stable keys. The (inode, device) pair is, for as long as the file
//! exists.

use std::fmt;
use std::fs::Metadata;

/// A unique identifier for an on-disk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    ino: u64,
    dev: u64,
}

impl FileId {
    /// Creates a `FileId` from raw inode and device values.
    ///
    /// Used when loading persisted state.
    #[must_use]
    pub const fn new(ino: u64, dev: u64) -> Self {
        Self { ino, dev }
    }

    /// Reads the identity from file metadata.
    #[cfg(unix)]
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            ino: metadata.ino(),
            dev: metadata.dev(),
        }
    }

    /// Reads the identity from file metadata.
    ///
    /// Inode numbers are not exposed here, so every file shares one identity
    /// and rotation is only detected by size shrink.
    #[cfg(not(unix))]
    #[must_use]
    pub fn from_metadata(_metadata: &Metadata) -> Self {
        Self { ino: 0, dev: 0 }
    }

    /// Inode number.
    #[must_use]
    pub const fn ino(&self) -> u64 {
        self.ino
    }

    /// Device number.
    #[must_use]
    pub const fn dev(&self) -> u64 {
        self.dev
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ino, self.dev)
    }
}
