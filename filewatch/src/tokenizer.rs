//! Delimiter framing over an arbitrarily chunked byte stream.
//!
//! Reads from a growing file rarely end on a record boundary. The
//! [`BufferedTokenizer`] holds the undelimited tail of every chunk until a
//! later chunk supplies the delimiter that completes it.
//!
//! # Example
//!
//! ```
//! use filewatch::tokenizer::BufferedTokenizer;
//!
//! let mut tokenizer = BufferedTokenizer::default();
//!
//! assert_eq!(tokenizer.extract(b"foo\nba").unwrap(), vec![b"foo".to_vec()]);
//! assert_eq!(tokenizer.extract(b"r\nbaz").unwrap(), vec![b"bar".to_vec()]);
//! assert_eq!(tokenizer.flush(), b"baz".to_vec());
//! assert!(tokenizer.is_empty());
//! ```

use std::num::NonZeroUsize;

use memchr::memmem;

use crate::error::TokenizerError;

/// Default record delimiter.
pub const DEFAULT_DELIMITER: &[u8] = b"\n";

/// Splits a byte stream into delimiter-bounded records.
///
/// Records are the same however the stream is chunked, including when a
/// multi-byte delimiter is split across two chunks.
#[derive(Debug, Clone)]
pub struct BufferedTokenizer {
    /// Record separator, never empty.
    delimiter: Vec<u8>,

    /// Maximum number of undelimited bytes that may be held.
    size_limit: Option<NonZeroUsize>,

    /// Bytes seen since the last delimiter.
    pending: Vec<u8>,
}

impl Default for BufferedTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, None)
    }
}

impl BufferedTokenizer {
    /// Creates a tokenizer for the given delimiter.
    ///
    /// # Arguments
    ///
    /// * `delimiter` - Byte sequence separating records
    /// * `size_limit` - Cap on buffered undelimited bytes, `None` for unlimited
    ///
    /// # Panics
    ///
    /// Panics if `delimiter` is empty.
    #[must_use]
    pub fn new(delimiter: impl Into<Vec<u8>>, size_limit: Option<NonZeroUsize>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "tokenizer delimiter must not be empty");

        Self {
            delimiter,
            size_limit,
            pending: Vec::new(),
        }
    }

    /// Feeds a chunk and returns every record it completes, in order.
    ///
    /// The bytes after the last delimiter become the new buffer. When no
    /// delimiter is completed by `data` it is appended to the buffer and
    /// nothing is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::Overflow`] if accepting `data` would leave
    /// more undelimited bytes buffered than the configured limit. The
    /// tokenizer is unchanged in that case.
    pub fn extract(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, TokenizerError> {
        let straddle = self.find_straddling(data);
        let rest = match straddle {
            Some((_, resume)) => &data[resume..],
            None => data,
        };
        let (complete, remainder) = split_records(rest, &self.delimiter);

        let pending = if straddle.is_none() && complete.is_empty() {
            self.pending.len() + remainder.len()
        } else {
            remainder.len()
        };
        if let Some(limit) = self.size_limit {
            if pending > limit.get() {
                return Err(TokenizerError::Overflow {
                    buffered: pending,
                    limit: limit.get(),
                });
            }
        }

        let mut records = Vec::with_capacity(complete.len() + 1);
        let mut pieces = complete.into_iter();
        match straddle {
            Some((end, _)) => {
                self.pending.truncate(end);
                records.push(std::mem::take(&mut self.pending));
            }
            None => {
                let Some(head) = pieces.next() else {
                    self.pending.extend_from_slice(remainder);
                    return Ok(records);
                };
                let mut first = std::mem::take(&mut self.pending);
                first.extend_from_slice(head);
                records.push(first);
            }
        }
        records.extend(pieces.map(<[u8]>::to_vec));
        self.pending.extend_from_slice(remainder);

        Ok(records)
    }

    /// Returns everything buffered as a single record and empties the buffer.
    ///
    /// Used when a stream ends with a trailing partial record that should be
    /// delivered rather than held forever.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Returns `true` if no undelimited bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of undelimited bytes currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    /// The record delimiter.
    #[must_use]
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// The configured buffer cap.
    #[must_use]
    pub fn size_limit(&self) -> Option<NonZeroUsize> {
        self.size_limit
    }

    /// Looks for a delimiter that starts in the buffer and ends in `data`.
    ///
    /// Returns the length of the buffered record before the delimiter and
    /// the offset in `data` just past it.
    fn find_straddling(&self, data: &[u8]) -> Option<(usize, usize)> {
        let overlap = self.delimiter.len() - 1;
        if overlap == 0 || self.pending.is_empty() || data.is_empty() {
            return None;
        }

        let tail_start = self.pending.len().saturating_sub(overlap);
        let tail = &self.pending[tail_start..];
        let head = &data[..data.len().min(overlap)];

        let mut window = Vec::with_capacity(tail.len() + head.len());
        window.extend_from_slice(tail);
        window.extend_from_slice(head);

        // Both halves are shorter than the delimiter, so any match spans them.
        let pos = memmem::find(&window, &self.delimiter)?;
        Some((tail_start + pos, pos + self.delimiter.len() - tail.len()))
    }
}

/// Splits `data` on `delimiter`.
///
/// Returns the delimited pieces and the trailing remainder. The remainder is
/// empty when `data` ends exactly on a delimiter, which is how "delimiter at
/// end of chunk" is told apart from "no delimiter at all" (no pieces).
fn split_records<'a>(data: &'a [u8], delimiter: &[u8]) -> (Vec<&'a [u8]>, &'a [u8]) {
    let mut pieces = Vec::new();
    let mut start = 0;

    for pos in memmem::find_iter(data, delimiter) {
        pieces.push(&data[start..pos]);
        start = pos + delimiter.len();
    }

    (pieces, &data[start..])
}
