//! Error types for filewatch.
//!
//! Per-file problems (open failures, read errors, failed sincedb writes) are
//! logged and retried by the poll loop and never surface here. What does
//! surface is either fatal at construction time ([`ConfigError`], invalid glob
//! patterns) or a signal the caller must act on ([`FilewatchError::Overflow`]).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No location for the position store could be resolved.
    #[error(
        "no sincedb path configured and neither SINCEDB_PATH nor a home directory is available"
    )]
    NoSincedbPath,

    /// A configuration value is out of range or unparseable.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by [`BufferedTokenizer`](crate::tokenizer::BufferedTokenizer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    /// Undelimited data would exceed the configured buffer cap.
    #[error("input buffer full: {buffered} undelimited bytes exceeds limit of {limit}")]
    Overflow {
        /// Bytes that would have been buffered.
        buffered: usize,
        /// Configured cap.
        limit: usize,
    },
}

/// Errors surfaced to callers of [`Watch`](crate::watch::Watch) and
/// [`Tail`](crate::tail::Tail).
#[derive(Error, Debug)]
pub enum FilewatchError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A watch or exclude glob pattern failed to compile.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A followed file produced more undelimited data than the tokenizer cap.
    ///
    /// The producer is not writing delimiters as expected. Nothing past the
    /// last complete record is marked as read, so the data is not lost.
    #[error("tokenizer overflow on {}: {buffered} undelimited bytes exceeds limit of {limit}", .path.display())]
    Overflow {
        /// The offending stream.
        path: PathBuf,
        /// Bytes that would have been buffered.
        buffered: usize,
        /// Configured cap.
        limit: usize,
    },
}

impl FilewatchError {
    /// Attaches the stream path to a tokenizer error.
    pub(crate) fn overflow(path: impl Into<PathBuf>, err: TokenizerError) -> Self {
        match err {
            TokenizerError::Overflow { buffered, limit } => Self::Overflow {
                path: path.into(),
                buffered,
                limit,
            },
        }
    }
}

/// A specialized `Result` type for filewatch operations.
pub type Result<T> = std::result::Result<T, FilewatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_no_sincedb_path_display() {
        let err = ConfigError::NoSincedbPath;
        assert!(err.to_string().starts_with("no sincedb path configured"));
    }

    #[test]
    fn config_error_invalid_value_display() {
        let err = ConfigError::InvalidValue {
            key: "FILEWATCH_SIZE_LIMIT".to_string(),
            message: "expected positive integer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for FILEWATCH_SIZE_LIMIT: expected positive integer"
        );
    }

    #[test]
    fn tokenizer_error_display() {
        let err = TokenizerError::Overflow {
            buffered: 10,
            limit: 4,
        };
        assert_eq!(
            err.to_string(),
            "input buffer full: 10 undelimited bytes exceeds limit of 4"
        );
    }

    #[test]
    fn filewatch_error_overflow_names_stream() {
        let err = FilewatchError::overflow(
            "/var/log/app.log",
            TokenizerError::Overflow {
                buffered: 10,
                limit: 4,
            },
        );
        assert!(matches!(err, FilewatchError::Overflow { buffered: 10, limit: 4, .. }));
        assert_eq!(
            err.to_string(),
            "tokenizer overflow on /var/log/app.log: 10 undelimited bytes exceeds limit of 4"
        );
    }

    #[test]
    fn filewatch_error_config_display() {
        let err: FilewatchError = ConfigError::NoSincedbPath.into();
        assert!(matches!(err, FilewatchError::Config(_)));
        assert!(err.to_string().starts_with("configuration error: no sincedb path"));
    }

    #[test]
    fn filewatch_error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FilewatchError = io_err.into();
        assert!(matches!(err, FilewatchError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn filewatch_error_pattern_conversion() {
        let pattern_err = glob::Pattern::new("[unclosed").unwrap_err();
        let err: FilewatchError = pattern_err.into();
        assert!(matches!(err, FilewatchError::Pattern(_)));
        assert!(err.to_string().starts_with("invalid glob pattern"));
    }
}
