//! Configuration for [`Tail`](crate::tail::Tail).
//!
//! [`TailConfig`] can be built in code (every field has a default) or from
//! environment variables with [`TailConfig::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SINCEDB_PATH` | `~/.sincedb` | Position store location |
//! | `FILEWATCH_DELIMITER` | `\n` | Record delimiter (`\n`, `\r`, `\t`, `\\` escapes allowed) |
//! | `FILEWATCH_SIZE_LIMIT` | unlimited | Max undelimited bytes buffered per file |
//! | `FILEWATCH_STAT_INTERVAL_SECS` | 1 | Seconds between polls (fractions allowed) |
//! | `FILEWATCH_DISCOVER_INTERVAL` | 5 | Polls between glob re-expansions (0 disables) |
//! | `FILEWATCH_SINCEDB_WRITE_INTERVAL_SECS` | 10 | Minimum seconds between sincedb writes |
//! | `FILEWATCH_START_POSITION` | `end` | `beginning` or `end` for never-seen files |
//! | `FILEWATCH_EXCLUDE` | (none) | Comma-separated basename globs to skip |
//! | `FILEWATCH_OPEN_WARN_INTERVAL` | 300 | Seconds between repeated open-failure warnings |
//!
//! # Example
//!
//! ```no_run
//! use filewatch::config::{StartPosition, TailConfig};
//!
//! let config = TailConfig {
//!     start_position: StartPosition::Beginning,
//!     exclude: vec!["*.gz".to_string()],
//!     ..TailConfig::from_env().expect("invalid environment")
//! };
//! println!("sincedb at {}", config.resolve_sincedb_path().unwrap().display());
//! ```

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;

use crate::error::ConfigError;

/// Default seconds between polls.
const DEFAULT_STAT_INTERVAL_SECS: u64 = 1;

/// Default polls between glob re-expansions.
const DEFAULT_DISCOVER_INTERVAL: u32 = 5;

/// Default minimum seconds between sincedb writes.
const DEFAULT_SINCEDB_WRITE_INTERVAL_SECS: u64 = 10;

/// Default seconds between repeated open-failure warnings for one path.
const DEFAULT_OPEN_WARN_INTERVAL_SECS: u64 = 300;

/// Sincedb file name relative to home.
const DEFAULT_SINCEDB_FILE: &str = ".sincedb";

/// Environment override for the sincedb location.
pub const SINCEDB_PATH_ENV: &str = "SINCEDB_PATH";

/// Where to start reading a file that has no sincedb entry and was present
/// when its pattern was first registered.
///
/// Files that appear later, including rotated replacements, are always read
/// from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Read pre-existing content.
    Beginning,
    /// Skip pre-existing content, follow only new writes.
    #[default]
    End,
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::End => f.write_str("end"),
        }
    }
}

impl FromStr for StartPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" => Ok(Self::Beginning),
            "end" => Ok(Self::End),
            other => Err(format!("expected 'beginning' or 'end', got '{other}'")),
        }
    }
}

/// Options recognised by [`Tail`](crate::tail::Tail).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailConfig {
    /// Record delimiter.
    pub delimiter: String,

    /// Cap on undelimited bytes buffered per file; `None` for unlimited.
    pub size_limit: Option<NonZeroUsize>,

    /// Time between polls.
    pub stat_interval: Duration,

    /// Polls between glob re-expansions; 0 disables re-discovery.
    pub discover_interval: u32,

    /// Minimum time between sincedb writes.
    pub sincedb_write_interval: Duration,

    /// Start position for files with no sincedb entry.
    pub start_position: StartPosition,

    /// Basename globs excluded from discovery.
    pub exclude: Vec<String>,

    /// Explicit sincedb location. When `None` the location is taken from
    /// `SINCEDB_PATH`, then `~/.sincedb`.
    pub sincedb_path: Option<PathBuf>,

    /// Time during which repeated open failures for the same path are logged
    /// at debug level instead of warn.
    pub open_warn_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            delimiter: "\n".to_string(),
            size_limit: None,
            stat_interval: Duration::from_secs(DEFAULT_STAT_INTERVAL_SECS),
            discover_interval: DEFAULT_DISCOVER_INTERVAL,
            sincedb_write_interval: Duration::from_secs(DEFAULT_SINCEDB_WRITE_INTERVAL_SECS),
            start_position: StartPosition::End,
            exclude: Vec::new(),
            sincedb_path: None,
            open_warn_interval: Duration::from_secs(DEFAULT_OPEN_WARN_INTERVAL_SECS),
        }
    }
}

impl TailConfig {
    /// Creates a configuration from the defaults overlaid with `FILEWATCH_*`
    /// environment variables.
    ///
    /// `SINCEDB_PATH` is not read here; it is consulted by
    /// [`resolve_sincedb_path`](Self::resolve_sincedb_path) so an explicit
    /// path always wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for any variable that is set but
    /// cannot be parsed or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Not trimmed: whitespace is a legitimate delimiter.
        if let Ok(val) = env::var("FILEWATCH_DELIMITER") {
            if !val.is_empty() {
                config.delimiter = unescape(&val);
            }
        }

        if let Some(val) = env_var("FILEWATCH_SIZE_LIMIT") {
            let limit = val.parse::<usize>().map_err(|_| {
                invalid(
                    "FILEWATCH_SIZE_LIMIT",
                    format!("expected positive integer, got '{val}'"),
                )
            })?;
            config.size_limit = Some(NonZeroUsize::new(limit).ok_or_else(|| {
                invalid("FILEWATCH_SIZE_LIMIT", "size limit must be greater than 0")
            })?);
        }

        if let Some(val) = env_var("FILEWATCH_STAT_INTERVAL_SECS") {
            config.stat_interval = parse_secs("FILEWATCH_STAT_INTERVAL_SECS", &val)?;
        }

        if let Some(val) = env_var("FILEWATCH_DISCOVER_INTERVAL") {
            config.discover_interval = val.parse::<u32>().map_err(|_| {
                invalid(
                    "FILEWATCH_DISCOVER_INTERVAL",
                    format!("expected non-negative integer, got '{val}'"),
                )
            })?;
        }

        if let Some(val) = env_var("FILEWATCH_SINCEDB_WRITE_INTERVAL_SECS") {
            config.sincedb_write_interval =
                parse_secs("FILEWATCH_SINCEDB_WRITE_INTERVAL_SECS", &val)?;
        }

        if let Some(val) = env_var("FILEWATCH_START_POSITION") {
            config.start_position = val
                .parse::<StartPosition>()
                .map_err(|message| invalid("FILEWATCH_START_POSITION", message))?;
        }

        if let Some(val) = env_var("FILEWATCH_EXCLUDE") {
            config.exclude = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = env_var("FILEWATCH_OPEN_WARN_INTERVAL") {
            config.open_warn_interval = parse_secs("FILEWATCH_OPEN_WARN_INTERVAL", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values that cannot be expressed by the field types alone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the delimiter is empty or the
    /// stat interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delimiter.is_empty() {
            return Err(invalid("delimiter", "delimiter must not be empty"));
        }
        if self.stat_interval.is_zero() {
            return Err(invalid("stat_interval", "stat interval must be greater than 0"));
        }
        Ok(())
    }

    /// Resolves where the sincedb lives.
    ///
    /// Order: [`sincedb_path`](Self::sincedb_path), then `SINCEDB_PATH`, then
    /// `.sincedb` in the home directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSincedbPath`] if none of them is available.
    /// There is no safe fallback for recovery state.
    pub fn resolve_sincedb_path(&self) -> Result<PathBuf, ConfigError> {
        let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        resolve_sincedb_path(
            self.sincedb_path.clone(),
            env::var_os(SINCEDB_PATH_ENV),
            home,
        )
    }
}

fn resolve_sincedb_path(
    explicit: Option<PathBuf>,
    from_env: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }
    if let Some(path) = from_env.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    home.map(|home| home.join(DEFAULT_SINCEDB_FILE))
        .ok_or(ConfigError::NoSincedbPath)
}

/// Reads an environment variable, trimmed, ignoring blank values.
fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_secs(key: &str, val: &str) -> Result<Duration, ConfigError> {
    let secs = val
        .trim()
        .parse::<f64>()
        .map_err(|_| invalid(key, format!("expected number of seconds, got '{val}'")))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(key, format!("expected non-negative number of seconds, got '{val}'")))
}

/// Expands `\n`, `\r`, `\t` and `\\`; other backslashes are kept literally.
fn unescape(val: &str) -> String {
    let mut out = String::with_capacity(val.len());
    let mut chars = val.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
