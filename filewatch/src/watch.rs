//! Polling file discovery and change classification.
//!
//! [`Watch`] expands glob patterns into a registry of regular files and, on
//! every tick, stats each of them and turns what changed into a
//! [`WatchEvent`] for a caller-supplied handler.
//!
//! # Architecture
//!
//! There are no kernel notifications involved: everything is derived from
//! comparing `stat` results between ticks. A tick runs in two phases:
//!
//! 1. Every newly registered file gets its create event
//!    ([`WatchEvent::CreateInitial`] if it existed when its pattern was first
//!    added, [`WatchEvent::Create`] otherwise). This always happens before
//!    any stat comparison, so a consumer sees a file's creation before its
//!    first modification.
//! 2. Every registered file is stat'ed. A vanished file yields
//!    [`WatchEvent::Delete`] and leaves the registry. A changed identity or a
//!    shrunk size yields `Delete` followed by `Create`, the rotation signal.
//!    Growth yields [`WatchEvent::Modify`].
//!
//! Glob patterns are re-expanded every `discover_interval` ticks by
//! [`Watch::run`], or on demand via [`Watch::discover`].
//!
//! # Example
//!
//! ```no_run
//! use std::convert::Infallible;
//! use filewatch::watch::Watch;
//!
//! let mut watch = Watch::new();
//! watch.exclude(["*.gz"])?;
//! watch.add_pattern("/var/log/*.log")?;
//!
//! watch.poll(|event, path| {
//!     println!("{event} {}", path.display());
//!     Ok::<(), Infallible>(())
//! }).unwrap();
//! # Ok::<(), glob::PatternError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glob::{Pattern, PatternError};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::file_id::FileId;

/// Lifecycle events emitted by [`Watch::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    /// The file was present when its pattern was first registered.
    CreateInitial,
    /// The file appeared later, or replaced a rotated file at the same path.
    Create,
    /// The file grew.
    Modify,
    /// The file vanished, or is about to be reported again as a `Create`
    /// because it was rotated.
    Delete,
}

impl WatchEvent {
    /// Returns the event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInitial => "create_initial",
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    /// Returns `true` for either create variant.
    #[must_use]
    pub const fn is_create(&self) -> bool {
        matches!(self, Self::CreateInitial | Self::Create)
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry for one watched path.
#[derive(Debug)]
struct WatchedFile {
    /// Identity as of the last stat.
    identity: FileId,
    /// Registered by the first discovery pass of its pattern.
    initial: bool,
    /// Size as of the last poll; 0 until the first poll.
    last_size: u64,
    create_emitted: bool,
}

impl WatchedFile {
    /// Marks the path as replaced. Until its `Create` has been handled, the
    /// next tick reports it again.
    fn rotated(&mut self) {
        self.initial = false;
        self.create_emitted = false;
    }
}

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    wake: Notify,
}

/// Requests a cooperative stop of [`Watch::run`].
///
/// The handle can be cloned and sent to another task. A stop is honoured
/// between ticks only: the tick in progress always runs to completion, and
/// the inter-tick sleep is cut short.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    /// Asks the run loop to exit after the current tick.
    pub fn stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Returns `true` if a stop has been requested and not yet honoured.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Sleeps for `interval` or until a stop is requested.
    ///
    /// A wakeup left over from a stop that was already honoured is consumed
    /// without ending the sleep.
    async fn sleep(&self, interval: Duration) {
        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return,
                () = self.inner.wake.notified() => {
                    if self.is_stopped() {
                        return;
                    }
                }
            }
        }
    }
}

/// Glob-driven registry of polled files.
#[derive(Debug, Default)]
pub struct Watch {
    /// Registered glob patterns, in registration order.
    patterns: Vec<String>,

    /// Basename patterns excluded from discovery.
    exclude: Vec<Pattern>,

    /// Watched files keyed by path. Ordered so ticks are deterministic.
    files: BTreeMap<PathBuf, WatchedFile>,

    stop: StopHandle,
}

impl Watch {
    /// Creates an empty watch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a glob pattern and runs its initial discovery pass.
    ///
    /// Files matched by this first pass are reported with
    /// [`WatchEvent::CreateInitial`]. Registering the same pattern twice is a
    /// no-op and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid glob.
    pub fn add_pattern(&mut self, pattern: &str) -> Result<bool, PatternError> {
        if self.patterns.iter().any(|p| p == pattern) {
            return Ok(false);
        }

        self.discover_pattern(pattern, true)?;
        self.patterns.push(pattern.to_string());

        info!(pattern, files = self.files.len(), "Watching pattern");
        Ok(true)
    }

    /// Adds basename patterns that discovery must skip.
    ///
    /// Exclusions apply to files discovered from now on; files already
    /// registered stay registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is not a valid glob. Patterns before
    /// the invalid one are kept.
    pub fn exclude<I, S>(&mut self, patterns: I) -> Result<(), PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if self.exclude.iter().any(|p| p.as_str() == pattern) {
                continue;
            }
            self.exclude.push(Pattern::new(pattern)?);
        }
        Ok(())
    }

    /// Re-expands every registered pattern, registering new files.
    pub fn discover(&mut self) {
        let patterns = std::mem::take(&mut self.patterns);
        for pattern in &patterns {
            if let Err(e) = self.discover_pattern(pattern, false) {
                // Patterns are validated when added.
                warn!(pattern = %pattern, error = %e, "Glob pattern failed to expand");
            }
        }
        self.patterns = patterns;
    }

    /// Runs one synchronous tick, reporting events to `handler`.
    ///
    /// # Errors
    ///
    /// Stops at the first error returned by `handler` and returns it. Files
    /// not yet compared in this tick are compared on the next one.
    pub fn poll<F, E>(&mut self, mut handler: F) -> Result<(), E>
    where
        F: FnMut(WatchEvent, &Path) -> Result<(), E>,
    {
        for (path, file) in &mut self.files {
            if file.create_emitted {
                continue;
            }
            file.create_emitted = true;
            let event = if file.initial {
                WatchEvent::CreateInitial
            } else {
                WatchEvent::Create
            };
            handler(event, path)?;
        }

        let paths: Vec<PathBuf> = self.files.keys().cloned().collect();
        for path in paths {
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.files.remove(&path);
                    debug!(path = %path.display(), "Stat failed, file removed");
                    handler(WatchEvent::Delete, &path)?;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat watched file");
                    continue;
                }
            };

            let Some(file) = self.files.get_mut(&path) else {
                continue;
            };

            let identity = FileId::from_metadata(&metadata);
            let size = metadata.len();
            let old_identity = std::mem::replace(&mut file.identity, identity);
            let old_size = std::mem::replace(&mut file.last_size, size);

            if identity != old_identity {
                debug!(
                    path = %path.display(),
                    old = %old_identity,
                    new = %identity,
                    "Identity changed, file rotated"
                );
                file.rotated();
                handler(WatchEvent::Delete, &path)?;
                file.create_emitted = true;
                handler(WatchEvent::Create, &path)?;
            } else if size < old_size {
                debug!(
                    path = %path.display(),
                    old_size,
                    new_size = size,
                    "File shrank, treating as rotated"
                );
                file.rotated();
                handler(WatchEvent::Delete, &path)?;
                file.create_emitted = true;
                handler(WatchEvent::Create, &path)?;
            } else if size > old_size {
                trace!(path = %path.display(), old_size, new_size = size, "File grew");
                handler(WatchEvent::Modify, &path)?;
            }
        }

        Ok(())
    }

    /// Polls every `stat_interval` until stopped.
    ///
    /// Patterns are re-expanded every `discover_interval` ticks; 0 disables
    /// re-discovery. The loop exits after the tick during which
    /// [`stop`](Self::stop) was requested, or as soon as `handler` fails.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `handler`.
    pub async fn run<F, E>(
        &mut self,
        mut handler: F,
        stat_interval: Duration,
        discover_interval: u32,
    ) -> Result<(), E>
    where
        F: FnMut(WatchEvent, &Path) -> Result<(), E>,
    {
        debug!(?stat_interval, discover_interval, "Starting poll loop");

        let mut ticks = 0u32;
        let result = loop {
            if let Err(e) = self.poll(&mut handler) {
                break Err(e);
            }

            ticks += 1;
            if discover_interval > 0 && ticks >= discover_interval {
                self.discover();
                ticks = 0;
            }

            if self.stop.is_stopped() {
                break Ok(());
            }
            self.stop.sleep(stat_interval).await;
            if self.stop.is_stopped() {
                break Ok(());
            }
        };

        self.stop.clear();
        debug!("Poll loop stopped");
        result
    }

    /// Requests [`run`](Self::run) to exit after the current tick.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Returns a handle that can stop the run loop from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Registered glob patterns.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns `true` if `path` is in the registry.
    #[must_use]
    pub fn is_watching(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Registered paths, in tick order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// Number of registered files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if no files are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn discover_pattern(&mut self, pattern: &str, initial: bool) -> Result<(), PatternError> {
        for entry in glob::glob(pattern)? {
            match entry {
                Ok(path) => self.register(path, initial),
                Err(e) => {
                    debug!(pattern, path = %e.path().display(), error = %e, "Skipping unreadable glob entry");
                }
            }
        }
        Ok(())
    }

    fn register(&mut self, path: PathBuf, initial: bool) {
        if self.files.contains_key(&path) {
            return;
        }

        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unstattable match");
                return;
            }
        };

        if let Some(pattern) = self.excluded_by(&path) {
            debug!(path = %path.display(), exclude = pattern, "Skipping excluded file");
            return;
        }

        debug!(path = %path.display(), initial, "Discovered file");
        self.files.insert(
            path,
            WatchedFile {
                identity: FileId::from_metadata(&metadata),
                initial,
                last_size: 0,
                create_emitted: false,
            },
        );
    }

    /// Returns the exclude pattern matching the basename of `path`, if any.
    fn excluded_by(&self, path: &Path) -> Option<&str> {
        let name = path.file_name()?.to_string_lossy();
        self.exclude
            .iter()
            .find(|pattern| pattern.matches(&name))
            .map(Pattern::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    type Events = Vec<(WatchEvent, PathBuf)>;

    fn collect(watch: &mut Watch) -> Events {
        let mut events = Vec::new();
        watch
            .poll(|event, path| {
                events.push((event, path.to_path_buf()));
                Ok::<(), Infallible>(())
            })
            .unwrap();
        events
    }

    fn kinds(events: &Events) -> Vec<WatchEvent> {
        events.iter().map(|(event, _)| *event).collect()
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn pattern(dir: &TempDir, glob: &str) -> String {
        dir.path().join(glob).to_string_lossy().into_owned()
    }

    /// Registers `*.log` in `dir` and drains the initial create event.
    fn watching(dir: &TempDir) -> Watch {
        let mut watch = Watch::new();
        watch.add_pattern(&pattern(dir, "*.log")).unwrap();
        collect(&mut watch);
        watch
    }

    #[test]
    fn test_event_names() {
        assert_eq!(WatchEvent::CreateInitial.to_string(), "create_initial");
        assert_eq!(WatchEvent::Create.to_string(), "create");
        assert_eq!(WatchEvent::Modify.to_string(), "modify");
        assert_eq!(WatchEvent::Delete.to_string(), "delete");
        assert!(WatchEvent::CreateInitial.is_create());
        assert!(!WatchEvent::Modify.is_create());
    }

    #[test]
    fn test_exclude_filters_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), "a\n").unwrap();
        fs::write(dir.path().join("app.log.gz"), "gz").unwrap();

        let mut watch = Watch::new();
        watch.exclude(["*.gz"]).unwrap();
        watch.add_pattern(&pattern(&dir, "app.log*")).unwrap();

        assert_eq!(watch.len(), 1);
        assert!(watch.is_watching(&dir.path().join("app.log")));
        assert!(!watch.is_watching(&dir.path().join("app.log.gz")));
    }

    #[test]
    fn test_exclude_does_not_match_directory_components() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("archive");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("app.log"), "a\n").unwrap();

        let mut watch = Watch::new();
        watch.exclude(["archive*"]).unwrap();
        watch.add_pattern(&pattern(&dir, "*/*.log")).unwrap();

        assert_eq!(watch.len(), 1);
    }

    #[test]
    fn test_directories_are_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("dir.log")).unwrap();
        fs::write(dir.path().join("file.log"), "").unwrap();

        let watch = watching(&dir);
        assert_eq!(watch.paths().collect::<Vec<_>>(), vec![dir.path().join("file.log")]);
    }

    #[test]
    fn test_add_pattern_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = Watch::new();

        assert!(watch.add_pattern(&pattern(&dir, "*.log")).unwrap());
        assert!(!watch.add_pattern(&pattern(&dir, "*.log")).unwrap());
        assert_eq!(watch.patterns().len(), 1);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut watch = Watch::new();
        assert!(watch.add_pattern("/tmp/[unclosed").is_err());
        assert!(watch.patterns().is_empty());
        assert!(watch.exclude(["[bad"]).is_err());
    }

    #[test]
    fn test_initial_files_get_create_initial_before_modify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "existing\n").unwrap();

        let mut watch = Watch::new();
        watch.add_pattern(&pattern(&dir, "*.log")).unwrap();

        let events = collect(&mut watch);
        assert_eq!(
            events,
            vec![(WatchEvent::CreateInitial, path.clone()), (WatchEvent::Modify, path)]
        );
    }

    #[test]
    fn test_later_files_get_create() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = watching(&dir);

        let path = dir.path().join("new.log");
        fs::write(&path, "").unwrap();

        assert!(collect(&mut watch).is_empty(), "not discovered yet");

        watch.discover();
        assert_eq!(collect(&mut watch), vec![(WatchEvent::Create, path)]);
    }

    #[test]
    fn test_growth_emits_single_modify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut watch = watching(&dir);

        append(&path, "one\n");
        append(&path, "two\n");
        assert_eq!(kinds(&collect(&mut watch)), vec![WatchEvent::Modify]);
    }

    #[test]
    fn test_no_change_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), "stable\n").unwrap();
        let mut watch = watching(&dir);

        assert!(collect(&mut watch).is_empty());
        assert!(collect(&mut watch).is_empty());
    }

    #[test]
    fn test_truncation_emits_delete_then_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a fairly long line\n").unwrap();
        let mut watch = watching(&dir);

        fs::write(&path, "short\n").unwrap();
        assert_eq!(
            collect(&mut watch),
            vec![(WatchEvent::Delete, path.clone()), (WatchEvent::Create, path)]
        );

        // The shrunk size is the new baseline.
        assert!(collect(&mut watch).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_change_emits_delete_then_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "old\n").unwrap();
        let mut watch = watching(&dir);

        // Keep the rotated file alive so its inode is not reused.
        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        fs::write(&path, "new content that is longer\n").unwrap();

        assert_eq!(
            kinds(&collect(&mut watch)),
            vec![WatchEvent::Delete, WatchEvent::Create]
        );
        assert!(collect(&mut watch).is_empty());

        append(&path, "more\n");
        assert_eq!(kinds(&collect(&mut watch)), vec![WatchEvent::Modify]);
    }

    #[test]
    fn test_removed_file_emits_delete_and_leaves_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "x\n").unwrap();
        let mut watch = watching(&dir);

        fs::remove_file(&path).unwrap();
        assert_eq!(collect(&mut watch), vec![(WatchEvent::Delete, path.clone())]);
        assert!(!watch.is_watching(&path));
        assert!(collect(&mut watch).is_empty());

        // Reappearing later is a plain create.
        fs::write(&path, "y\n").unwrap();
        watch.discover();
        assert_eq!(
            kinds(&collect(&mut watch)),
            vec![WatchEvent::Create, WatchEvent::Modify]
        );
    }

    #[test]
    fn test_handler_error_aborts_tick() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), "").unwrap();
        fs::write(dir.path().join("b.log"), "").unwrap();

        let mut watch = Watch::new();
        watch.add_pattern(&pattern(&dir, "*.log")).unwrap();

        let mut seen = 0;
        let result = watch.poll(|_, _| {
            seen += 1;
            Err("boom")
        });

        assert_eq!(result, Err("boom"));
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_run_stops_after_requested_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();

        let mut watch = Watch::new();
        watch.add_pattern(&pattern(&dir, "*.log")).unwrap();
        let stop = watch.stop_handle();

        let mut events = Vec::new();
        let result = watch
            .run(
                |event, _| {
                    events.push(event);
                    stop.stop();
                    Ok::<(), Infallible>(())
                },
                Duration::from_millis(10),
                1,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(events, vec![WatchEvent::CreateInitial]);
        assert!(!watch.stop_handle().is_stopped(), "flag cleared on exit");
    }

    #[test]
    fn test_rotation_create_survives_failed_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "old").unwrap();
        let mut watch = watching(&dir);
        collect(&mut watch);

        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        fs::write(&path, "new").unwrap();

        let mut seen = Vec::new();
        let result = watch.poll(|event, _| {
            seen.push(event);
            if event == WatchEvent::Delete {
                Err("read failed")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("read failed"));
        assert_eq!(seen, vec![WatchEvent::Delete]);

        // The replacement is still announced on the following tick.
        assert_eq!(kinds(&collect(&mut watch)), vec![WatchEvent::Create]);
        assert!(collect(&mut watch).is_empty());
    }

    #[tokio::test]
    async fn test_honoured_stop_does_not_cut_next_sleep_short() {
        let stop = StopHandle::default();
        // Requested mid-tick: nobody is waiting, so the wakeup is stored.
        stop.stop();
        stop.clear();

        let interval = Duration::from_millis(100);
        let started = std::time::Instant::now();
        stop.sleep(interval).await;
        assert!(started.elapsed() >= interval);
    }

    #[tokio::test]
    async fn test_run_discovers_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = Watch::new();
        watch.add_pattern(&pattern(&dir, "*.log")).unwrap();
        let stop = watch.stop_handle();

        let path = dir.path().join("late.log");
        fs::write(&path, "").unwrap();

        let mut events = Vec::new();
        watch
            .run(
                |event, path| {
                    events.push((event, path.to_path_buf()));
                    stop.stop();
                    Ok::<(), Infallible>(())
                },
                Duration::from_millis(5),
                1,
            )
            .await
            .unwrap();

        assert_eq!(events, vec![(WatchEvent::Create, path)]);
    }

    #[tokio::test]
    async fn test_stop_from_another_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = Watch::new();
        watch.add_pattern(&pattern(&dir, "*.log")).unwrap();

        let stop = watch.stop_handle();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop.stop();
        });

        // A one hour interval would hang the test if the stop did not cut
        // the sleep short.
        let run = watch.run(
            |_, _| Ok::<(), Infallible>(()),
            Duration::from_secs(3600),
            0,
        );
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run loop should stop")
            .unwrap();

        stopper.await.unwrap();
    }
}
