//! Single-file change watcher.
//!
//! Two independent sources feed one debounce timer:
//! - push notifications from `notify`, watching the file's parent directory so
//!   atomic saves (write temp + rename) are seen
//! - a fixed-interval poll comparing size and mtime
//!
//! Every raw trigger restarts the timer; only its expiry emits a signal, so a
//! burst of writes yields one [`WatchSignal::Changed`].

pub mod debounce;

use crate::utils::errors::{Result, SnapkeepError};
use debounce::DebounceTimer;
use notify::event::{AccessKind, AccessMode, MetadataKind, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queued signals per watcher
const SIGNAL_CAPACITY: usize = 16;

/// Upper bound on waiting for the driver task during `stop`
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Logical signals emitted to the owner of the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// The file settled after one or more writes
    Changed(PathBuf),
    /// The file disappeared
    Removed(PathBuf),
    /// Observation failed; watching continues
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
    /// Deadline for a single poll probe
    pub probe_timeout: Duration,
}

impl WatchOptions {
    pub fn new(poll_interval: Duration, debounce: Duration) -> Self {
        Self {
            poll_interval,
            debounce,
            probe_timeout: poll_interval,
        }
    }
}

enum RawTrigger {
    Notify,
    Failure(String),
}

pub struct ChangeWatcher {
    state: WatcherState,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    notifier: Option<RecommendedWatcher>,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self {
            state: WatcherState::Stopped,
            cancel: CancellationToken::new(),
            driver: None,
            notifier: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Begin watching `path`. Must be called within a tokio runtime.
    pub fn start(
        &mut self,
        path: &Path,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<WatchSignal>> {
        if self.state != WatcherState::Stopped {
            return Err(SnapkeepError::AlreadyRunning(path.to_path_buf()));
        }
        let initial =
            std::fs::metadata(path).map_err(|_| SnapkeepError::NotFound(path.to_path_buf()))?;

        self.state = WatcherState::Starting;
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        self.notifier = match spawn_notifier(&target, raw_tx.clone()) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                warn!(
                    "Push notifications unavailable for {}, polling only: {}",
                    target.display(),
                    e
                );
                let message = format!("notification watch failed: {}", e);
                let _ = raw_tx.send(RawTrigger::Failure(message));
                None
            }
        };
        drop(raw_tx);

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        self.cancel = CancellationToken::new();

        let driver = Driver {
            path: path.to_path_buf(),
            poll_interval: options.poll_interval,
            probe_timeout: options.probe_timeout,
            timer: DebounceTimer::new(options.debounce),
            last_seen: Some(FileStamp::from(&initial)),
            reported_missing: false,
        };
        self.driver = Some(tokio::spawn(driver.run(raw_rx, signal_tx, self.cancel.clone())));
        self.state = WatcherState::Running;

        info!(
            "Watching {} (poll {:?}, debounce {:?})",
            path.display(),
            options.poll_interval,
            options.debounce
        );
        Ok(signal_rx)
    }

    /// Stop watching and release resources. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.notifier.take();

        if let Some(handle) = self.driver.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Watcher task did not stop in time, aborting");
                abort.abort();
            }
        }

        if self.state != WatcherState::Stopped {
            debug!("Watcher stopped");
        }
        self.state = WatcherState::Stopped;
    }
}

impl Default for ChangeWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_notifier(
    target: &Path,
    tx: mpsc::UnboundedSender<RawTrigger>,
) -> notify::Result<RecommendedWatcher> {
    let file_name: Option<OsString> = target.file_name().map(|n| n.to_os_string());
    let watch_dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if !is_content_event(&event.kind) {
                    return;
                }
                if event.paths.iter().any(|p| p.file_name() == file_name.as_deref()) {
                    let _ = tx.send(RawTrigger::Notify);
                }
            }
            Err(e) => {
                let _ = tx.send(RawTrigger::Failure(e.to_string()));
            }
        }
    })?;

    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Reads of the file (including our own fingerprinting) must not count as changes.
fn is_content_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => false,
        EventKind::Other => false,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl From<&std::fs::Metadata> for FileStamp {
    fn from(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

struct Driver {
    path: PathBuf,
    poll_interval: Duration,
    probe_timeout: Duration,
    timer: DebounceTimer,
    last_seen: Option<FileStamp>,
    reported_missing: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<RawTrigger>,
        signal_tx: mpsc::Sender<WatchSignal>,
        cancel: CancellationToken,
    ) {
        let first_poll = Instant::now() + self.poll_interval;
        let mut poll = tokio::time::interval_at(first_poll, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut raw_open = true;

        loop {
            let deadline = self.timer.deadline();
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = raw_rx.recv(), if raw_open => match trigger {
                    Some(RawTrigger::Notify) => {
                        self.timer.schedule();
                        None
                    }
                    Some(RawTrigger::Failure(message)) => {
                        warn!("Watch failure on {}: {}", self.path.display(), message);
                        Some(WatchSignal::Error(message))
                    }
                    None => {
                        raw_open = false;
                        None
                    }
                },
                _ = poll.tick() => match self.probe().await {
                    Ok(true) => {
                        self.timer.schedule();
                        None
                    }
                    Ok(false) => None,
                    Err(message) => Some(WatchSignal::Error(message)),
                },
                _ = debounce::sleep_until(deadline) => {
                    if self.timer.fire() { self.settle() } else { None }
                }
            };

            if let Some(signal) = signal {
                if signal_tx.send(signal).await.is_err() {
                    debug!("Watch signal receiver dropped");
                    break;
                }
            }
        }

        debug!("Watch driver for {} exited", self.path.display());
    }

    /// Poll source: has size or mtime moved since the last look?
    async fn probe(&mut self) -> std::result::Result<bool, String> {
        match tokio::time::timeout(self.probe_timeout, tokio::fs::metadata(&self.path)).await {
            Ok(Ok(meta)) => {
                let stamp = FileStamp::from(&meta);
                let changed = self.last_seen != Some(stamp);
                self.last_seen = Some(stamp);
                Ok(changed)
            }
            Ok(Err(e)) if e.kind() == IoErrorKind::NotFound => {
                let changed = self.last_seen.is_some();
                self.last_seen = None;
                Ok(changed)
            }
            Ok(Err(e)) => Err(format!("poll of {} failed: {}", self.path.display(), e)),
            Err(_) => Err(format!(
                "poll of {} timed out after {:?}",
                self.path.display(),
                self.probe_timeout
            )),
        }
    }

    /// Debounce expired: report what the file looks like now.
    fn settle(&mut self) -> Option<WatchSignal> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                self.last_seen = Some(FileStamp::from(&meta));
                self.reported_missing = false;
                Some(WatchSignal::Changed(self.path.clone()))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.last_seen = None;
                if self.reported_missing {
                    None
                } else {
                    self.reported_missing = true;
                    Some(WatchSignal::Removed(self.path.clone()))
                }
            }
            Err(e) => Some(WatchSignal::Error(format!(
                "stat of {} failed: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn driver(path: &Path, poll: Duration, debounce: Duration) -> Driver {
        Driver {
            path: path.to_path_buf(),
            poll_interval: poll,
            probe_timeout: poll,
            timer: DebounceTimer::new(debounce),
            last_seen: fs::metadata(path).ok().map(|m| FileStamp::from(&m)),
            reported_missing: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_single_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"content").unwrap();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let d = driver(&path, Duration::from_secs(3600), Duration::from_millis(1000));
        let handle = tokio::spawn(d.run(raw_rx, signal_tx, cancel.clone()));

        for _ in 0..3 {
            raw_tx.send(RawTrigger::Notify).ok().unwrap();
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(300)).await;
        }
        let last_trigger = Instant::now() - Duration::from_millis(300);

        let signal = signal_rx.recv().await.unwrap();
        assert_eq!(signal, WatchSignal::Changed(path.clone()));
        assert!(Instant::now() - last_trigger >= Duration::from_millis(1000));

        let extra = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv()).await;
        assert!(extra.is_err(), "burst must collapse into one signal");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_file_emits_removed_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"content").unwrap();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let d = driver(&path, Duration::from_secs(3600), Duration::from_millis(200));
        let handle = tokio::spawn(d.run(raw_rx, signal_tx, cancel.clone()));

        fs::remove_file(&path).unwrap();
        raw_tx.send(RawTrigger::Notify).ok().unwrap();
        assert_eq!(signal_rx.recv().await.unwrap(), WatchSignal::Removed(path.clone()));

        raw_tx.send(RawTrigger::Notify).ok().unwrap();
        let extra = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv()).await;
        assert!(extra.is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported_without_stopping() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"content").unwrap();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let d = driver(&path, Duration::from_secs(3600), Duration::from_millis(200));
        let handle = tokio::spawn(d.run(raw_rx, signal_tx, cancel.clone()));

        raw_tx
            .send(RawTrigger::Failure("permission denied".into()))
            .ok()
            .unwrap();
        assert_eq!(
            signal_rx.recv().await.unwrap(),
            WatchSignal::Error("permission denied".into())
        );

        raw_tx.send(RawTrigger::Notify).ok().unwrap();
        assert_eq!(signal_rx.recv().await.unwrap(), WatchSignal::Changed(path.clone()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_detects_change_without_notifications() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"before").unwrap();

        // No push source at all: the raw channel is closed from the start.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawTrigger>();
        drop(raw_tx);
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let d = driver(&path, Duration::from_millis(50), Duration::from_millis(100));
        let handle = tokio::spawn(d.run(raw_rx, signal_tx, cancel.clone()));

        fs::write(&path, b"after, with a different length").unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv())
            .await
            .expect("poll should detect the write");
        assert_eq!(signal, Some(WatchSignal::Changed(path.clone())));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let mut watcher = ChangeWatcher::new();
        let options = WatchOptions::new(Duration::from_millis(500), Duration::from_millis(100));

        let result = watcher.start(&dir.path().join("missing.txt"), options);

        assert!(matches!(result, Err(SnapkeepError::NotFound(_))));
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"content").unwrap();
        let options = WatchOptions::new(Duration::from_millis(500), Duration::from_millis(100));

        let mut watcher = ChangeWatcher::new();
        let _signals = watcher.start(&path, options).unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);
        assert!(matches!(
            watcher.start(&path, options),
            Err(SnapkeepError::AlreadyRunning(_))
        ));

        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);

        // Restartable after stop
        let _signals = watcher.start(&path, options).unwrap();
        watcher.stop().await;
    }

    #[test]
    fn test_reads_are_not_content_events() {
        assert!(!is_content_event(&EventKind::Access(AccessKind::Read)));
        assert!(!is_content_event(&EventKind::Access(AccessKind::Close(AccessMode::Read))));
        assert!(is_content_event(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
        assert!(is_content_event(&EventKind::Modify(ModifyKind::Any)));
    }
}
