//! Monitor controller: watcher + fingerprints + store as one start/stop-able session.
//!
//! Flow per signal:
//! - `Changed`: fingerprint the file, and if it differs from the last captured
//!   digest, create a backup and apply the retention limit
//! - `Removed`: report `not_found`, mark the session failed and stop
//! - `Error`: report and keep running
//!
//! Captures are single-flight per session. A change-triggered capture that finds
//! another capture in flight is queued: any number of such changes collapse
//! into one follow-up capture once the gate frees up. `force_backup` waits its
//! turn instead.

pub mod events;

use crate::config::MonitorConfig;
use crate::fs::fingerprint;
use crate::store::{BackupStore, CaptureOutcome, LedgerRepair};
use crate::utils::errors::{Result, SnapkeepError};
use crate::watcher::{ChangeWatcher, WatchOptions, WatchSignal};
use events::{EventBus, MonitorEvent};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on waiting for the session task during `stop`
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Failed(String),
}

/// Snapshot of the controller's current (or last) session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub source_path: Option<PathBuf>,
    pub last_digest: Option<String>,
    pub running: bool,
}

/// Per-session state shared between the controller and the session task.
struct Session {
    source_path: PathBuf,
    max_backups: usize,
    last_digest: Mutex<Option<String>>,
    capture_gate: Mutex<()>,
    /// A change arrived while the gate was held
    change_pending: AtomicBool,
    state: RwLock<SessionState>,
    store: Arc<BackupStore>,
    events: EventBus,
}

/// Runtime resources of the active session. The task owns the watcher and
/// releases it when the session ends, whether stopped or failed.
struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MonitorController {
    store: Arc<BackupStore>,
    events: EventBus,
    active: Mutex<Option<ActiveSession>>,
    current: RwLock<Option<Arc<Session>>>,
}

impl MonitorController {
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self {
            store,
            events: EventBus::new(),
            active: Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    /// Open the archive named by `config` and build a controller around it
    pub async fn open(config: &MonitorConfig) -> Result<Self> {
        let store = BackupStore::open(&config.archive_path, config.duplicate_policy).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<BackupStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Start watching `config.source_path`.
    ///
    /// Takes one backup immediately, so a session always has at least one
    /// capture unless the source is empty.
    pub async fn start(&self, config: &MonitorConfig) -> Result<()> {
        config.validate()?;
        if config.archive_path != self.store.archive_dir() {
            return Err(SnapkeepError::Config(format!(
                "archive_path {} does not match the controller's archive {}",
                config.archive_path.display(),
                self.store.archive_dir().display()
            )));
        }

        let mut active = self.active.lock().await;
        if let Some(session) = self.current.read().await.as_ref() {
            if session.is_running().await {
                return Err(SnapkeepError::AlreadyRunning(session.source_path.clone()));
            }
        }
        if let Some(stale) = active.take() {
            stale.shutdown().await;
        }

        if !config.source_path.exists() {
            return Err(SnapkeepError::NotFound(config.source_path.clone()));
        }
        let initial_digest = fingerprint::digest(&config.source_path).await?;

        let repairs = self.store.subscribe_repairs();
        let mut watcher = ChangeWatcher::new();
        let signals = watcher.start(
            &config.source_path,
            WatchOptions::new(
                Duration::from_millis(config.poll_interval_ms),
                Duration::from_millis(config.debounce_ms),
            ),
        )?;

        let session = Arc::new(Session {
            source_path: config.source_path.clone(),
            max_backups: config.max_backups,
            last_digest: Mutex::new(None),
            capture_gate: Mutex::new(()),
            change_pending: AtomicBool::new(false),
            state: RwLock::new(SessionState::Running),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        });
        *self.current.write().await = Some(Arc::clone(&session));

        info!(
            "Monitoring {} into {} (keeping {} backups)",
            config.source_path.display(),
            self.store.archive_dir().display(),
            config.max_backups
        );
        self.events.emit(MonitorEvent::Started {
            path: config.source_path.clone(),
        });

        // Signals queue up until the session task starts, so nothing observed
        // during the initial capture is lost.
        if let Ok(CaptureOutcome::SkippedEmpty) = session.capture_forced().await {
            *session.last_digest.lock().await = Some(initial_digest);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Session::run(
            Arc::clone(&session),
            watcher,
            signals,
            repairs,
            cancel.clone(),
        ));
        *active = Some(ActiveSession { cancel, task });
        Ok(())
    }

    /// Capture now, regardless of whether the content changed.
    pub async fn force_backup(&self) -> Result<CaptureOutcome> {
        let session = self.running_session().await.ok_or(SnapkeepError::NotRunning)?;
        session.capture_forced().await
    }

    /// Stop the session. Safe to call when nothing is running.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(resources) = active.take() else {
            return;
        };

        let session = self.current.read().await.clone();
        let was_running = match &session {
            Some(session) => session.is_running().await,
            None => false,
        };

        resources.shutdown().await;

        if let (true, Some(session)) = (was_running, session) {
            *session.state.write().await = SessionState::Stopped;
            info!("Stopped monitoring {}", session.source_path.display());
            self.events.emit(MonitorEvent::Stopped);
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let current = self.current.read().await.clone();
        match current {
            None => SessionStatus {
                state: SessionState::Idle,
                source_path: None,
                last_digest: None,
                running: false,
            },
            Some(session) => {
                let state = session.state.read().await.clone();
                SessionStatus {
                    running: state == SessionState::Running,
                    state,
                    source_path: Some(session.source_path.clone()),
                    last_digest: session.last_digest.lock().await.clone(),
                }
            }
        }
    }

    async fn running_session(&self) -> Option<Arc<Session>> {
        let session = self.current.read().await.clone()?;
        if session.is_running().await {
            Some(session)
        } else {
            None
        }
    }
}

impl ActiveSession {
    async fn shutdown(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, &mut self.task).await.is_err() {
            warn!("Session task did not stop in time, aborting");
            self.task.abort();
        }
    }
}

impl Session {
    async fn run(
        session: Arc<Session>,
        mut watcher: ChangeWatcher,
        mut signals: mpsc::Receiver<WatchSignal>,
        mut repairs: broadcast::Receiver<LedgerRepair>,
        cancel: CancellationToken,
    ) {
        let mut repairs_open = true;
        loop {
            let pending = session.change_pending.load(Ordering::SeqCst);
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => signal,
                _ = session.gate_released(), if pending => {
                    session.capture_on_change().await;
                    continue;
                }
                repair = repairs.recv(), if repairs_open => {
                    match repair {
                        Ok(repair) => session.report(&SnapkeepError::from(repair)),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => repairs_open = false,
                    }
                    continue;
                }
            };

            match signal {
                Some(WatchSignal::Changed(path)) => {
                    session.events.emit(MonitorEvent::Changed { path });
                    session.capture_on_change().await;
                }
                Some(WatchSignal::Removed(path)) => {
                    let err = SnapkeepError::NotFound(path);
                    session.report(&err);
                    *session.state.write().await = SessionState::Failed(err.to_string());
                    session.events.emit(MonitorEvent::Stopped);
                    break;
                }
                Some(WatchSignal::Error(message)) => session.report(&SnapkeepError::Watch(message)),
                None => break,
            }
        }
        watcher.stop().await;
        debug!("Session loop for {} exited", session.source_path.display());
    }

    /// Resolves once no capture holds the gate
    async fn gate_released(&self) {
        drop(self.capture_gate.lock().await);
    }

    async fn is_running(&self) -> bool {
        *self.state.read().await == SessionState::Running
    }

    async fn capture_on_change(&self) {
        let Ok(_gate) = self.capture_gate.try_lock() else {
            self.change_pending.store(true, Ordering::SeqCst);
            debug!("Capture already in flight, change queued");
            return;
        };
        self.change_pending.store(false, Ordering::SeqCst);

        let digest = match fingerprint::digest(&self.source_path).await {
            Ok(digest) => digest,
            Err(e) => return self.report(&e),
        };
        if self.last_digest.lock().await.as_deref() == Some(digest.as_str()) {
            debug!("Content of {} unchanged", self.source_path.display());
            return;
        }

        match self.store.create(&self.source_path).await {
            Ok(outcome) => self.after_capture(&outcome, Some(digest)).await,
            Err(e) => self.report(&e),
        }
    }

    async fn capture_forced(&self) -> Result<CaptureOutcome> {
        let _gate = self.capture_gate.lock().await;

        let outcome = match self.store.create(&self.source_path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };
        self.after_capture(&outcome, None).await;
        Ok(outcome)
    }

    /// Record a successful capture. `sampled` is the digest taken before the
    /// copy, used when the outcome carries none.
    async fn after_capture(&self, outcome: &CaptureOutcome, sampled: Option<String>) {
        let digest = match outcome {
            CaptureOutcome::Created(record) | CaptureOutcome::Duplicate(record) => {
                Some(record.content_digest.clone())
            }
            CaptureOutcome::SkippedEmpty => sampled,
        };
        if let Some(digest) = digest {
            *self.last_digest.lock().await = Some(digest);
        }

        match outcome {
            CaptureOutcome::Created(record) => {
                self.events.emit(MonitorEvent::BackupCreated(record.clone()));
                if let Err(e) = self.store.evict_overflow(self.max_backups).await {
                    self.report(&e);
                }
            }
            CaptureOutcome::Duplicate(record) => {
                debug!(record_id = %record.id, "Capture matched newest backup");
            }
            CaptureOutcome::SkippedEmpty => {
                debug!("{} is empty, nothing captured", self.source_path.display());
            }
        }
    }

    fn report(&self, err: &SnapkeepError) {
        warn!("Monitor error on {}: {}", self.source_path.display(), err);
        self.events.emit(MonitorEvent::from_error(err));
    }
}
