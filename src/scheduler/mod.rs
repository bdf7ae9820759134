//! Supervision scheduler: owns the target registry, decides when each target is due,
//! and runs polls on a bounded pool.
//!
//! Per target: Idle -> PollPending -> Idle. `pending` is the single-flight guard; it is
//! set under the registry lock before a poll is dispatched and cleared when the poll
//! concludes. It is never persisted.

pub mod registry_writer;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use tracing::instrument;

use crate::backend::{self, BackendRegistry};
use crate::config::SchedulerConfig;
use crate::deadline;
use crate::error::{CriticalError, CriticalErrorHook, FatalError, RegisterError};
use crate::history_repo::HistoryEntry;
use crate::models::{DuplicatePolicy, ServerSnapshot, TargetRecord};
use crate::vault::CredentialStore;
use registry_writer::{RegistrySource, SaveRequest};

/// A snapshot with this many zero-valued categories counts as a failed poll.
pub const ZERO_CATEGORY_FAILURE_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A target was added, removed or edited.
    TargetsChanged,
    SnapshotUpdated { id: String },
    PollFailed { id: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRequest {
    Dispatched,
    AlreadyUpdating,
    NotFound,
}

/// Runtime state of one target. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct TargetState {
    pub pending: bool,
    /// Dispatch time of the most recent poll; interval gating is measured from here.
    pub last_poll_started: Option<SystemTime>,
    pub last_success: Option<SystemTime>,
    /// Set when the latest concluded poll failed; the previous snapshot is kept.
    pub failed: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub snapshot: Option<ServerSnapshot>,
}

#[derive(Default)]
struct Registry {
    targets: Vec<TargetRecord>,
    states: HashMap<String, TargetState>,
}

impl Registry {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.targets.iter().position(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TargetRecord> {
        self.targets.iter_mut().find(|t| t.id == id)
    }
}

/// Collaborators injected into the scheduler.
pub struct SchedulerDeps {
    pub backends: BackendRegistry,
    pub credentials: Arc<dyn CredentialStore>,
    /// History writer queue; `None` when history recording is off.
    pub history_tx: Option<mpsc::Sender<HistoryEntry>>,
    pub critical: CriticalErrorHook,
}

struct Inner {
    registry: Arc<Mutex<Registry>>,
    backends: BackendRegistry,
    credentials: Arc<dyn CredentialStore>,
    history_tx: Option<mpsc::Sender<HistoryEntry>>,
    critical: CriticalErrorHook,
    events: broadcast::Sender<SchedulerEvent>,
    pool: Arc<Semaphore>,
    save_tx: mpsc::Sender<SaveRequest>,
    registry_path: PathBuf,
    poll_timeout: Duration,
    duplicate_policy: DuplicatePolicy,
}

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct SupervisionScheduler {
    inner: Arc<Inner>,
}

impl SupervisionScheduler {
    /// Build the scheduler and start its registry writer. Must be called inside a runtime.
    pub fn new(config: &SchedulerConfig, registry_path: PathBuf, deps: SchedulerDeps) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (save_tx, save_rx) = mpsc::channel(registry_writer::SAVE_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let source_registry = registry.clone();
        let source: RegistrySource = Arc::new(move || {
            source_registry
                .lock()
                .map(|r| r.targets.clone())
                .unwrap_or_else(|poisoned| poisoned.into_inner().targets.clone())
        });
        registry_writer::spawn_registry_writer(
            save_rx,
            source,
            registry_path.clone(),
            Duration::from_millis(config.save_debounce_ms),
            deps.critical.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                backends: deps.backends,
                credentials: deps.credentials,
                history_tx: deps.history_tx,
                critical: deps.critical,
                events,
                pool: Arc::new(Semaphore::new(config.max_concurrent_polls.max(1))),
                save_tx,
                registry_path,
                poll_timeout: deadline::timeout_from_secs(config.poll_timeout_secs as i64),
                duplicate_policy: config.duplicate_policy,
            }),
        }
    }

    /// Replace the registry with the persisted one. All states start Idle.
    #[instrument(skip(self), fields(operation = "load_registry"))]
    pub fn load(&self) -> Result<usize, FatalError> {
        let targets = registry_writer::read_registry(&self.inner.registry_path)?;
        let n = targets.len();
        {
            let mut reg = self.registry();
            reg.states = targets
                .iter()
                .map(|t| (t.id.clone(), TargetState::default()))
                .collect();
            reg.targets = targets;
        }
        tracing::info!(targets = n, path = %self.inner.registry_path.display(), "registry loaded");
        self.emit(SchedulerEvent::TargetsChanged);
        Ok(n)
    }

    /// Add a target. Duplicate endpoints follow the configured policy.
    #[instrument(skip_all, fields(operation = "register", host = %target.host, port = target.port))]
    pub fn register(&self, target: TargetRecord) -> Result<String, RegisterError> {
        if target.id.trim().is_empty() {
            return Err(RegisterError::Invalid("empty id".into()));
        }
        if target.host.trim().is_empty() {
            return Err(RegisterError::Invalid("empty host".into()));
        }

        // Account names need the vault; resolve them outside the registry lock.
        let same_endpoint: Vec<(String, String)> = {
            let reg = self.registry();
            if reg.index_of(&target.id).is_some() {
                return Err(RegisterError::DuplicateId(target.id));
            }
            reg.targets
                .iter()
                .filter(|t| t.host.eq_ignore_ascii_case(&target.host) && t.port == target.port)
                .map(|t| (t.id.clone(), t.credential.clone()))
                .collect()
        };
        let username = self.inner.credentials.account_name(&target.credential);
        let duplicates: Vec<String> = match &username {
            Some(name) => same_endpoint
                .into_iter()
                .filter(|(_, cred)| self.inner.credentials.account_name(cred).as_deref() == Some(name))
                .map(|(id, _)| id)
                .collect(),
            None => Vec::new(),
        };

        let mut dropped_credentials = Vec::new();
        let id = target.id.clone();
        {
            let mut reg = self.registry();
            if reg.index_of(&target.id).is_some() {
                return Err(RegisterError::DuplicateId(target.id));
            }
            if let Some(existing) = duplicates.first() {
                match self.inner.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        return Err(RegisterError::DuplicateEndpoint {
                            host: target.host,
                            port: target.port,
                            username: username.unwrap_or_default(),
                            existing: existing.clone(),
                        });
                    }
                    DuplicatePolicy::Replace => {
                        for dup in &duplicates {
                            if let Some(idx) = reg.index_of(dup) {
                                let old = reg.targets.remove(idx);
                                reg.states.remove(&old.id);
                                tracing::info!(replaced = %old.id, "duplicate target replaced");
                                if old.credential != target.credential {
                                    dropped_credentials.push(old.credential);
                                }
                            }
                        }
                    }
                    DuplicatePolicy::KeepBoth => {
                        tracing::info!(existing = %existing, "duplicate target kept alongside existing");
                    }
                }
            }
            reg.states.insert(id.clone(), TargetState::default());
            reg.targets.push(target);
            dropped_credentials.retain(|c| !reg.targets.iter().any(|t| &t.credential == c));
        }
        for cred in dropped_credentials {
            self.inner.credentials.remove(&cred);
        }

        self.request_save();
        self.emit(SchedulerEvent::TargetsChanged);
        Ok(id)
    }

    /// Remove a target together with its credential. `false` when unknown.
    #[instrument(skip(self), fields(operation = "unregister"))]
    pub fn unregister(&self, id: &str) -> bool {
        let credential = {
            let mut reg = self.registry();
            let Some(idx) = reg.index_of(id) else {
                return false;
            };
            let removed = reg.targets.remove(idx);
            reg.states.remove(id);
            let shared = reg.targets.iter().any(|t| t.credential == removed.credential);
            (!shared).then_some(removed.credential)
        };
        if let Some(cred) = credential {
            self.inner.credentials.remove(&cred);
        }
        self.request_save();
        self.emit(SchedulerEvent::TargetsChanged);
        true
    }

    /// `<= 0` stops supervision without unregistering.
    pub fn set_interval(&self, id: &str, interval_secs: i64) -> bool {
        let found = {
            let mut reg = self.registry();
            match reg.get_mut(id) {
                Some(t) => {
                    t.interval_secs = interval_secs;
                    true
                }
                None => false,
            }
        };
        if found {
            self.request_save();
            self.emit(SchedulerEvent::TargetsChanged);
        }
        found
    }

    pub fn set_tags<F>(&self, id: &str, edit: F) -> bool
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let found = {
            let mut reg = self.registry();
            match reg.get_mut(id) {
                Some(t) => {
                    edit(&mut t.tags);
                    true
                }
                None => false,
            }
        };
        if found {
            self.request_save();
            self.emit(SchedulerEvent::TargetsChanged);
        }
        found
    }

    pub fn tick(&self) -> usize {
        self.tick_at(SystemTime::now())
    }

    /// Dispatch every supervised, idle target whose interval has elapsed at `now`. Never blocks
    /// on polls; returns how many were dispatched.
    pub fn tick_at(&self, now: SystemTime) -> usize {
        let due: Vec<TargetRecord> = {
            let mut reg = self.registry();
            let Registry { targets, states } = &mut *reg;
            targets
                .iter()
                .filter(|t| t.is_supervised())
                .filter_map(|t| {
                    let state = states.entry(t.id.clone()).or_default();
                    if state.pending || !is_due(state.last_poll_started, t.interval_secs, now) {
                        return None;
                    }
                    state.pending = true;
                    state.last_poll_started = Some(now);
                    Some(t.clone())
                })
                .collect()
        };
        let n = due.len();
        for target in due {
            self.dispatch(target, now);
        }
        if n > 0 {
            tracing::debug!(dispatched = n, "tick");
        }
        n
    }

    /// Poll one target now regardless of its interval.
    pub fn poll_now(&self, id: &str) -> PollRequest {
        let now = SystemTime::now();
        let target = {
            let mut reg = self.registry();
            let Some(target) = reg.targets.iter().find(|t| t.id == id).cloned() else {
                return PollRequest::NotFound;
            };
            let state = reg.states.entry(target.id.clone()).or_default();
            if state.pending {
                return PollRequest::AlreadyUpdating;
            }
            state.pending = true;
            state.last_poll_started = Some(now);
            target
        };
        self.dispatch(target, now);
        PollRequest::Dispatched
    }

    pub fn snapshot(&self, id: &str) -> Option<ServerSnapshot> {
        self.registry().states.get(id).and_then(|s| s.snapshot.clone())
    }

    pub fn state(&self, id: &str) -> Option<TargetState> {
        self.registry().states.get(id).cloned()
    }

    pub fn target(&self, id: &str) -> Option<TargetRecord> {
        self.registry().targets.iter().find(|t| t.id == id).cloned()
    }

    /// Registered targets in registration order.
    pub fn targets(&self) -> Vec<TargetRecord> {
        self.registry().targets.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.registry().states.values().filter(|s| s.pending).count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Write the registry now and wait for it to land on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.save_tx.send(SaveRequest::Flush(tx)).await.is_err() {
            tracing::warn!("registry writer gone, flush skipped");
            return;
        }
        let _ = rx.await;
    }

    fn dispatch(&self, target: TargetRecord, started: SystemTime) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = match inner.pool.clone().acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "poll pool closed");
                    finalize(&inner, &target.id, Err("poll pool closed".into()));
                    return;
                }
            };
            let result = poll_once(&inner, &target).await;
            if let Ok(snapshot) = &result
                && let Some(tx) = &inner.history_tx
            {
                let entry = HistoryEntry {
                    target_id: target.id.clone(),
                    snapshot: snapshot.clone(),
                    created_at: deadline::unix_millis(started) as i64,
                };
                if let Err(e) = tx.try_send(entry) {
                    tracing::warn!(target_id = %target.id, error = %e, "history queue full, snapshot not recorded");
                }
            }
            finalize(&inner, &target.id, result);
        });
    }

    fn request_save(&self) {
        match self.inner.save_tx.try_send(SaveRequest::Dirty) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                (self.inner.critical)(&CriticalError::Persistence("registry writer stopped".into()));
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock_registry(&self.inner)
    }
}

fn lock_registry(inner: &Inner) -> MutexGuard<'_, Registry> {
    inner.registry.lock().unwrap_or_else(|poisoned| {
        tracing::error!("registry lock poisoned");
        (inner.critical)(&CriticalError::CorruptedState("registry lock poisoned".into()));
        poisoned.into_inner()
    })
}

fn is_due(last_started: Option<SystemTime>, interval_secs: i64, now: SystemTime) -> bool {
    let Some(last) = last_started else {
        return true;
    };
    let interval = Duration::from_secs(interval_secs.max(0) as u64);
    match now.duration_since(last) {
        Ok(elapsed) => elapsed >= interval,
        // Clock stepped backwards past the last poll.
        Err(_) => true,
    }
}

/// Connect, gather and disconnect under one wall-clock budget. The connection is held outside
/// the timed section so a poll that runs out of time still closes it.
#[instrument(skip_all, fields(operation = "poll", target_id = %target.id, host = %target.host))]
async fn poll_once(inner: &Inner, target: &TargetRecord) -> Result<ServerSnapshot, String> {
    let expires = deadline::deadline_after(inner.poll_timeout);
    let timed_out = |_: deadline::Elapsed| format!("poll timed out after {}s", inner.poll_timeout.as_secs());
    let backend = inner.backends.for_target(target).map_err(|e| e.to_string())?;
    let conn = deadline::run_until(expires, async {
        let candidate = backend
            .prepare_connection(target)
            .await
            .map_err(|e| e.to_string())?;
        backend.connect(candidate).await
    })
    .await
    .map_err(timed_out)??;
    let gathered = deadline::run_until(expires, backend::gather_snapshot(conn.as_ref())).await;
    conn.disconnect().await;
    let snapshot = gathered.map_err(timed_out)?;

    let zeros = snapshot.zero_categories();
    if zeros >= ZERO_CATEGORY_FAILURE_THRESHOLD {
        return Err(format!("{} of 5 metric categories came back empty", zeros));
    }
    Ok(snapshot)
}

fn finalize(inner: &Inner, id: &str, result: Result<ServerSnapshot, String>) {
    let event = {
        let mut reg = lock_registry(inner);
        if reg.index_of(id).is_none() {
            tracing::debug!(target_id = id, "poll finished for a target that is gone");
            return;
        }
        let state = reg.states.entry(id.to_string()).or_default();
        state.pending = false;
        match result {
            Ok(snapshot) => {
                state.snapshot = Some(snapshot);
                state.last_success = state.last_poll_started;
                state.failed = false;
                state.last_error = None;
                state.consecutive_failures = 0;
                SchedulerEvent::SnapshotUpdated { id: id.to_string() }
            }
            Err(error) => {
                state.failed = true;
                state.last_error = Some(error.clone());
                state.consecutive_failures += 1;
                tracing::warn!(target_id = id, failures = state.consecutive_failures, error = %error, "poll failed");
                SchedulerEvent::PollFailed {
                    id: id.to_string(),
                    error,
                }
            }
        }
    };
    let _ = inner.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn due_when_never_polled_or_interval_elapsed() {
        assert!(is_due(None, 5, at(0)));
        assert!(!is_due(Some(at(100)), 5, at(104)));
        assert!(is_due(Some(at(100)), 5, at(105)));
        assert!(is_due(Some(at(100)), 5, at(50)));
    }
}
