// Shared test helpers: fake backend/connection, in-memory credential store, config builders.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwatch::backend::{
    Auth, BackendRegistry, Connection, ConnectionCandidate, ExecutionBackend, InteractiveSession,
    OutputSink, SessionDelegate, TerminationCheck,
};
use fleetwatch::config::SchedulerConfig;
use fleetwatch::error::BackendError;
use fleetwatch::models::*;
use fleetwatch::vault::CredentialStore;

pub fn full_snapshot() -> ServerSnapshot {
    ServerSnapshot {
        process: ProcessInfo {
            summary: CpuUsage {
                name: "cpu".into(),
                user: 12.0,
                idle: 88.0,
                ..CpuUsage::default()
            },
            total_processes: 120,
            ..ProcessInfo::default()
        },
        memory: MemoryInfo {
            total_kb: 4096,
            available_kb: 1024,
            ..MemoryInfo::default()
        },
        file_system: FileSystemInfo {
            mounts: vec![MountUsage {
                device: "/dev/sda1".into(),
                fs_type: "ext4".into(),
                mount_point: "/".into(),
                total_kb: 1000,
                used_kb: 400,
                available_kb: 600,
            }],
            devices: vec![],
        },
        system: SystemInfo {
            hostname: "web-01".into(),
            os_name: "Debian".into(),
            kernel_release: "6.1.0".into(),
            uptime_secs: 3600,
        },
        network: NetworkInfo {
            interfaces: vec![InterfaceUsage {
                name: "eth0".into(),
                rx_bytes: 10,
                tx_bytes: 20,
                ..InterfaceUsage::default()
            }],
        },
    }
}

/// Only memory and system populated: three zero categories.
pub fn sparse_snapshot() -> ServerSnapshot {
    let full = full_snapshot();
    ServerSnapshot {
        memory: full.memory,
        system: full.system,
        ..ServerSnapshot::default()
    }
}

/// What a fake script run does.
#[derive(Clone)]
pub enum ScriptBehavior {
    /// Print `output`, exit with `code`.
    Exit { output: String, code: i32 },
    /// Sleep, then exit 0.
    Sleep(Duration),
    /// Transport drop.
    Drop,
}

#[derive(Clone)]
pub struct FakeSettings {
    pub snapshot: ServerSnapshot,
    pub poll_delay: Duration,
    pub connect_error: Option<String>,
    pub script: Arc<dyn Fn(&str, &BTreeMap<String, String>) -> ScriptBehavior + Send + Sync>,
}

impl Default for FakeSettings {
    fn default() -> Self {
        Self {
            snapshot: full_snapshot(),
            poll_delay: Duration::ZERO,
            connect_error: None,
            script: Arc::new(|_, _| ScriptBehavior::Exit {
                output: String::new(),
                code: 0,
            }),
        }
    }
}

/// Records what the runner and scheduler ask of it.
#[derive(Default)]
pub struct FakeStats {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub scripts: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

pub struct FakeBackend {
    pub kind: AccountKind,
    pub settings: Mutex<FakeSettings>,
    pub stats: Arc<FakeStats>,
}

impl FakeBackend {
    pub fn new(settings: FakeSettings) -> Arc<Self> {
        Self::with_kind(AccountKind::Ssh, settings)
    }

    pub fn with_kind(kind: AccountKind, settings: FakeSettings) -> Arc<Self> {
        Arc::new(Self {
            kind,
            settings: Mutex::new(settings),
            stats: Arc::new(FakeStats::default()),
        })
    }

    pub fn set_snapshot(&self, snapshot: ServerSnapshot) {
        self.settings.lock().unwrap().snapshot = snapshot;
    }

    pub fn connects(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    pub fn scripts_run(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.stats.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn kind(&self) -> AccountKind {
        self.kind
    }

    async fn prepare_connection(
        &self,
        target: &TargetRecord,
    ) -> Result<ConnectionCandidate, BackendError> {
        if target.credential == "missing" {
            return Err(BackendError::MissingCredential(target.credential.clone()));
        }
        Ok(ConnectionCandidate {
            target_id: target.id.clone(),
            host: target.host.clone(),
            port: target.port,
            username: "tester".into(),
            auth: Auth::Ambient,
        })
    }

    async fn connect(&self, _candidate: ConnectionCandidate) -> Result<Box<dyn Connection>, String> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let settings = self.settings.lock().unwrap().clone();
        if let Some(e) = settings.connect_error.clone() {
            return Err(e);
        }
        Ok(Box::new(FakeConnection {
            settings,
            stats: self.stats.clone(),
        }))
    }
}

pub struct FakeConnection {
    settings: FakeSettings,
    stats: Arc<FakeStats>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn disconnect(&self) {
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn query_process_info(&self) -> ProcessInfo {
        tokio::time::sleep(self.settings.poll_delay).await;
        self.settings.snapshot.process.clone()
    }

    async fn query_memory_info(&self) -> MemoryInfo {
        self.settings.snapshot.memory.clone()
    }

    async fn query_file_system_info(&self) -> FileSystemInfo {
        self.settings.snapshot.file_system.clone()
    }

    async fn query_system_info(&self) -> SystemInfo {
        self.settings.snapshot.system.clone()
    }

    async fn query_network_info(&self) -> NetworkInfo {
        self.settings.snapshot.network.clone()
    }

    async fn execute_script(
        &self,
        script: &str,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> Option<i32> {
        self.stats
            .scripts
            .lock()
            .unwrap()
            .push((script.to_string(), env.clone()));
        match (self.settings.script)(script, env) {
            ScriptBehavior::Exit { output, code } => {
                for line in output.split_inclusive('\n') {
                    if should_terminate() {
                        return None;
                    }
                    on_output(line);
                }
                Some(code)
            }
            ScriptBehavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Some(0)
            }
            ScriptBehavior::Drop => None,
        }
    }

    async fn open_interactive_session(
        &self,
        _env: &BTreeMap<String, String>,
        _delegate: Arc<dyn SessionDelegate>,
    ) -> Option<InteractiveSession> {
        None
    }
}

/// In-memory credential store keyed by identity.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, identity: &str, account: &str) {
        self.records.lock().unwrap().insert(
            identity.to_string(),
            CredentialRecord {
                identity: identity.to_string(),
                label: identity.to_string(),
                account: account.to_string(),
                secret: "pw".into(),
                attachment: None,
            },
        );
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.lock().unwrap().contains_key(identity)
    }
}

impl CredentialStore for MemoryStore {
    fn retrieve(&self, identity: &str) -> Option<CredentialRecord> {
        self.records.lock().unwrap().get(identity).cloned()
    }

    fn remove(&self, identity: &str) {
        self.records.lock().unwrap().remove(identity);
    }
}

pub fn registry_with(backend: Arc<FakeBackend>) -> BackendRegistry {
    BackendRegistry::new().with(backend)
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 100,
        max_concurrent_polls: 4,
        poll_timeout_secs: 10,
        save_debounce_ms: 20,
        event_capacity: 64,
        duplicate_policy: DuplicatePolicy::Reject,
        stats_log_interval_secs: 300,
    }
}

pub fn target(host: &str, credential: &str, interval_secs: i64) -> TargetRecord {
    let mut t = TargetRecord::new(host, 22, credential);
    t.interval_secs = interval_secs;
    t
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
