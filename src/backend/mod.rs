//! Execution backends: how a target is reached and how structured facts are pulled from it.
//!
//! The scheduler and script runner only see [`ExecutionBackend`] and [`Connection`].
//! Backends are picked through [`BackendRegistry`] by the target's [`AccountKind`].
//! Metric queries never fail: any transport or parse problem degrades to the
//! category's `Default` value and is logged.

pub mod local;
pub mod parse;
mod process;
pub mod ssh;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::BackendError;
use crate::models::{
    AccountKind, FileSystemInfo, MemoryInfo, NetworkInfo, ProcessInfo, ServerSnapshot, SystemInfo,
    TargetRecord,
};

pub use local::LocalBackend;
pub use ssh::SshBackend;

/// Receives output chunks as they arrive.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Polled between chunks; `true` asks the running script to stop.
pub type TerminationCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub fn discard_output() -> OutputSink {
    Arc::new(|_: &str| {})
}

pub fn never_terminate() -> TerminationCheck {
    Arc::new(|| false)
}

/// Shell identifier rules: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Entries of `env` that can be exported to a shell; the rest are logged and dropped.
pub(crate) fn exportable_env(
    env: &BTreeMap<String, String>,
) -> impl Iterator<Item = (&String, &String)> {
    env.iter().filter(|(k, _)| {
        let ok = is_valid_env_key(k);
        if !ok {
            tracing::warn!(key = %k, "skipping environment variable with invalid name");
        }
        ok
    })
}

/// How a candidate authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    PrivateKey {
        key: Vec<u8>,
        passphrase: Option<String>,
    },
    /// Whatever the transport finds on its own (agent, default keys, local user).
    Ambient,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
            Auth::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Auth::Ambient => f.write_str("Ambient"),
        }
    }
}

/// Everything needed to open a connection, resolved from a target and its credential.
#[derive(Debug, Clone)]
pub struct ConnectionCandidate {
    pub target_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> AccountKind;

    /// Resolve credentials into a connection descriptor.
    async fn prepare_connection(
        &self,
        target: &TargetRecord,
    ) -> Result<ConnectionCandidate, BackendError>;

    /// Handshake and authenticate. Errors are human-readable descriptions.
    async fn connect(&self, candidate: ConnectionCandidate) -> Result<Box<dyn Connection>, String>;
}

/// An established connection. Implementations serialize their own I/O.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn disconnect(&self);

    async fn query_process_info(&self) -> ProcessInfo;

    async fn query_memory_info(&self) -> MemoryInfo;

    async fn query_file_system_info(&self) -> FileSystemInfo;

    async fn query_system_info(&self) -> SystemInfo;

    async fn query_network_info(&self) -> NetworkInfo;

    /// Run `script`, streaming combined output. `None` on transport failure or termination.
    async fn execute_script(
        &self,
        script: &str,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> Option<i32>;

    /// Persistent terminal-style session; not used by the scheduler.
    async fn open_interactive_session(
        &self,
        env: &BTreeMap<String, String>,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Option<InteractiveSession>;

    /// Whether several queries may be in flight on this connection at once.
    fn is_multiplex_safe(&self) -> bool {
        false
    }
}

/// Gather all five categories, concurrently only when the connection allows it.
pub async fn gather_snapshot(conn: &dyn Connection) -> ServerSnapshot {
    if conn.is_multiplex_safe() {
        let (process, memory, file_system, system, network) = tokio::join!(
            conn.query_process_info(),
            conn.query_memory_info(),
            conn.query_file_system_info(),
            conn.query_system_info(),
            conn.query_network_info(),
        );
        ServerSnapshot {
            process,
            memory,
            file_system,
            system,
            network,
        }
    } else {
        ServerSnapshot {
            process: conn.query_process_info().await,
            memory: conn.query_memory_info().await,
            file_system: conn.query_file_system_info().await,
            system: conn.query_system_info().await,
            network: conn.query_network_info().await,
        }
    }
}

/// Callbacks for an interactive session.
pub trait SessionDelegate: Send + Sync {
    fn on_output(&self, data: &[u8]);

    fn on_closed(&self, exit_code: Option<i32>);
}

/// Handle to a running interactive session. Dropping it closes the session.
pub struct InteractiveSession {
    input: mpsc::Sender<Vec<u8>>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl InteractiveSession {
    /// Send bytes to the remote side. `false` once the session has ended.
    pub async fn write(&self, data: &[u8]) -> bool {
        self.input.send(data.to_vec()).await.is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Ask the session to end and wait for it.
    pub async fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Allocation table: account kind -> backend.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<AccountKind, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: AccountKind) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn for_target(
        &self,
        target: &TargetRecord,
    ) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
        self.get(target.account_kind)
            .ok_or(BackendError::NoBackend(target.account_kind))
    }
}
