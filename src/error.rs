// Error taxonomy: fatal at startup, runtime-critical (reported through a hook), operational (absorbed locally).

use std::path::PathBuf;
use std::sync::Arc;

use crate::models::AccountKind;

/// Vault failures. `CryptoInit` and `PermissionDenied` are fatal during initialization.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault directory {path} is not accessible: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("vault crypto initialization failed: {0}")]
    CryptoInit(String),
    #[error("credential {0} already exists")]
    DuplicateIdentity(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("credential label must be a single line")]
    MultiLineLabel,
    #[error("vault io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while turning a target into something a backend can connect to.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no credential {0} in vault")]
    MissingCredential(String),
    #[error("credential {0} is malformed: {1}")]
    MalformedCredential(String, String),
    #[error("no backend registered for account kind {0:?}")]
    NoBackend(AccountKind),
}

/// Rejections from `SupervisionScheduler::register`.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("target id {0} is already registered")]
    DuplicateId(String),
    #[error("{host}:{port} as {username} is already registered as {existing}")]
    DuplicateEndpoint {
        host: String,
        port: u16,
        username: String,
        existing: String,
    },
    #[error("invalid target: {0}")]
    Invalid(String),
}

/// Errors that halt startup.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("history store schema: {0}")]
    HistorySchema(#[source] anyhow::Error),
    #[error("registry file {path} is corrupted: {source}")]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors after startup that mean a whole subsystem can no longer be trusted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CriticalError {
    #[error("registry persistence failed: {0}")]
    Persistence(String),
    #[error("persisted state corrupted: {0}")]
    CorruptedState(String),
    #[error("encryption engine unavailable: {0}")]
    CryptoUnavailable(String),
}

/// Callback for runtime-critical errors; the binary installs one that triggers shutdown.
pub type CriticalErrorHook = Arc<dyn Fn(&CriticalError) + Send + Sync>;

/// Hook that only logs. Used when the caller does not care (tests, tools).
pub fn log_only_hook() -> CriticalErrorHook {
    Arc::new(|e: &CriticalError| {
        tracing::error!(error = %e, "runtime-critical error");
    })
}
