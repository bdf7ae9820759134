// Single writer for targets.json. Save requests are coalesced: the writer waits out the
// debounce window, drains whatever else arrived, then serializes the registry as it is now.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{CriticalError, CriticalErrorHook, FatalError};
use crate::models::TargetRecord;

pub const REGISTRY_VERSION: u32 = 1;

/// Queue depth for save requests; a full queue already has a save pending.
pub(crate) const SAVE_QUEUE_CAPACITY: usize = 8;

/// On-disk registry layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u32,
    pub targets: Vec<TargetRecord>,
}

#[derive(Debug)]
pub(crate) enum SaveRequest {
    Dirty,
    /// Write now and acknowledge once the file is on disk.
    Flush(oneshot::Sender<()>),
}

/// Snapshot of the registry taken by the writer at write time.
pub(crate) type RegistrySource = Arc<dyn Fn() -> Vec<TargetRecord> + Send + Sync>;

pub(crate) fn spawn_registry_writer(
    mut rx: mpsc::Receiver<SaveRequest>,
    source: RegistrySource,
    path: PathBuf,
    debounce: Duration,
    critical: CriticalErrorHook,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut writes: u64 = 0;
        while let Some(first) = rx.recv().await {
            let mut waiters = Vec::new();
            let mut closed = false;
            match first {
                SaveRequest::Flush(tx) => waiters.push(tx),
                SaveRequest::Dirty => {
                    let sleep = tokio::time::sleep(debounce);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            () = &mut sleep => break,
                            req = rx.recv() => match req {
                                Some(SaveRequest::Dirty) => {}
                                Some(SaveRequest::Flush(tx)) => {
                                    waiters.push(tx);
                                    break;
                                }
                                None => {
                                    closed = true;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            while let Ok(req) = rx.try_recv() {
                if let SaveRequest::Flush(tx) = req {
                    waiters.push(tx);
                }
            }

            let file = RegistryFile {
                version: REGISTRY_VERSION,
                targets: source(),
            };
            let target_count = file.targets.len();
            let write_path = path.clone();
            let result = tokio::task::spawn_blocking(move || write_registry(&write_path, &file))
                .await
                .map_err(|e| anyhow::anyhow!("registry write task join: {}", e))
                .and_then(|r| r);
            match result {
                Ok(()) => {
                    writes += 1;
                    tracing::debug!(operation = "save_registry", targets = target_count, writes, "registry saved");
                }
                Err(e) => {
                    tracing::error!(operation = "save_registry", error = %e, path = %path.display(), "registry save failed");
                    critical(&CriticalError::Persistence(e.to_string()));
                }
            }
            for tx in waiters {
                let _ = tx.send(());
            }
            if closed {
                break;
            }
        }
        tracing::debug!("registry writer shutting down");
    })
}

pub fn write_registry(path: &Path, file: &RegistryFile) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let bytes = serde_json::to_vec_pretty(file)?;
    crate::vault::write_atomic(&dir, path, &bytes)?;
    Ok(())
}

/// Read the registry. A missing file is an empty registry; an unparseable one is fatal.
pub fn read_registry(path: &Path) -> Result<Vec<TargetRecord>, FatalError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(FatalError::CorruptRegistry {
                path: path.to_path_buf(),
                source: serde_json::Error::io(e),
            });
        }
    };
    let file: RegistryFile =
        serde_json::from_str(&text).map_err(|source| FatalError::CorruptRegistry {
            path: path.to_path_buf(),
            source,
        })?;
    if file.version != REGISTRY_VERSION {
        tracing::warn!(version = file.version, "registry file has unexpected version, reading anyway");
    }
    Ok(file.targets)
}
