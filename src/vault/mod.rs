// Encrypted credential vault. One envelope file per identity; fields stay encrypted in memory
// and are decrypted only into the caller's scope on retrieve.

pub mod crypto;
pub mod envelope;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::instrument;

use crate::error::{CriticalError, CriticalErrorHook, VaultError};
use crate::models::CredentialRecord;
use crypto::FieldCipher;
use envelope::EncryptedRecord;

const CANARY_FILE: &str = ".canary";
const CANARY_PLAINTEXT: &str = "fleetwatch-vault-canary-v1";
const CREDENTIAL_EXT: &str = "cred";

/// Read side of the vault, as seen by backends and the scheduler.
pub trait CredentialStore: Send + Sync {
    fn retrieve(&self, identity: &str) -> Option<CredentialRecord>;

    fn remove(&self, identity: &str);

    /// Account (user) name of a credential, for duplicate detection.
    fn account_name(&self, identity: &str) -> Option<String> {
        self.retrieve(identity).map(|c| c.account)
    }
}

pub struct CredentialVault {
    dir: PathBuf,
    cipher: FieldCipher,
    /// Held across disk I/O.
    io_lock: Mutex<()>,
    /// Held only for map operations, never across disk I/O.
    index: Mutex<HashMap<String, EncryptedRecord>>,
    critical: CriticalErrorHook,
}

impl CredentialVault {
    /// Verify the master key against the canary (creating it when absent), then index the directory.
    #[instrument(skip_all, fields(repo = "vault", operation = "initialize"))]
    pub fn initialize(base_dir: impl AsRef<Path>, master_key: &str) -> Result<Self, VaultError> {
        let dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| permission_error(&dir, e))?;
        let cipher = FieldCipher::from_master_key(master_key)?;

        let canary_path = dir.join(CANARY_FILE);
        match std::fs::read_to_string(&canary_path) {
            Ok(text) => match cipher.decrypt_string(&text) {
                Some(plain) if plain == CANARY_PLAINTEXT => {}
                _ => {
                    return Err(VaultError::CryptoInit(
                        "master key does not match vault canary".into(),
                    ));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let sealed = cipher.encrypt(CANARY_PLAINTEXT.as_bytes())?;
                write_atomic(&dir, &canary_path, sealed.as_bytes())
                    .map_err(|e| permission_error(&dir, e))?;
                tracing::info!(path = %canary_path.display(), "created vault canary");
            }
            Err(e) => return Err(permission_error(&dir, e)),
        }

        let vault = Self {
            dir,
            cipher,
            io_lock: Mutex::new(()),
            index: Mutex::new(HashMap::new()),
            critical: crate::error::log_only_hook(),
        };
        vault.reload()?;
        Ok(vault)
    }

    /// Rescan the directory and replace the in-memory index.
    pub fn reload(&self) -> Result<usize, VaultError> {
        let scanned = {
            let _io = lock_or_recover(&self.io_lock);
            scan_dir(&self.dir).map_err(|e| permission_error(&self.dir, e))?
        };
        let n = scanned.len();
        *lock_or_recover(&self.index) = scanned;
        tracing::debug!(credentials = n, "vault index rebuilt");
        Ok(n)
    }

    /// Encrypt and store a credential under a fresh identity.
    #[instrument(skip_all, fields(repo = "vault", operation = "add"))]
    pub fn add(
        &self,
        account: &str,
        secret: &str,
        attachment: Option<&[u8]>,
        label: &str,
    ) -> Result<String, VaultError> {
        if label.contains(['\r', '\n']) {
            return Err(VaultError::MultiLineLabel);
        }
        let record = self.seal(account, secret, attachment, label).inspect_err(|e| {
            (self.critical)(&CriticalError::CryptoUnavailable(e.to_string()));
        })?;
        let identity = uuid::Uuid::new_v4().to_string();
        let path = self.path_for(&identity);

        {
            let _io = lock_or_recover(&self.io_lock);
            let indexed = lock_or_recover(&self.index).contains_key(&identity);
            if indexed || path.exists() {
                return Err(VaultError::DuplicateIdentity(identity));
            }
            write_atomic(&self.dir, &path, envelope::encode(&record).as_bytes())?;
        }
        lock_or_recover(&self.index).insert(identity.clone(), record);
        tracing::debug!(identity = %identity, "credential added");
        Ok(identity)
    }

    /// Delete file and index entry; no-op when absent.
    #[instrument(skip(self), fields(repo = "vault", operation = "remove"))]
    pub fn remove(&self, identity: &str) {
        if !is_valid_identity(identity) {
            return;
        }
        let _io = lock_or_recover(&self.io_lock);
        match std::fs::remove_file(self.path_for(identity)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, identity, "credential file removal failed"),
        }
        lock_or_recover(&self.index).remove(identity);
    }

    /// Decrypt a credential. Falls back to disk when the index has drifted.
    #[instrument(skip(self), fields(repo = "vault", operation = "retrieve"))]
    pub fn retrieve(&self, identity: &str) -> Option<CredentialRecord> {
        let cached = lock_or_recover(&self.index).get(identity).cloned();
        let record = match cached {
            Some(r) => r,
            None => {
                let r = self.repopulate_from_disk(identity)?;
                tracing::warn!(identity, "credential missing from index but present on disk; index repopulated");
                r
            }
        };
        self.decrypt_record(identity, &record)
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_or_recover(&self.index).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route encryption failures after startup to `hook`.
    pub fn with_critical_hook(mut self, hook: CriticalErrorHook) -> Self {
        self.critical = hook;
        self
    }

    fn seal(
        &self,
        account: &str,
        secret: &str,
        attachment: Option<&[u8]>,
        label: &str,
    ) -> Result<EncryptedRecord, VaultError> {
        Ok(EncryptedRecord {
            label: label.to_string(),
            account: self.cipher.encrypt(account.as_bytes())?,
            secret: self.cipher.encrypt(secret.as_bytes())?,
            payload: attachment.map(|a| self.cipher.encrypt(a)).transpose()?,
        })
    }

    /// Read one envelope and put it back in the index. File read and index insert happen under
    /// `io_lock` so a concurrent `remove` cannot leave an entry without a file.
    fn repopulate_from_disk(&self, identity: &str) -> Option<EncryptedRecord> {
        if !is_valid_identity(identity) {
            return None;
        }
        let path = self.path_for(identity);
        let _io = lock_or_recover(&self.io_lock);
        let text = std::fs::read_to_string(&path).ok()?;
        match envelope::decode(&text) {
            Ok(r) => {
                lock_or_recover(&self.index).insert(identity.to_string(), r.clone());
                Some(r)
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "unreadable credential envelope");
                None
            }
        }
    }

    fn decrypt_record(&self, identity: &str, record: &EncryptedRecord) -> Option<CredentialRecord> {
        let account = self.cipher.decrypt_string(&record.account);
        let secret = self.cipher.decrypt_string(&record.secret);
        let (Some(account), Some(secret)) = (account, secret) else {
            tracing::warn!(identity, operation = "decrypt", "credential failed to decrypt");
            return None;
        };
        let attachment = match &record.payload {
            Some(p) => match self.cipher.decrypt(p) {
                Some(bytes) => Some(bytes),
                None => {
                    tracing::warn!(identity, operation = "decrypt", "credential payload failed to decrypt");
                    return None;
                }
            },
            None => None,
        };
        Some(CredentialRecord {
            identity: identity.to_string(),
            label: record.label.clone(),
            account,
            secret,
            attachment,
        })
    }

    fn path_for(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", identity, CREDENTIAL_EXT))
    }
}

impl CredentialStore for CredentialVault {
    fn retrieve(&self, identity: &str) -> Option<CredentialRecord> {
        CredentialVault::retrieve(self, identity)
    }

    fn remove(&self, identity: &str) {
        CredentialVault::remove(self, identity)
    }
}

/// Identities are uuids; anything else never maps to a file.
fn is_valid_identity(identity: &str) -> bool {
    uuid::Uuid::parse_str(identity).is_ok()
}

fn scan_dir(dir: &Path) -> std::io::Result<HashMap<String, EncryptedRecord>> {
    let mut out = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CREDENTIAL_EXT) {
            continue;
        }
        let Some(identity) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_valid_identity(identity) {
            tracing::debug!(path = %path.display(), "skipping credential file with non-uuid name");
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "credential file unreadable");
                continue;
            }
        };
        match envelope::decode(&text) {
            Ok(record) => {
                out.insert(identity.to_string(), record);
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "credential envelope malformed, skipped");
            }
        }
    }
    Ok(out)
}

/// Write via a temp file in the same directory and rename over the target.
pub(crate) fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn permission_error(path: &Path, source: std::io::Error) -> VaultError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        VaultError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    } else {
        VaultError::Io(source)
    }
}

/// Poisoned vault locks are recovered rather than propagated.
fn lock_or_recover<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("vault lock poisoned, recovering");
        poisoned.into_inner()
    })
}
