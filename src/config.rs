use serde::Deserialize;

use crate::models::DuplicatePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub vault: VaultConfig,
    pub scheduler: SchedulerConfig,
    pub history: HistoryConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the target registry file.
    pub base_dir: String,
    #[serde(default = "default_registry_file")]
    pub registry_file: String,
}

fn default_registry_file() -> String {
    "targets.json".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub dir: String,
    /// Name of the environment variable carrying the master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
}

fn default_master_key_env() -> String {
    "FLEETWATCH_MASTER_KEY".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub max_concurrent_polls: usize,
    /// Wall-clock ceiling for one whole poll (connect + all metric categories).
    pub poll_timeout_secs: u64,
    /// Registry saves requested within this window collapse into one write.
    pub save_debounce_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// How often to log scheduler stats at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

fn default_event_capacity() -> usize {
    64
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    pub flush_rate: u64,
    pub flush_interval_secs: u64,
    pub prune_interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    pub vacuum_schedule: Option<String>,
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    7
}

fn default_vacuum_interval_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptsConfig {
    /// Replace `{{KEY}}` placeholders in remote shell scripts instead of exporting env vars.
    #[serde(default)]
    pub inline_substitution: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_program")]
    pub program: String,
    #[serde(default = "default_sshpass_program")]
    pub sshpass_program: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Passed as `StrictHostKeyChecking` (yes, no, accept-new).
    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: String,
    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            sshpass_program: default_sshpass_program(),
            connect_timeout_secs: default_connect_timeout_secs(),
            strict_host_key_checking: default_strict_host_key_checking(),
            control_persist_secs: default_control_persist_secs(),
        }
    }
}

fn default_ssh_program() -> String {
    "ssh".into()
}

fn default_sshpass_program() -> String {
    "sshpass".into()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_strict_host_key_checking() -> String {
    "accept-new".into()
}

fn default_control_persist_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Full path of the registry file.
    pub fn registry_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.storage.base_dir).join(&self.storage.registry_file)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.storage.base_dir.is_empty(),
            "storage.base_dir must be non-empty"
        );
        anyhow::ensure!(
            !self.storage.registry_file.is_empty(),
            "storage.registry_file must be non-empty"
        );
        anyhow::ensure!(!self.vault.dir.is_empty(), "vault.dir must be non-empty");
        anyhow::ensure!(
            !self.vault.master_key_env.is_empty(),
            "vault.master_key_env must be non-empty"
        );
        anyhow::ensure!(
            self.scheduler.tick_interval_ms > 0 && self.scheduler.tick_interval_ms < 1000,
            "scheduler.tick_interval_ms must be between 1 and 999, got {}",
            self.scheduler.tick_interval_ms
        );
        anyhow::ensure!(
            self.scheduler.max_concurrent_polls > 0,
            "scheduler.max_concurrent_polls must be > 0, got {}",
            self.scheduler.max_concurrent_polls
        );
        anyhow::ensure!(
            self.scheduler.poll_timeout_secs > 0,
            "scheduler.poll_timeout_secs must be > 0, got {}",
            self.scheduler.poll_timeout_secs
        );
        anyhow::ensure!(
            self.scheduler.event_capacity > 0,
            "scheduler.event_capacity must be > 0, got {}",
            self.scheduler.event_capacity
        );
        anyhow::ensure!(
            self.scheduler.stats_log_interval_secs > 0,
            "scheduler.stats_log_interval_secs must be > 0, got {}",
            self.scheduler.stats_log_interval_secs
        );
        anyhow::ensure!(!self.history.path.is_empty(), "history.path must be non-empty");
        anyhow::ensure!(
            self.history.retention_days > 0,
            "history.retention_days must be > 0, got {}",
            self.history.retention_days
        );
        anyhow::ensure!(
            self.history.flush_rate > 0,
            "history.flush_rate must be > 0, got {}",
            self.history.flush_rate
        );
        anyhow::ensure!(
            self.history.flush_interval_secs > 0,
            "history.flush_interval_secs must be > 0, got {}",
            self.history.flush_interval_secs
        );
        anyhow::ensure!(
            self.history.prune_interval_secs > 0,
            "history.prune_interval_secs must be > 0, got {}",
            self.history.prune_interval_secs
        );
        if let Some(schedule) = &self.history.vacuum_schedule {
            use std::str::FromStr;
            anyhow::ensure!(
                cron::Schedule::from_str(schedule).is_ok(),
                "history.vacuum_schedule is not a valid cron expression: {}",
                schedule
            );
        }
        anyhow::ensure!(
            self.history.vacuum_interval_secs > 0,
            "history.vacuum_interval_secs must be > 0, got {}",
            self.history.vacuum_interval_secs
        );
        anyhow::ensure!(!self.ssh.program.is_empty(), "ssh.program must be non-empty");
        anyhow::ensure!(
            self.ssh.connect_timeout_secs > 0,
            "ssh.connect_timeout_secs must be > 0, got {}",
            self.ssh.connect_timeout_secs
        );
        anyhow::ensure!(
            matches!(
                self.ssh.strict_host_key_checking.as_str(),
                "yes" | "no" | "accept-new"
            ),
            "ssh.strict_host_key_checking must be yes, no or accept-new, got {}",
            self.ssh.strict_host_key_checking
        );
        Ok(())
    }
}
