// Target registry records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known tag keys. Tags are free-form; these are the ones the agent reads.
pub mod tag {
    pub const DISPLAY_NAME: &str = "displayName";
    pub const SECTION: &str = "section";
    pub const PREFERRED_MOUNT: &str = "preferredMount";
    pub const PREFERRED_INTERFACE: &str = "preferredInterface";
}

/// Selects the execution backend for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    #[default]
    Ssh,
    Local,
}

/// What `register` does when (host, port, username) is already registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    /// Drop the existing target (and its credential) and register the new one.
    Replace,
    KeepBoth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Vault identity of the credential used to reach this target.
    pub credential: String,
    #[serde(default)]
    pub account_kind: AccountKind,
    /// Seconds between polls; `<= 0` means registered but not supervised.
    pub interval_secs: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TargetRecord {
    /// New record with a fresh id.
    pub fn new(host: impl Into<String>, port: u16, credential: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host: host.into(),
            port,
            credential: credential.into(),
            account_kind: AccountKind::Ssh,
            interval_secs: 0,
            tags: BTreeMap::new(),
        }
    }

    pub fn is_supervised(&self) -> bool {
        self.interval_secs > 0
    }

    pub fn display_name(&self) -> &str {
        self.tags
            .get(tag::DISPLAY_NAME)
            .map(String::as_str)
            .unwrap_or(&self.host)
    }

    pub fn section(&self) -> Option<&str> {
        self.tags.get(tag::SECTION).map(String::as_str)
    }

    pub fn preferred_mount(&self) -> Option<&str> {
        self.tags.get(tag::PREFERRED_MOUNT).map(String::as_str)
    }

    pub fn preferred_interface(&self) -> Option<&str> {
        self.tags.get(tag::PREFERRED_INTERFACE).map(String::as_str)
    }
}
