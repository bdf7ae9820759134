// Script specs and execution results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved negative exit codes for failures the script itself never saw.
pub mod exit_code {
    pub const INVALID_TARGET: i32 = -1;
    pub const CONNECTION_FAILURE: i32 = -2;
    pub const TIMEOUT: i32 = -3;
    pub const MALFORMED_PAYLOAD: i32 = -4;
    pub const TERMINATED: i32 = -5;
    pub const EXECUTOR_UNAVAILABLE: i32 = -6;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Shell,
    /// Handed to an injected `ScriptEngine`.
    Embedded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    pub name: String,
    pub section: String,
    pub body: String,
    /// Seconds; `<= 0` is unbounded.
    #[serde(default)]
    pub timeout_secs: i64,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default)]
    pub target: TargetKind,
}

impl ScriptSpec {
    pub fn shell(name: impl Into<String>, section: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            section: section.into(),
            body: body.into(),
            timeout_secs: 0,
            executor: ExecutorKind::Shell,
            target: TargetKind::Remote,
        }
    }

    /// Scripts are identified by (section, name).
    pub fn id(&self) -> (&str, &str) {
        (&self.section, &self.name)
    }
}

/// Ordered steps run as one logical unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpecGroup {
    pub name: String,
    pub steps: Vec<ScriptSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output: String,
    pub variables: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result for a failure the script never got to see.
    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: String::new(),
            variables: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Negative codes are framework failures; they abort script groups.
    pub fn is_framework_failure(&self) -> bool {
        self.exit_code < 0
    }
}
