//! Runs user scripts against targets outside the polling cadence.
//!
//! Every run is raced against a wall-clock deadline. On expiry the work is
//! abandoned, not killed: the spawned task keeps going until the backend
//! notices, and its result is discarded.

pub mod variables;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::backend::{BackendRegistry, OutputSink, TerminationCheck};
use crate::config::ScriptsConfig;
use crate::deadline;
use crate::error::BackendError;
use crate::models::{
    AccountKind, ExecutionResult, ExecutorKind, ScriptSpec, ScriptSpecGroup, TargetKind,
    TargetRecord, exit_code,
};
use crate::version;

pub const ENV_AGENT_VERSION: &str = "FLEETWATCH_AGENT_VERSION";
pub const ENV_API_LEVEL: &str = "FLEETWATCH_API_LEVEL";

/// What an embedded interpreter hands back before it is adapted to an [`ExecutionResult`].
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// `None` when the interpreter stopped without a status.
    pub exit_code: Option<i32>,
    pub output: String,
    /// Expected to be a JSON object of scalars; `Null` means no variables.
    pub variables: serde_json::Value,
}

/// Embedded-interpreter seam. The agent ships none; callers inject one.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn evaluate(
        &self,
        spec: &ScriptSpec,
        target: Option<&TargetRecord>,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> EngineOutcome;
}

#[derive(Clone)]
pub struct ScriptRunner {
    backends: BackendRegistry,
    engine: Option<Arc<dyn ScriptEngine>>,
    config: ScriptsConfig,
}

impl ScriptRunner {
    pub fn new(backends: BackendRegistry, config: ScriptsConfig) -> Self {
        Self {
            backends,
            engine: None,
            config,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Run one script and wait for its result or its deadline.
    #[instrument(skip_all, fields(script = %spec.name, section = %spec.section))]
    pub async fn execute(
        &self,
        spec: &ScriptSpec,
        target: Option<&TargetRecord>,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> ExecutionResult {
        let timeout = deadline::timeout_from_secs(spec.timeout_secs);
        let runner = self.clone();
        let spec_owned = spec.clone();
        let target = target.cloned();
        let env = with_injected_env(env);

        let handle: JoinHandle<ExecutionResult> = tokio::spawn(async move {
            runner
                .run(&spec_owned, target.as_ref(), env, on_output, should_terminate)
                .await
        });

        match deadline::wall_clock_timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "script task failed");
                ExecutionResult::failure(exit_code::EXECUTOR_UNAVAILABLE, format!("script task failed: {}", e))
            }
            Err(_) => {
                tracing::warn!(timeout_secs = spec.timeout_secs, "script deadline elapsed, abandoning run");
                ExecutionResult::failure(
                    exit_code::TIMEOUT,
                    format!("script timed out after {}s", timeout.as_secs()),
                )
            }
        }
    }

    /// Run steps in order. Each step sees `env` overlaid with the previous step's variables;
    /// a negative exit code stops the group and is returned as is.
    #[instrument(skip_all, fields(group = %group.name, steps = group.steps.len()))]
    pub async fn execute_group(
        &self,
        group: &ScriptSpecGroup,
        target: Option<&TargetRecord>,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> ExecutionResult {
        let mut last = ExecutionResult::default();
        for (idx, step) in group.steps.iter().enumerate() {
            let mut step_env = env.clone();
            step_env.extend(last.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
            last = self
                .execute(step, target, &step_env, on_output.clone(), should_terminate.clone())
                .await;
            if last.is_framework_failure() {
                tracing::warn!(step = idx, script = %step.name, exit_code = last.exit_code, "script group aborted");
                return last;
            }
        }
        last
    }

    /// Dispatch `execute` onto `handle` and deliver the result to `completion`.
    /// Cancelling before the task starts means `completion` is never called.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_execute<F>(
        &self,
        handle: &tokio::runtime::Handle,
        spec: ScriptSpec,
        target: Option<TargetRecord>,
        env: BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
        completion: F,
    ) -> ScriptTask
    where
        F: FnOnce(ExecutionResult) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let runner = self.clone();
        let (task_cancelled, task_started) = (cancelled.clone(), started.clone());

        let join = handle.spawn(async move {
            if task_cancelled.load(Ordering::SeqCst) {
                tracing::debug!(script = %spec.name, "script cancelled before dispatch");
                return;
            }
            task_started.store(true, Ordering::SeqCst);
            let flag = task_cancelled.clone();
            let terminate: TerminationCheck =
                Arc::new(move || flag.load(Ordering::SeqCst) || should_terminate());
            let result = runner
                .execute(&spec, target.as_ref(), &env, on_output, terminate)
                .await;
            completion(result);
        });

        ScriptTask {
            cancelled,
            started,
            join,
        }
    }

    async fn run(
        &self,
        spec: &ScriptSpec,
        target: Option<&TargetRecord>,
        env: BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> ExecutionResult {
        match (spec.executor, spec.target) {
            (ExecutorKind::Embedded, _) => {
                self.run_embedded(spec, target, &env, on_output, should_terminate)
                    .await
            }
            (ExecutorKind::Shell, TargetKind::Local) => {
                let local = local_target();
                self.run_shell(spec, &local, &spec.body, env, on_output, should_terminate)
                    .await
            }
            (ExecutorKind::Shell, TargetKind::Remote) => {
                let Some(target) = target else {
                    return ExecutionResult::failure(
                        exit_code::INVALID_TARGET,
                        "remote script requires a target",
                    );
                };
                let (body, env) = if self.config.inline_substitution {
                    (variables::substitute_placeholders(&spec.body, &env), BTreeMap::new())
                } else {
                    (spec.body.clone(), env)
                };
                self.run_shell(spec, target, &body, env, on_output, should_terminate)
                    .await
            }
        }
    }

    async fn run_shell(
        &self,
        spec: &ScriptSpec,
        target: &TargetRecord,
        body: &str,
        env: BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> ExecutionResult {
        let backend = match self.backends.for_target(target) {
            Ok(b) => b,
            Err(e) => return ExecutionResult::failure(exit_code::EXECUTOR_UNAVAILABLE, e.to_string()),
        };
        let candidate = match backend.prepare_connection(target).await {
            Ok(c) => c,
            Err(e @ (BackendError::MissingCredential(_) | BackendError::MalformedCredential(..))) => {
                return ExecutionResult::failure(exit_code::INVALID_TARGET, e.to_string());
            }
            Err(e) => return ExecutionResult::failure(exit_code::EXECUTOR_UNAVAILABLE, e.to_string()),
        };
        let conn = match backend.connect(candidate).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(target_id = %target.id, error = %e, "script connection failed");
                return ExecutionResult::failure(exit_code::CONNECTION_FAILURE, e);
            }
        };

        let captured = Arc::new(Mutex::new(String::new()));
        let sink_buf = captured.clone();
        let sink: OutputSink = Arc::new(move |chunk: &str| {
            if let Ok(mut buf) = sink_buf.lock() {
                buf.push_str(chunk);
            }
            on_output(chunk);
        });

        let code = conn
            .execute_script(body, &env, sink, should_terminate.clone())
            .await;
        conn.disconnect().await;

        let output = captured.lock().map(|b| b.clone()).unwrap_or_default();
        let (plain, vars) = variables::extract_variables(&output);
        match code {
            Some(code) => ExecutionResult {
                exit_code: code,
                output: plain,
                variables: vars,
                error: None,
            },
            None => {
                let (code, msg) = if should_terminate() {
                    (exit_code::TERMINATED, "script terminated on request")
                } else {
                    (exit_code::CONNECTION_FAILURE, "connection lost during script")
                };
                tracing::info!(script = %spec.name, exit_code = code, "{}", msg);
                ExecutionResult {
                    exit_code: code,
                    output: plain,
                    variables: vars,
                    error: Some(msg.to_string()),
                }
            }
        }
    }

    async fn run_embedded(
        &self,
        spec: &ScriptSpec,
        target: Option<&TargetRecord>,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> ExecutionResult {
        let Some(engine) = &self.engine else {
            return ExecutionResult::failure(
                exit_code::EXECUTOR_UNAVAILABLE,
                "no embedded script engine configured",
            );
        };
        let outcome = engine
            .evaluate(spec, target, env, on_output, should_terminate.clone())
            .await;
        adapt_engine_outcome(outcome, should_terminate())
    }
}

/// Map an engine's result onto the shared result shape.
pub fn adapt_engine_outcome(outcome: EngineOutcome, terminated: bool) -> ExecutionResult {
    let variables = match engine_variables(&outcome.variables) {
        Some(v) => v,
        None => {
            return ExecutionResult {
                exit_code: exit_code::MALFORMED_PAYLOAD,
                output: outcome.output,
                variables: BTreeMap::new(),
                error: Some("engine returned malformed variables".into()),
            };
        }
    };
    match outcome.exit_code {
        Some(code) => ExecutionResult {
            exit_code: code,
            output: outcome.output,
            variables,
            error: None,
        },
        None => ExecutionResult {
            exit_code: if terminated {
                exit_code::TERMINATED
            } else {
                exit_code::MALFORMED_PAYLOAD
            },
            output: outcome.output,
            variables,
            error: Some("engine returned no exit status".into()),
        },
    }
}

fn engine_variables(value: &serde_json::Value) -> Option<BTreeMap<String, String>> {
    use serde_json::Value;
    match value {
        Value::Null => Some(BTreeMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    Value::Array(_) | Value::Object(_) => return None,
                };
                Some((k.clone(), s))
            })
            .collect(),
        _ => None,
    }
}

/// Caller env plus the agent's own variables, which take precedence.
pub fn with_injected_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = env.clone();
    merged.insert(ENV_AGENT_VERSION.into(), version::VERSION.into());
    merged.insert(ENV_API_LEVEL.into(), version::API_LEVEL.to_string());
    merged
}

fn local_target() -> TargetRecord {
    TargetRecord {
        id: "local".into(),
        host: "localhost".into(),
        port: 0,
        credential: String::new(),
        account_kind: AccountKind::Local,
        interval_secs: 0,
        tags: BTreeMap::new(),
    }
}

/// Handle to a script dispatched with [`ScriptRunner::spawn_execute`].
pub struct ScriptTask {
    cancelled: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl ScriptTask {
    /// Prevents dispatch if the task has not started; otherwise `should_terminate` turns true.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn was_dispatched(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task (and its completion callback) to finish.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "script task panicked");
        }
    }
}
