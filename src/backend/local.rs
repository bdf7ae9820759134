// Local backend: the agent's own host. Facts come from sysinfo, scripts run under `sh -s`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sysinfo::{Disks, Networks, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::instrument;

use super::process::{self, StreamOutcome};
use super::{
    Auth, Connection, ConnectionCandidate, ExecutionBackend, InteractiveSession, OutputSink,
    SessionDelegate, TerminationCheck, exportable_env,
};
use crate::error::BackendError;
use crate::models::{
    AccountKind, CpuUsage, DiskIo, FileSystemInfo, InterfaceUsage, MemoryInfo, MountUsage,
    NetworkInfo, ProcessInfo, SystemInfo, TargetRecord,
};

/// Sampling window for differenced readings; never below sysinfo's own minimum.
fn sample_window() -> Duration {
    sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_secs(1))
}

const PSEUDO_FILESYSTEMS: &[&str] = &["tmpfs", "devtmpfs", "squashfs", "overlay", "proc", "sysfs"];

#[derive(Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> AccountKind {
        AccountKind::Local
    }

    async fn prepare_connection(
        &self,
        target: &TargetRecord,
    ) -> Result<ConnectionCandidate, BackendError> {
        Ok(ConnectionCandidate {
            target_id: target.id.clone(),
            host: target.host.clone(),
            port: target.port,
            username: std::env::var("USER").unwrap_or_default(),
            auth: Auth::Ambient,
        })
    }

    async fn connect(&self, candidate: ConnectionCandidate) -> Result<Box<dyn Connection>, String> {
        let target_id = candidate.target_id;
        let state = tokio::task::spawn_blocking(LocalState::new)
            .await
            .map_err(|e| format!("sysinfo task join: {}", e))?;
        Ok(Box::new(LocalConnection {
            target_id,
            state: Arc::new(Mutex::new(state)),
        }))
    }
}

struct LocalState {
    sys: System,
    disks: Disks,
    networks: Networks,
}

impl LocalState {
    fn new() -> Self {
        Self {
            sys: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

struct LocalConnection {
    target_id: String,
    state: Arc<Mutex<LocalState>>,
}

impl LocalConnection {
    /// Run `f` on the blocking pool with the sysinfo state locked; `Default` on any failure.
    async fn sample<T, F>(&self, operation: &'static str, f: F) -> T
    where
        T: Default + Send + 'static,
        F: FnOnce(&mut LocalState) -> T + Send + 'static,
    {
        let state = self.state.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|e| anyhow::anyhow!("sysinfo lock poisoned: {}", e))?;
            Ok::<T, anyhow::Error>(f(&mut guard))
        })
        .await;
        match joined {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                tracing::warn!(target_id = %self.target_id, operation, error = %e, "local sample failed");
                T::default()
            }
            Err(e) => {
                tracing::warn!(target_id = %self.target_id, operation, error = %e, "sysinfo task join");
                T::default()
            }
        }
    }
}

fn busy_usage(name: String, busy: f64) -> CpuUsage {
    let busy = if busy.is_finite() { busy.clamp(0.0, 100.0) } else { 0.0 };
    // sysinfo reports only aggregate busy time.
    CpuUsage {
        name,
        user: busy,
        idle: 100.0 - busy,
        ..CpuUsage::default()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn disconnect(&self) {}

    #[instrument(skip(self), fields(backend = "local", operation = "query_process_info"))]
    async fn query_process_info(&self) -> ProcessInfo {
        self.sample("query_process_info", |s| {
            s.sys.refresh_cpu_all();
            std::thread::sleep(sample_window());
            s.sys.refresh_cpu_all();
            s.sys.refresh_processes(ProcessesToUpdate::All, true);

            let load = System::load_average();
            let running = s
                .sys
                .processes()
                .values()
                .filter(|p| p.status() == ProcessStatus::Run)
                .count();
            ProcessInfo {
                summary: busy_usage("cpu".into(), s.sys.global_cpu_usage() as f64),
                cores: s
                    .sys
                    .cpus()
                    .iter()
                    .map(|c| busy_usage(c.name().to_string(), c.cpu_usage() as f64))
                    .collect(),
                load_1: load.one,
                load_5: load.five,
                load_15: load.fifteen,
                running_processes: running as u32,
                total_processes: s.sys.processes().len() as u32,
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "local", operation = "query_memory_info"))]
    async fn query_memory_info(&self) -> MemoryInfo {
        self.sample("query_memory_info", |s| {
            s.sys.refresh_memory();
            let kb = |bytes: u64| bytes / 1024;
            MemoryInfo {
                total_kb: kb(s.sys.total_memory()),
                free_kb: kb(s.sys.free_memory()),
                available_kb: kb(s.sys.available_memory()),
                buffers_kb: 0,
                cached_kb: 0,
                swap_total_kb: kb(s.sys.total_swap()),
                swap_free_kb: kb(s.sys.free_swap()),
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "local", operation = "query_file_system_info"))]
    async fn query_file_system_info(&self) -> FileSystemInfo {
        self.sample("query_file_system_info", |s| {
            s.disks.refresh(true);
            let started = Instant::now();
            std::thread::sleep(sample_window());
            s.disks.refresh(true);
            let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);

            let mut info = FileSystemInfo::default();
            for d in s.disks.list() {
                let fs_type = d.file_system().to_string_lossy().into_owned();
                if PSEUDO_FILESYSTEMS.contains(&fs_type.as_str()) {
                    continue;
                }
                let total = d.total_space() / 1024;
                let available = d.available_space() / 1024;
                let device = d.name().to_string_lossy().into_owned();
                info.mounts.push(MountUsage {
                    device: device.clone(),
                    fs_type,
                    mount_point: d.mount_point().to_string_lossy().into_owned(),
                    total_kb: total,
                    used_kb: total.saturating_sub(available),
                    available_kb: available,
                });
                let usage = d.usage();
                if !info.devices.iter().any(|io: &DiskIo| io.name == device) {
                    info.devices.push(DiskIo {
                        name: device,
                        read_bytes_per_sec: usage.read_bytes as f64 / secs,
                        write_bytes_per_sec: usage.written_bytes as f64 / secs,
                    });
                }
            }
            info
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "local", operation = "query_system_info"))]
    async fn query_system_info(&self) -> SystemInfo {
        self.sample("query_system_info", |_| SystemInfo {
            hostname: System::host_name().unwrap_or_default(),
            os_name: System::long_os_version()
                .or_else(System::name)
                .unwrap_or_else(|| std::env::consts::OS.into()),
            kernel_release: System::kernel_version().unwrap_or_default(),
            uptime_secs: System::uptime(),
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "local", operation = "query_network_info"))]
    async fn query_network_info(&self) -> NetworkInfo {
        self.sample("query_network_info", |s| {
            s.networks.refresh(true);
            let started = Instant::now();
            std::thread::sleep(sample_window());
            s.networks.refresh(true);
            let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);

            let mut interfaces: Vec<InterfaceUsage> = s
                .networks
                .list()
                .iter()
                .map(|(name, data)| InterfaceUsage {
                    name: name.clone(),
                    rx_bytes: data.total_received(),
                    tx_bytes: data.total_transmitted(),
                    rx_bytes_per_sec: data.received() as f64 / secs,
                    tx_bytes_per_sec: data.transmitted() as f64 / secs,
                })
                .collect();
            interfaces.sort_by(|a, b| a.name.cmp(&b.name));
            NetworkInfo { interfaces }
        })
        .await
    }

    #[instrument(skip_all, fields(backend = "local", operation = "execute_script", target = %self.target_id))]
    async fn execute_script(
        &self,
        script: &str,
        env: &BTreeMap<String, String>,
        on_output: OutputSink,
        should_terminate: TerminationCheck,
    ) -> Option<i32> {
        let mut cmd = Command::new("sh");
        cmd.arg("-s").envs(exportable_env(env));
        let mut payload = script.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        match process::run_streaming(cmd, Some(payload.into_bytes()), on_output, should_terminate)
            .await
        {
            Ok(StreamOutcome::Exited(code)) => code,
            Ok(StreamOutcome::Terminated) => None,
            Err(e) => {
                tracing::warn!(error = %e, "script launch failed");
                None
            }
        }
    }

    async fn open_interactive_session(
        &self,
        env: &BTreeMap<String, String>,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Option<InteractiveSession> {
        let mut cmd = Command::new("sh");
        cmd.arg("-i").envs(exportable_env(env));
        process::spawn_interactive(cmd, delegate)
            .map_err(|e| {
                tracing::warn!(target_id = %self.target_id, error = %e, "interactive session failed to start");
            })
            .ok()
    }

    fn is_multiplex_safe(&self) -> bool {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{discard_output, never_terminate};

    async fn connection() -> Box<dyn Connection> {
        let backend = LocalBackend::new();
        let target = TargetRecord::new("localhost", 0, "");
        let candidate = backend.prepare_connection(&target).await.unwrap();
        backend.connect(candidate).await.unwrap()
    }

    #[tokio::test]
    async fn memory_and_system_are_populated() {
        let conn = connection().await;
        let mem = conn.query_memory_info().await;
        assert!(mem.total_kb > 0);
        let sys = conn.query_system_info().await;
        assert!(sys.uptime_secs > 0);
    }

    #[tokio::test]
    async fn script_sees_env_and_exit_code() {
        let conn = connection().await;
        let env = BTreeMap::from([("GREETING".to_string(), "hi there".to_string())]);
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let code = conn
            .execute_script(
                "echo \"$GREETING\"\nexit 4",
                &env,
                Arc::new(move |c: &str| sink.lock().unwrap().push_str(c)),
                never_terminate(),
            )
            .await;
        assert_eq!(code, Some(4));
        assert_eq!(seen.lock().unwrap().trim(), "hi there");
    }

    struct Recorder {
        output: Mutex<Vec<u8>>,
        closed: tokio::sync::Notify,
        code: Mutex<Option<Option<i32>>>,
    }

    impl SessionDelegate for Recorder {
        fn on_output(&self, data: &[u8]) {
            self.output.lock().unwrap().extend_from_slice(data);
        }

        fn on_closed(&self, exit_code: Option<i32>) {
            *self.code.lock().unwrap() = Some(exit_code);
            self.closed.notify_one();
        }
    }

    #[tokio::test]
    async fn interactive_session_runs_commands() {
        let conn = connection().await;
        let recorder = Arc::new(Recorder {
            output: Mutex::new(Vec::new()),
            closed: tokio::sync::Notify::new(),
            code: Mutex::new(None),
        });
        let session = conn
            .open_interactive_session(&BTreeMap::new(), recorder.clone())
            .await
            .unwrap();
        assert!(session.write(b"echo interactive-ok\nexit 3\n").await);
        tokio::time::timeout(Duration::from_secs(10), recorder.closed.notified())
            .await
            .unwrap();
        assert_eq!(*recorder.code.lock().unwrap(), Some(Some(3)));
        // Output readers run separately from the exit watcher.
        let mut seen = false;
        for _ in 0..100 {
            let out = String::from_utf8_lossy(&recorder.output.lock().unwrap()).into_owned();
            if out.contains("interactive-ok") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen);
        session.close().await;
    }

    #[tokio::test]
    async fn terminated_script_has_no_code() {
        let conn = connection().await;
        let code = conn
            .execute_script("sleep 30", &BTreeMap::new(), discard_output(), Arc::new(|| true))
            .await;
        assert_eq!(code, None);
    }
}
