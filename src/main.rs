use anyhow::Result;
use fleetwatch::*;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(version = version::VERSION, api_level = version::API_LEVEL, "{} starting", version::NAME);

    let master_key = std::env::var(&app_config.vault.master_key_env).map_err(|_| {
        anyhow::anyhow!(
            "master key environment variable {} is not set",
            app_config.vault.master_key_env
        )
    })?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<&'static str>(1);
    let critical_shutdown = shutdown_tx.clone();
    let critical: error::CriticalErrorHook = Arc::new(move |e: &error::CriticalError| {
        tracing::error!(error = %e, "runtime-critical error, shutting down");
        let _ = critical_shutdown.try_send("critical error");
    });

    let vault = Arc::new(
        vault::CredentialVault::initialize(&app_config.vault.dir, &master_key)
            .map_err(error::FatalError::from)?
            .with_critical_hook(critical.clone()),
    );
    drop(master_key);
    tracing::info!(credentials = vault.identities().len(), "vault ready");

    let snapshots_saved_total = Arc::new(AtomicU64::new(0));
    let mut history_tx = None;
    let mut history_handles = Vec::new();
    let mut maintenance_shutdown = None;
    if app_config.history.enabled {
        let repo = Arc::new(
            history_repo::HistoryRepo::connect(
                &app_config.history.path,
                app_config.history.retention_days,
            )
            .await
            .map_err(error::FatalError::HistorySchema)?,
        );
        repo.init().await.map_err(error::FatalError::HistorySchema)?;

        let (write_tx, write_rx) = tokio::sync::mpsc::channel(worker::writer_channel_capacity(
            app_config.history.flush_rate,
        ));
        history_handles.push(worker::spawn_history_writer(
            write_rx,
            repo.clone(),
            worker::HistoryWriterConfig {
                flush_rate: app_config.history.flush_rate,
                flush_interval_secs: app_config.history.flush_interval_secs,
            },
            snapshots_saved_total.clone(),
        ));
        let (tx, rx) = tokio::sync::oneshot::channel();
        history_handles.push(maintenance_worker::spawn(
            repo,
            maintenance_worker::MaintenanceConfig {
                prune_interval_secs: app_config.history.prune_interval_secs,
                vacuum_schedule: app_config.history.vacuum_schedule.clone(),
                vacuum_interval_secs: app_config.history.vacuum_interval_secs,
            },
            rx,
        ));
        maintenance_shutdown = Some(tx);
        history_tx = Some(write_tx);
    }

    let credentials: Arc<dyn vault::CredentialStore> = vault.clone();
    let backends = backend::BackendRegistry::new()
        .with(Arc::new(backend::SshBackend::new(
            app_config.ssh.clone(),
            credentials.clone(),
        )))
        .with(Arc::new(backend::LocalBackend::new()));

    let scheduler = scheduler::SupervisionScheduler::new(
        &app_config.scheduler,
        app_config.registry_path(),
        scheduler::SchedulerDeps {
            backends,
            credentials,
            history_tx,
            critical,
        },
    );
    scheduler.load()?;

    let (worker_shutdown_tx, worker_shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            scheduler: scheduler.clone(),
            snapshots_saved_total,
            shutdown_rx: worker_shutdown_rx,
        },
        worker::WorkerConfig {
            tick_interval_ms: app_config.scheduler.tick_interval_ms,
            stats_log_interval_secs: app_config.scheduler.stats_log_interval_secs,
        },
    );

    let reason = tokio::select! {
        reason = shutdown_rx.recv() => reason.unwrap_or("shutdown channel closed"),
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        } => "signal",
    };
    tracing::info!(reason, "Received shutdown signal");

    let _ = worker_shutdown_tx.send(());
    let _ = worker_handle.await;
    scheduler.flush().await;
    if let Some(tx) = maintenance_shutdown {
        let _ = tx.send(());
    }
    // Dropping the scheduler releases its history sender so the writer drains and exits.
    drop(scheduler);
    for handle in history_handles {
        let _ = handle.await;
    }
    drop(shutdown_tx);
    Ok(())
}
