// History maintenance: retention pruning on a fixed cadence, VACUUM on a cron expression
// (local time) or fixed interval. Undecodable rows are swept once at startup.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::history_repo::HistoryRepo;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub prune_interval_secs: u64,
    /// Cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    pub vacuum_interval_secs: u64,
}

pub fn spawn(
    repo: Arc<HistoryRepo>,
    config: MaintenanceConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(repo, config, shutdown_rx).await;
    })
}

#[instrument(skip(repo, shutdown_rx), fields(prune_interval_secs = config.prune_interval_secs))]
async fn run(
    repo: Arc<HistoryRepo>,
    config: MaintenanceConfig,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    match repo.prune(None, true).await {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "dropped undecodable history rows"),
        Err(e) => warn!(error = %e, operation = "prune", "startup sweep failed"),
    }

    let mut prune_tick = tokio::time::interval(Duration::from_secs(config.prune_interval_secs));
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (vacuum_tx, mut vacuum_rx) = tokio::sync::mpsc::channel::<()>(1);
    let vacuum_task = tokio::spawn(vacuum_scheduler(config.clone(), vacuum_tx));
    let mut rows_pruned_total: u64 = 0;

    loop {
        tokio::select! {
            _ = prune_tick.tick() => {
                match repo.prune_old_data().await {
                    Ok(n) => {
                        rows_pruned_total += n;
                        tracing::debug!(operation = "prune_old_data", removed = n, rows_pruned_total, "Old data pruned");
                    }
                    Err(e) => warn!(error = %e, operation = "prune_old_data", "Failed to prune old data"),
                }
            }
            Some(()) = vacuum_rx.recv() => {
                if let Err(e) = repo.vacuum().await {
                    warn!(error = %e, "vacuum failed");
                } else {
                    info!("vacuum complete");
                }
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("Maintenance worker shutting down");
                break;
            }
        }
    }
    vacuum_task.abort();
}

/// Time until the next VACUUM, `None` when the schedule has no future occurrence.
pub fn next_vacuum_delay(config: &MaintenanceConfig) -> anyhow::Result<Option<Duration>> {
    match &config.vacuum_schedule {
        Some(cron_str) => {
            let schedule = cron::Schedule::from_str(cron_str)
                .map_err(|e| anyhow::anyhow!("invalid vacuum_schedule {:?}: {}", cron_str, e))?;
            let now = chrono::Local::now();
            Ok(schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or(Duration::from_secs(1))))
        }
        None => Ok(Some(Duration::from_secs(config.vacuum_interval_secs))),
    }
}

/// Sends a message on `tx` at each VACUUM time.
async fn vacuum_scheduler(config: MaintenanceConfig, tx: tokio::sync::mpsc::Sender<()>) {
    loop {
        match next_vacuum_delay(&config) {
            Ok(Some(delay)) => {
                tokio::time::sleep(delay).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
            Ok(None) => tokio::time::sleep(Duration::from_secs(3600)).await,
            Err(e) => {
                warn!(error = %e, "VACUUM will not run");
                return;
            }
        }
    }
}
