// Background tick loop driving the scheduler, plus the batching history writer.
// Polls are dispatched by the scheduler; persistence runs in a dedicated writer task (channel).

use crate::history_repo::{HistoryEntry, HistoryRepo};
use crate::scheduler::SupervisionScheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

/// Channel capacity for the history writer (backpressure if writer falls behind).
pub fn writer_channel_capacity(flush_rate: u64) -> usize {
    (flush_rate as usize * 2).max(32)
}

pub struct WorkerDeps {
    pub scheduler: SupervisionScheduler,
    pub snapshots_saved_total: Arc<AtomicU64>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Tick and stats-logging cadence.
pub struct WorkerConfig {
    pub tick_interval_ms: u64,
    /// How often to log app stats (real seconds).
    pub stats_log_interval_secs: u64,
}

/// Failed batches kept for retry before the oldest snapshots are dropped.
const MAX_PENDING_BATCHES: usize = 10;

/// Batching for the dedicated history writer task.
pub struct HistoryWriterConfig {
    pub flush_rate: u64,
    pub flush_interval_secs: u64,
}

impl HistoryWriterConfig {
    /// Upper bound on buffered snapshots while the database keeps rejecting writes.
    pub fn max_buffered(&self) -> usize {
        (self.flush_rate as usize).max(1) * MAX_PENDING_BATCHES
    }
}

/// Spawns the task that receives snapshots from finished polls and flushes them to the DB.
/// Flushes when buffer len >= flush_rate, every flush_interval_secs, or when the channel closes.
pub fn spawn_history_writer(
    mut write_rx: mpsc::Receiver<HistoryEntry>,
    history_repo: Arc<HistoryRepo>,
    config: HistoryWriterConfig,
    snapshots_saved_total: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    let flush_interval = Duration::from_secs(config.flush_interval_secs);
    let max_buffered = config.max_buffered();
    tokio::spawn(async move {
        let mut buffer: Vec<HistoryEntry> = Vec::new();
        let mut flush_tick = interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = write_rx.recv() => {
                    match result {
                        Some(entry) => {
                            buffer.push(entry);
                            if buffer.len() >= config.flush_rate as usize
                                && let Err(e) = flush_buffer(&history_repo, &mut buffer, &snapshots_saved_total).await
                            {
                                tracing::warn!(error = %e, "history writer: insert_many failed");
                                drop_oldest(&mut buffer, max_buffered);
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = flush_buffer(&history_repo, &mut buffer, &snapshots_saved_total).await {
                        tracing::warn!(error = %e, "history writer: insert_many failed");
                        drop_oldest(&mut buffer, max_buffered);
                    }
                }
            }
        }
        if let Err(e) = flush_buffer(&history_repo, &mut buffer, &snapshots_saved_total).await {
            tracing::warn!(error = %e, "history writer: final flush failed");
        }
        tracing::debug!("History writer shutting down");
    })
}

async fn flush_buffer(
    history_repo: &HistoryRepo,
    buffer: &mut Vec<HistoryEntry>,
    snapshots_saved_total: &AtomicU64,
) -> anyhow::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let n = buffer.len();
    history_repo.insert_many(buffer).await?;
    snapshots_saved_total.fetch_add(n as u64, Ordering::Relaxed);
    buffer.clear();
    tracing::debug!(operation = "insert_many", snapshots_count = n, "Snapshots saved");
    Ok(())
}

/// Keep at most `max` of the newest entries.
fn drop_oldest(buffer: &mut Vec<HistoryEntry>, max: usize) {
    if buffer.len() <= max {
        return;
    }
    let dropped = buffer.len() - max;
    buffer.drain(..dropped);
    tracing::warn!(dropped, kept = max, "history writer backlog full, oldest snapshots discarded");
}

pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        scheduler,
        snapshots_saved_total,
        mut shutdown_rx,
    } = deps;
    let WorkerConfig {
        tick_interval_ms,
        stats_log_interval_secs,
    } = config;

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stats_log_tick = interval(Duration::from_secs(stats_log_interval_secs));
        stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut dispatched_total: u64 = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    dispatched_total += scheduler.tick() as u64;
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Worker shutting down");
                    break;
                }
                _ = stats_log_tick.tick() => {
                    let targets = scheduler.targets();
                    tracing::info!(
                        targets = targets.len(),
                        supervised = targets.iter().filter(|t| t.is_supervised()).count(),
                        polls_in_flight = scheduler.pending_count(),
                        polls_dispatched_total = dispatched_total,
                        snapshots_saved_total = snapshots_saved_total.load(Ordering::Relaxed),
                        "app stats"
                    );
                }
            }
        }
    })
}
