// Worker integration tests: tick loop drives polls into the history writer; shutdown flushes history

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::*;
use fleetwatch::error::log_only_hook;
use fleetwatch::history_repo::{HistoryEntry, HistoryRepo};
use fleetwatch::scheduler::{SchedulerDeps, SupervisionScheduler};
use fleetwatch::worker::{
    HistoryWriterConfig, WorkerConfig, WorkerDeps, spawn, spawn_history_writer,
    writer_channel_capacity,
};
use tempfile::TempDir;

async fn open_repo(dir: &TempDir) -> Arc<HistoryRepo> {
    let path = dir.path().join("history.db");
    let repo = Arc::new(HistoryRepo::connect(path.to_str().unwrap(), 3).await.unwrap());
    repo.init().await.unwrap();
    repo
}

#[tokio::test]
async fn history_writer_flushes_on_close() {
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&dir).await;
    let saved = Arc::new(AtomicU64::new(0));
    let (tx, rx) = tokio::sync::mpsc::channel(writer_channel_capacity(10));
    let handle = spawn_history_writer(
        rx,
        repo.clone(),
        HistoryWriterConfig {
            flush_rate: 10,
            flush_interval_secs: 3600,
        },
        saved.clone(),
    );

    for i in 0..3 {
        tx.send(HistoryEntry {
            target_id: "a".into(),
            snapshot: full_snapshot(),
            created_at: i,
        })
        .await
        .unwrap();
    }
    drop(tx);
    handle.await.unwrap();

    assert_eq!(saved.load(Ordering::Relaxed), 3);
    assert_eq!(repo.count().await.unwrap(), 3);
}

#[tokio::test]
async fn worker_ticks_polls_into_history_and_shuts_down() {
    let dir = TempDir::new().unwrap();
    let repo = open_repo(&dir).await;
    let saved = Arc::new(AtomicU64::new(0));
    let (write_tx, write_rx) = tokio::sync::mpsc::channel(writer_channel_capacity(2));
    let writer_handle = spawn_history_writer(
        write_rx,
        repo.clone(),
        HistoryWriterConfig {
            flush_rate: 2,
            flush_interval_secs: 60,
        },
        saved.clone(),
    );

    let store = MemoryStore::new();
    store.put("cred-a", "root");
    let scheduler = SupervisionScheduler::new(
        &scheduler_config(),
        dir.path().join("targets.json"),
        SchedulerDeps {
            backends: registry_with(FakeBackend::new(FakeSettings::default())),
            credentials: store,
            history_tx: Some(write_tx),
            critical: log_only_hook(),
        },
    );
    let id = scheduler.register(target("web-01", "cred-a", 1)).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_handle = spawn(
        WorkerDeps {
            scheduler: scheduler.clone(),
            snapshots_saved_total: saved.clone(),
            shutdown_rx,
        },
        WorkerConfig {
            tick_interval_ms: 50,
            stats_log_interval_secs: 300,
        },
    );

    assert!(wait_until(Duration::from_secs(5), || scheduler.snapshot(&id).is_some()).await);
    shutdown_tx.send(()).unwrap();
    worker_handle.await.unwrap();

    scheduler.flush().await;
    drop(scheduler);
    tokio::time::timeout(Duration::from_secs(5), writer_handle)
        .await
        .expect("writer exits once the scheduler is gone")
        .unwrap();

    let rows = repo.query(&id).await.unwrap();
    assert!(!rows.is_empty());
    assert_eq!(rows[0].1, full_snapshot());
    assert!(saved.load(Ordering::Relaxed) >= 1);
}
