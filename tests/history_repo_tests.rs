// HistoryRepo tests: connect, init, insert, query, purge, prune

mod common;

use common::{full_snapshot, sparse_snapshot};
use fleetwatch::history_repo::{HistoryEntry, HistoryRepo};
use tempfile::TempDir;

async fn open(dir: &TempDir) -> HistoryRepo {
    let path = dir.path().join("history.db");
    let repo = HistoryRepo::connect(path.to_str().unwrap(), 7).await.unwrap();
    repo.init().await.unwrap();
    repo
}

fn now_ms() -> i64 {
    fleetwatch::deadline::now_millis() as i64
}

#[tokio::test]
async fn history_repo_connect_and_init() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    // Second init is no-op (IF NOT EXISTS)
    repo.init().await.unwrap();
    assert_eq!(repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn history_repo_creates_parent_dirs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/deeper/history.db");
    let repo = HistoryRepo::connect(path.to_str().unwrap(), 7).await.unwrap();
    repo.init().await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn history_repo_query_is_ascending_per_target() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    repo.insert("a", &full_snapshot(), 3_000).await.unwrap();
    repo.insert("a", &sparse_snapshot(), 1_000).await.unwrap();
    repo.insert("b", &full_snapshot(), 2_000).await.unwrap();

    let rows = repo.query("a").await.unwrap();
    let times: Vec<i64> = rows.iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![1_000, 3_000]);
    assert_eq!(rows[0].1, sparse_snapshot());
    assert_eq!(rows[1].1, full_snapshot());
    assert_eq!(repo.query("b").await.unwrap().len(), 1);
    assert!(repo.query("c").await.unwrap().is_empty());
}

#[tokio::test]
async fn history_repo_insert_many() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    let entries: Vec<HistoryEntry> = (0..5)
        .map(|i| HistoryEntry {
            target_id: "a".into(),
            snapshot: full_snapshot(),
            created_at: 1_000 + i,
        })
        .collect();
    repo.insert_many(&entries).await.unwrap();
    repo.insert_many(&[]).await.unwrap();
    assert_eq!(repo.count().await.unwrap(), 5);
}

#[tokio::test]
async fn history_repo_purge_all_is_repeatable() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    repo.insert("a", &full_snapshot(), 1).await.unwrap();
    repo.purge_all().await.unwrap();
    repo.purge_all().await.unwrap();
    assert_eq!(repo.count().await.unwrap(), 0);
    // Table is usable afterwards.
    repo.insert("a", &full_snapshot(), 2).await.unwrap();
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn history_repo_prune_by_cutoff() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    repo.insert("a", &full_snapshot(), 100).await.unwrap();
    repo.insert("a", &full_snapshot(), 200).await.unwrap();
    repo.insert("a", &full_snapshot(), 300).await.unwrap();

    assert_eq!(repo.prune(Some(250), false).await.unwrap(), 2);
    let rows = repo.query("a").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, 300);
    assert_eq!(repo.prune(None, false).await.unwrap(), 0);
}

#[tokio::test]
async fn history_repo_undecodable_rows_are_skipped_and_pruned() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    repo.insert("a", &full_snapshot(), 100).await.unwrap();
    // Unknown payload version and a truncated body.
    repo.insert_raw("a", 150, &[99, 1, 2, 3]).await.unwrap();
    repo.insert_raw("a", 175, &[1]).await.unwrap();
    repo.insert("a", &full_snapshot(), 200).await.unwrap();

    assert_eq!(repo.query("a").await.unwrap().len(), 2);
    assert_eq!(repo.count().await.unwrap(), 4);

    assert_eq!(repo.prune(None, true).await.unwrap(), 2);
    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
async fn history_repo_prune_old_data_keeps_recent() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;
    let day_ms = 24 * 60 * 60 * 1000;
    repo.insert("a", &full_snapshot(), now_ms() - 30 * day_ms).await.unwrap();
    repo.insert("a", &full_snapshot(), now_ms()).await.unwrap();

    assert_eq!(repo.prune_old_data().await.unwrap(), 1);
    assert_eq!(repo.count().await.unwrap(), 1);
    repo.vacuum().await.unwrap();
}
