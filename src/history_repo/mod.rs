// SQLite snapshot history, one row per (target, poll). Payloads are version-prefixed wincode blobs.

mod blob;

use std::path::Path;
use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use crate::models::ServerSnapshot;

/// Rows examined per batch when looking for undecodable payloads.
const SCAN_PAGE: i64 = 500;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS snapshot_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        target_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        payload BLOB NOT NULL
    )
"#;

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_snapshot_history_target_created ON snapshot_history(target_id, created_at)";

/// One row to be written. `created_at` is unix milliseconds.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub target_id: String,
    pub snapshot: ServerSnapshot,
    pub created_at: i64,
}

pub struct HistoryRepo {
    pool: SqlitePool,
    retention_ms: i64,
}

impl HistoryRepo {
    pub async fn connect(path: &str, retention_days: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        let retention_ms = (retention_days as i64) * 24 * 60 * 60 * 1000;
        Ok(Self { pool, retention_ms })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, snapshot), fields(repo = "history", operation = "insert"))]
    pub async fn insert(
        &self,
        target_id: &str,
        snapshot: &ServerSnapshot,
        created_at: i64,
    ) -> anyhow::Result<()> {
        let payload = blob::encode_snapshot(snapshot)?;
        sqlx::query("INSERT INTO snapshot_history (target_id, created_at, payload) VALUES ($1, $2, $3)")
            .bind(target_id)
            .bind(created_at)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a batch in one transaction.
    #[instrument(skip(self, entries), fields(repo = "history", operation = "insert_many", entries_count = entries.len()))]
    pub async fn insert_many(&self, entries: &[HistoryEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for e in entries {
            let payload = blob::encode_snapshot(&e.snapshot)?;
            sqlx::query(
                "INSERT INTO snapshot_history (target_id, created_at, payload) VALUES ($1, $2, $3)",
            )
            .bind(&e.target_id)
            .bind(e.created_at)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All rows for a target, ascending by time. Undecodable rows are skipped.
    #[instrument(skip(self), fields(repo = "history", operation = "query"))]
    pub async fn query(&self, target_id: &str) -> anyhow::Result<Vec<(i64, ServerSnapshot)>> {
        let rows = sqlx::query(
            "SELECT created_at, payload FROM snapshot_history WHERE target_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in rows {
            let created_at: i64 = row.try_get("created_at")?;
            let payload: Vec<u8> = row.try_get("payload")?;
            match blob::decode_snapshot(&payload) {
                Some(s) => out.push((created_at, s)),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(target_id, skipped, "skipped undecodable history rows");
        }
        Ok(out)
    }

    /// Drop and recreate the table. Safe to call repeatedly.
    #[instrument(skip(self), fields(repo = "history", operation = "purge_all"))]
    pub async fn purge_all(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS snapshot_history")
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        sqlx::query(CREATE_INDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove rows older than `older_than` (unix ms) and, when asked, rows that no longer decode.
    #[instrument(skip(self), fields(repo = "history", operation = "prune"))]
    pub async fn prune(&self, older_than: Option<i64>, drop_undecodable: bool) -> anyhow::Result<u64> {
        let mut removed = 0u64;
        if let Some(cutoff) = older_than {
            removed += sqlx::query("DELETE FROM snapshot_history WHERE created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        if drop_undecodable {
            removed += self.delete_undecodable().await?;
        }
        Ok(removed)
    }

    async fn delete_undecodable(&self) -> anyhow::Result<u64> {
        let mut removed = 0u64;
        let mut after_id = 0i64;
        loop {
            let rows = sqlx::query(
                "SELECT id, payload FROM snapshot_history WHERE id > $1 ORDER BY id ASC LIMIT $2",
            )
            .bind(after_id)
            .bind(SCAN_PAGE)
            .fetch_all(&self.pool)
            .await?;
            let Some(last) = rows.last() else {
                break;
            };
            after_id = last.try_get("id")?;

            let mut bad = Vec::new();
            for row in &rows {
                let payload: Vec<u8> = row.try_get("payload")?;
                if blob::decode_snapshot(&payload).is_none() {
                    bad.push(row.try_get::<i64, _>("id")?);
                }
            }
            for id in bad {
                removed += sqlx::query("DELETE FROM snapshot_history WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected();
            }
            if (rows.len() as i64) < SCAN_PAGE {
                break;
            }
        }
        Ok(removed)
    }

    /// Drop rows past the configured retention.
    #[instrument(skip(self), fields(repo = "history", operation = "prune_old_data"))]
    pub async fn prune_old_data(&self) -> anyhow::Result<u64> {
        let cutoff = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as i64)
            - self.retention_ms;
        self.prune(Some(cutoff), false).await
    }

    /// Reclaim space after deletes.
    #[instrument(skip(self), fields(repo = "history", operation = "vacuum"))]
    pub async fn vacuum(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM snapshot_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Raw insert, bypassing encoding. Lets tests plant rows in an old or broken layout.
    #[doc(hidden)]
    pub async fn insert_raw(&self, target_id: &str, created_at: i64, payload: &[u8]) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO snapshot_history (target_id, created_at, payload) VALUES ($1, $2, $3)")
            .bind(target_id)
            .bind(created_at)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
