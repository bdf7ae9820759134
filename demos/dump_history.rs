// Dump the most recent snapshot_history rows of one target as JSON (decodes wincode BLOBs).
//
// Usage: cargo run --example dump_history -- TARGET_ID [DB_PATH] [LIMIT]
//   DB_PATH  default: ./data/history.db
//   LIMIT    default: 5

use fleetwatch::history_repo::HistoryRepo;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let target_id = args
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("usage: dump_history TARGET_ID [DB_PATH] [LIMIT]"))?;
    let path = args.get(2).map(String::as_str).unwrap_or("./data/history.db");
    let limit: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(5);

    let repo = HistoryRepo::connect(path, 7).await?;
    let rows = repo.query(target_id).await?;
    let recent = &rows[rows.len().saturating_sub(limit)..];

    println!("{}", serde_json::to_string_pretty(recent)?);
    Ok(())
}
