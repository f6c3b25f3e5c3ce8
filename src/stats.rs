//! Per-KB statistics overview.
//!
//! Quick summary of what's indexed: tracked files, chunk and embedding
//! counts, and the recorded embedding identity. Used by `kbi stats` to give
//! confidence that ingests are landing as expected.

use anyhow::Result;

use crate::change::ChangeDetector;
use crate::config::Config;
use crate::kb;
use crate::store::{IndexStore, SqliteStore};

/// Run the stats command: inspect one KB and print a summary.
pub async fn run_stats(config: &Config, kb_id: &str) -> Result<()> {
    let kb_dir = kb::kb_dir(&config.kb.base_dir, kb_id)?;
    if !kb_dir.is_dir() {
        anyhow::bail!("KB '{}' does not exist", kb_id);
    }

    let info = kb::read_info(&kb_dir)?;
    let detector = ChangeDetector::load(&kb_dir);
    let detector_stats = detector.stats();

    let store = SqliteStore::open(&kb_dir).await?;
    let chunks = store.chunk_count().await?;
    let embeddings = store.embedding_count().await?;
    store.close().await;

    println!("kb-ingest — Knowledge Base Stats");
    println!("================================");
    println!();
    println!("  KB:          {}", kb_id);
    println!("  Directory:   {}", kb_dir.display());
    match &info {
        Some(info) => {
            println!("  Model:       {}", info.embedding_model);
            println!("  Dimension:   {}", info.embedding_dim);
        }
        None => println!("  Model:       (not yet ingested)"),
    }
    println!();
    println!("  Files:       {}", detector_stats.total_files);
    println!("  Chunks:      {}", chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        embeddings,
        chunks,
        if chunks > 0 {
            (embeddings * 100) / chunks
        } else {
            0
        }
    );
    let last_update = match detector_stats.last_update_epoch {
        Some(ts) => format_ts_relative(ts),
        None => "never".to_string(),
    };
    println!("  Last update: {}", last_update);
    println!();

    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
