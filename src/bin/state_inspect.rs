use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use opensea_tap::config;
use opensea_tap::db;
use opensea_tap::state::SqliteStateStore;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show this stream
    #[arg(long)]
    stream: Option<String>,

    /// Forget the checkpoint of this collection (requires --stream)
    #[arg(long, requires = "stream")]
    reset: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/state.db", cfg.app.resolved_data_dir()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if let (Some(stream), Some(collection)) = (args.stream.as_deref(), args.reset.as_deref()) {
        let removed = db::delete_partition_state(&pool, stream, collection).await?;
        println!("Removed {} keys for {}/{}", removed, stream, collection);
        return Ok(());
    }

    let rows = db::list_partition_state(&pool, args.stream.as_deref()).await?;
    if rows.is_empty() {
        println!("No checkpoints stored.");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:<20} {:<30} {:<20} {} ({})",
            row.stream, row.partition, row.key, row.value, row.updated_at
        );
    }

    let store = SqliteStateStore::new(pool);
    let streams: std::collections::BTreeSet<&str> = rows.iter().map(|r| r.stream.as_str()).collect();
    for stream in streams {
        let snapshot = store.snapshot(stream).await?;
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ stream: snapshot }))?);
    }
    Ok(())
}
