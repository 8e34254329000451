use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

use opensea_tap::client::MarketplaceClient;
use opensea_tap::config;
use opensea_tap::db;
use opensea_tap::driver::StreamDriver;
use opensea_tap::output::{catalog, JsonLinesSink};
use opensea_tap::pagination::StrategySettings;
use opensea_tap::partition;
use opensea_tap::state::SqliteStateStore;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Write messages to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Comma-separated collection slugs, overrides sync.collections
    #[arg(long)]
    collections: Option<String>,

    /// Print the stream catalog and exit
    #[arg(long)]
    discover: bool,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the data stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let mut cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(collections) = args.collections {
        cfg.sync.collections = collections;
        config::validate(&cfg)?;
    }
    let stream = cfg.api.schema_version.stream_name();

    if args.discover {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer_pretty(&mut out, &catalog(stream))?;
        writeln!(out)?;
        return Ok(());
    }

    cfg.ensure_dirs()?;
    let run_id = Uuid::new_v4();
    let now = Utc::now();
    info!(%run_id, stream, collections = %cfg.sync.collections, "tap starting");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/state.db", cfg.app.resolved_data_dir()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStateStore::new(pool);

    let client = MarketplaceClient::from_config(&cfg)?;
    let driver = StreamDriver::new(
        &client,
        &store,
        cfg.api.schema_version,
        cfg.sync.max_pages_per_partition,
    );
    let settings = StrategySettings::from_config(&cfg);

    let out: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let mut sink = JsonLinesSink::new(out);

    let summary = partition::sync(&driver, &settings, &cfg.sync.collections, now, &mut sink).await?;
    sink.into_inner().flush()?;

    for report in summary.failed() {
        error!(
            %run_id,
            collection = %report.collection_id,
            state = report.state.as_str(),
            error = ?report.error,
            "partition did not finish"
        );
    }
    if !summary.is_success() {
        bail!(
            "{} of {} partitions failed",
            summary.failed().count(),
            summary.reports.len()
        );
    }
    info!(%run_id, emitted = summary.emitted(), "tap finished");
    Ok(())
}
