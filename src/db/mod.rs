//! Database module: pool setup, migrations and checkpoint rows.
//!
//! - `model`: row types returned by the repository.
//! - `repo`: SQL-only functions over the `partition_state` table.
//!
//! Checkpoint semantics live in `crate::state`; this layer only moves
//! key/value pairs in and out of SQLite.

pub mod model;
pub mod repo;

pub use model::StateRow;
pub use repo::*;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open state database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs are
/// left untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
