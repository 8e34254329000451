//! Per-partition checkpoint and its persistence boundary.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::clock::parse_event_time;
use crate::db::{self, Pool};

pub const KEY_LAST_SEEN: &str = "last_seen_timestamp";
pub const KEY_WINDOW_END: &str = "last_window_end";
pub const KEY_CURSOR: &str = "cursor_token";

// Key names written by earlier releases of the connector.
const LEGACY_KEYS: [(&str, &str); 3] = [
    ("last_date", KEY_LAST_SEEN),
    ("last_end_key", KEY_WINDOW_END),
    ("cursor_key", KEY_CURSOR),
];

/// Progress of one partition. Which fields are written depends on the
/// pagination mode; absent fields mean "start fresh".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_seen_timestamp: Option<String>,
    pub last_window_end: Option<String>,
    pub cursor_token: Option<String>,
}

impl Checkpoint {
    /// Build from stored key/value pairs. Current key names win over legacy
    /// aliases; unknown keys and blank values are ignored.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map: BTreeMap<String, String> = entries
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        for (legacy, current) in LEGACY_KEYS {
            if let Some(value) = map.remove(legacy) {
                map.entry(current.to_string()).or_insert(value);
            }
        }
        Self {
            last_seen_timestamp: map.remove(KEY_LAST_SEEN),
            last_window_end: map.remove(KEY_WINDOW_END),
            cursor_token: map.remove(KEY_CURSOR),
        }
    }

    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(v) = self.cursor_token.as_deref() {
            out.push((KEY_CURSOR, v));
        }
        if let Some(v) = self.last_seen_timestamp.as_deref() {
            out.push((KEY_LAST_SEEN, v));
        }
        if let Some(v) = self.last_window_end.as_deref() {
            out.push((KEY_WINDOW_END, v));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen_timestamp.is_none()
            && self.last_window_end.is_none()
            && self.cursor_token.is_none()
    }

    /// The stored watermark, if it parses. A malformed value is treated as
    /// absent.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.last_seen_timestamp.as_deref().and_then(parse_event_time)
    }

    /// Store `candidate` as the watermark only when it is strictly later than
    /// the current one. Returns whether the watermark moved.
    pub fn advance_watermark(&mut self, candidate: &str) -> bool {
        let Some(candidate_time) = parse_event_time(candidate) else {
            warn!(candidate, "ignoring unparseable watermark candidate");
            return false;
        };
        match self.watermark() {
            Some(current) if current >= candidate_time => false,
            _ => {
                self.last_seen_timestamp = Some(candidate.trim().to_string());
                true
            }
        }
    }

    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        self.last_window_end.as_deref().and_then(parse_event_time)
    }
}

/// Persisted run state, scoped by stream and partition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, stream: &str, partition: &str) -> Result<Checkpoint>;

    async fn commit(&self, stream: &str, partition: &str, checkpoint: &Checkpoint) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// All checkpoints of a stream, keyed by partition.
    pub async fn snapshot(&self, stream: &str) -> Result<BTreeMap<String, Checkpoint>> {
        let rows = db::list_partition_state(&self.pool, Some(stream)).await?;
        let mut grouped: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for row in rows {
            grouped
                .entry(row.partition)
                .or_default()
                .push((row.key, row.value));
        }
        Ok(grouped
            .into_iter()
            .map(|(partition, entries)| (partition, Checkpoint::from_entries(entries)))
            .collect())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, stream: &str, partition: &str) -> Result<Checkpoint> {
        let entries = db::load_partition_state(&self.pool, stream, partition).await?;
        Ok(Checkpoint::from_entries(entries))
    }

    async fn commit(&self, stream: &str, partition: &str, checkpoint: &Checkpoint) -> Result<()> {
        db::replace_partition_state(&self.pool, stream, partition, &checkpoint.entries()).await
    }
}
