//! Collections → partitions, and the loop that runs each one in isolation.
use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::driver::{PartitionReport, StreamDriver};
use crate::model::Partition;
use crate::output::RecordSink;
use crate::pagination::{strategy_for, StrategySettings};
use crate::state::Checkpoint;

// Slugs end up as a URL path segment.
static SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._~-]*$").expect("slug pattern compiles"));

/// Split a comma-separated collection list into partitions. Entries are
/// trimmed; empty, duplicate and non-slug entries are skipped.
pub fn partitions_from_config(collections: &str) -> Vec<Partition> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in collections.split(',') {
        let slug = raw.trim();
        if slug.is_empty() {
            continue;
        }
        if !SLUG.is_match(slug) {
            warn!(slug, "skipping collection that is not a valid slug");
            continue;
        }
        if !seen.insert(slug.to_string()) {
            warn!(slug, "skipping duplicate collection");
            continue;
        }
        out.push(Partition::new(slug));
    }
    out
}

/// Reports of a whole run, in partition order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<PartitionReport>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &PartitionReport> {
        self.reports.iter().filter(|r| !r.is_done())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn emitted(&self) -> u64 {
        self.reports.iter().map(|r| r.emitted).sum()
    }

    /// Committed checkpoint of every partition touched by this run.
    pub fn checkpoints(&self) -> BTreeMap<String, Checkpoint> {
        self.reports
            .iter()
            .map(|r| (r.collection_id.clone(), r.checkpoint.clone()))
            .collect()
    }
}

/// Run every partition sequentially. A failing partition is recorded and the
/// next one starts from its own checkpoint; all partitions share `now`, so
/// they share the signpost too.
pub async fn run_partitions(
    driver: &StreamDriver<'_>,
    settings: &StrategySettings,
    partitions: &[Partition],
    now: DateTime<Utc>,
    sink: &mut dyn RecordSink,
) -> RunSummary {
    let mut summary = RunSummary::default();
    for partition in partitions {
        let mut strategy = strategy_for(settings, now);
        let report = driver.run(partition, strategy.as_mut(), sink).await;
        summary.reports.push(report);
    }
    summary
}

/// Full tap run: SCHEMA, then every partition's records, then one STATE
/// message carrying the committed checkpoints.
pub async fn sync(
    driver: &StreamDriver<'_>,
    settings: &StrategySettings,
    collections: &str,
    now: DateTime<Utc>,
    sink: &mut dyn RecordSink,
) -> Result<RunSummary> {
    let partitions = partitions_from_config(collections);
    let stream = driver.stream();
    info!(stream, partitions = partitions.len(), mode = ?settings.mode, "sync starting");

    sink.write_schema(stream)?;
    let summary = run_partitions(driver, settings, &partitions, now, sink).await;
    sink.write_state(stream, &summary.checkpoints())?;

    info!(
        emitted = summary.emitted(),
        failed = summary.failed().count(),
        "sync finished"
    );
    Ok(summary)
}
