//! Per-partition fetch loop.
//!
//! START → FETCHING → MAPPING → CHECKPOINTING → (FETCHING | DONE), with FAILED
//! reachable from any step that talks to the outside world. Checkpoint changes
//! made while handling a page are committed only after the whole page has been
//! mapped and emitted. The one exception is a stored cursor the API rejects
//! with a client error: it is cleared and the partition restarts from its
//! watermark, once per run.
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{Endpoint, EventSource, FetchError};
use crate::mapper::map_event;
use crate::model::{DriverState, NormalizedRecord, PageRequest, Partition, SchemaVersion};
use crate::output::RecordSink;
use crate::pagination::CursorStrategy;
use crate::state::{Checkpoint, StateStore};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to commit checkpoint: {0:#}")]
    State(anyhow::Error),
    #[error("failed to emit record: {0:#}")]
    Sink(anyhow::Error),
    #[error("stopped after {0} pages without reaching the end")]
    PageLimit(u32),
}

/// Outcome of one partition run.
#[derive(Debug)]
pub struct PartitionReport {
    pub collection_id: String,
    pub state: DriverState,
    pub pages: u32,
    pub emitted: u64,
    pub dropped: u64,
    /// Last committed checkpoint.
    pub checkpoint: Checkpoint,
    pub error: Option<DriverError>,
}

impl PartitionReport {
    fn new(partition: &Partition) -> Self {
        Self {
            collection_id: partition.collection_id.clone(),
            state: DriverState::Start,
            pages: 0,
            emitted: 0,
            dropped: 0,
            checkpoint: Checkpoint::default(),
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DriverState::Done
    }

    fn enter(&mut self, next: DriverState) {
        debug!(
            collection = %self.collection_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "driver transition"
        );
        self.state = next;
    }

    fn fail(mut self, err: DriverError) -> Self {
        match &err {
            DriverError::Fetch(fetch) => error!(
                collection = %self.collection_id,
                url = fetch.url().unwrap_or("-"),
                status = ?fetch.status(),
                error = %fetch,
                "partition failed"
            ),
            other => error!(collection = %self.collection_id, error = %other, "partition failed"),
        }
        self.enter(DriverState::Failed);
        self.error = Some(err);
        self
    }
}

pub struct StreamDriver<'a> {
    source: &'a dyn EventSource,
    store: &'a dyn StateStore,
    version: SchemaVersion,
    max_pages: u32,
}

impl<'a> StreamDriver<'a> {
    pub fn new(
        source: &'a dyn EventSource,
        store: &'a dyn StateStore,
        version: SchemaVersion,
        max_pages: u32,
    ) -> Self {
        Self {
            source,
            store,
            version,
            max_pages: max_pages.max(1),
        }
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn stream(&self) -> &'static str {
        self.version.stream_name()
    }

    #[instrument(skip_all, fields(collection = %partition.collection_id))]
    pub async fn run(
        &self,
        partition: &Partition,
        strategy: &mut dyn CursorStrategy,
        sink: &mut dyn RecordSink,
    ) -> PartitionReport {
        let stream = self.stream();
        let endpoint = Endpoint::for_partition(self.version, partition);
        let mut report = PartitionReport::new(partition);

        let loaded = match self.store.load(stream, &partition.collection_id).await {
            Ok(cp) => cp,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not read checkpoint; starting fresh");
                Checkpoint::default()
            }
        };
        info!(mode = ?strategy.mode(), checkpoint = ?loaded, "starting partition");

        let mut checkpoint = loaded.clone();
        let mut next = strategy.start(&mut checkpoint);
        if checkpoint != loaded {
            if let Err(err) = self.commit(partition, &checkpoint).await {
                return report.fail(err);
            }
        }
        report.checkpoint = checkpoint.clone();
        let mut cursor_discarded = false;

        while let Some(request) = next.take() {
            if report.pages >= self.max_pages {
                let pages = report.pages;
                return report.fail(DriverError::PageLimit(pages));
            }

            report.enter(DriverState::Fetching);
            let page = match self.source.fetch_page(&endpoint, &request).await {
                Ok(page) => page,
                Err(err)
                    if !cursor_discarded
                        && report.pages == 0
                        && rejects_stored_cursor(&err, &request, &checkpoint) =>
                {
                    // An expired cursor would fail every later run at the same
                    // request; drop it and restart from the watermark.
                    warn!(
                        cursor = checkpoint.cursor_token.as_deref().unwrap_or_default(),
                        status = ?err.status(),
                        "stored cursor rejected; restarting from watermark"
                    );
                    cursor_discarded = true;
                    checkpoint.cursor_token = None;
                    if let Err(err) = self.commit(partition, &checkpoint).await {
                        return report.fail(err);
                    }
                    report.checkpoint = checkpoint.clone();
                    next = strategy.start(&mut checkpoint);
                    continue;
                }
                Err(err) => return report.fail(err.into()),
            };
            report.pages += 1;

            report.enter(DriverState::Mapping);
            let mut mapped: Vec<NormalizedRecord> = Vec::with_capacity(page.events.len());
            for (index, raw) in page.events.iter().enumerate() {
                match map_event(raw, self.version) {
                    Ok(record) => {
                        if let Err(err) = sink.write_record(stream, &record) {
                            return report.fail(DriverError::Sink(err));
                        }
                        mapped.push(record);
                    }
                    Err(err) => {
                        report.dropped += 1;
                        warn!(page = report.pages, index, error = %err, "dropping malformed event");
                    }
                }
            }
            report.emitted += mapped.len() as u64;

            report.enter(DriverState::Checkpointing);
            let mut working = checkpoint.clone();
            for record in &mapped {
                strategy.observe(record, &mut working);
            }
            next = strategy.next(&page, &mut working);
            if working != checkpoint {
                if let Err(err) = self.commit(partition, &working).await {
                    return report.fail(err);
                }
                checkpoint = working;
                report.checkpoint = checkpoint.clone();
            }
            debug!(
                page = report.pages,
                events = page.events.len(),
                emitted = mapped.len(),
                has_next = next.is_some(),
                "page handled"
            );
        }

        report.enter(DriverState::Done);
        info!(
            pages = report.pages,
            emitted = report.emitted,
            dropped = report.dropped,
            "partition done"
        );
        report
    }

    async fn commit(&self, partition: &Partition, checkpoint: &Checkpoint) -> Result<(), DriverError> {
        self.store
            .commit(self.stream(), &partition.collection_id, checkpoint)
            .await
            .map_err(DriverError::State)
    }
}

/// A non-auth 4xx on a request that carried the persisted cursor.
fn rejects_stored_cursor(err: &FetchError, request: &PageRequest, checkpoint: &Checkpoint) -> bool {
    matches!(err, FetchError::Client { .. })
        && checkpoint.cursor_token.is_some()
        && request.get("next") == checkpoint.cursor_token.as_deref()
}
