//! Cursor strategies: which page to ask for next, and when to stop.
//!
//! Both strategies bound every request by the signpost (midnight UTC at run
//! start) and never fail: state that cannot be parsed is logged and treated as
//! absent. Strategies write into the [`Checkpoint`] they are handed; the driver
//! decides when that checkpoint is committed.
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::clock::{date_start, default_window_origin, epoch_param, start_of_utc_day};
use crate::config::Config;
use crate::model::{NormalizedRecord, PageRequest, PageResponse, PaginationMode};
use crate::state::Checkpoint;

pub trait CursorStrategy: Send {
    fn mode(&self) -> PaginationMode;

    /// First request of a run, or `None` when there is nothing to fetch.
    fn start(&mut self, checkpoint: &mut Checkpoint) -> Option<PageRequest>;

    /// Called for every record emitted from a page, before [`next`](Self::next).
    fn observe(&mut self, record: &NormalizedRecord, checkpoint: &mut Checkpoint);

    /// Request following `page`, or `None` when the run is complete.
    fn next(&mut self, page: &PageResponse, checkpoint: &mut Checkpoint) -> Option<PageRequest>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategySettings {
    pub mode: PaginationMode,
    pub page_size: u32,
    pub window_days: u32,
    pub start_date: Option<NaiveDate>,
}

impl StrategySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            mode: cfg.sync.pagination,
            page_size: cfg.sync.page_size,
            window_days: cfg.sync.window_days,
            start_date: cfg.start_date(),
        }
    }
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            mode: PaginationMode::Cursor,
            page_size: 300,
            window_days: 30,
            start_date: None,
        }
    }
}

/// Build the strategy for one partition run. `now` fixes the signpost for the
/// whole run.
pub fn strategy_for(settings: &StrategySettings, now: DateTime<Utc>) -> Box<dyn CursorStrategy> {
    let signpost = start_of_utc_day(now);
    match settings.mode {
        PaginationMode::Cursor => Box::new(CursorPagination::new(signpost)),
        PaginationMode::Window => Box::new(WindowPagination::new(
            signpost,
            settings.page_size,
            settings.window_days,
            settings.start_date.and_then(date_start),
        )),
    }
}

/// Opaque `next` cursor with a lower-bound watermark on fresh runs.
#[derive(Debug, Clone)]
pub struct CursorPagination {
    signpost: DateTime<Utc>,
}

impl CursorPagination {
    pub fn new(signpost: DateTime<Utc>) -> Self {
        Self { signpost }
    }

    fn base_request(&self) -> PageRequest {
        let mut req = PageRequest::default();
        req.push("before", epoch_param(self.signpost));
        req
    }
}

impl CursorStrategy for CursorPagination {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Cursor
    }

    fn start(&mut self, checkpoint: &mut Checkpoint) -> Option<PageRequest> {
        let mut req = self.base_request();
        if let Some(cursor) = checkpoint.cursor_token.as_deref() {
            // An interrupted run left a cursor behind; it is authoritative.
            info!(cursor, "resuming from persisted cursor");
            req.push("next", cursor);
        } else if let Some(watermark) = checkpoint.watermark() {
            debug!(%watermark, "starting after watermark");
            req.push("after", epoch_param(watermark));
        } else if let Some(raw) = checkpoint.last_seen_timestamp.as_deref() {
            warn!(raw, "stored watermark is unreadable; fetching full history");
        } else {
            debug!("no watermark; fetching full history");
        }
        Some(req)
    }

    fn observe(&mut self, record: &NormalizedRecord, checkpoint: &mut Checkpoint) {
        if let Some(ts) = record.timestamp.as_deref() {
            checkpoint.advance_watermark(ts);
        }
    }

    fn next(&mut self, page: &PageResponse, checkpoint: &mut Checkpoint) -> Option<PageRequest> {
        match page.next.as_deref() {
            Some(cursor) => {
                checkpoint.cursor_token = Some(cursor.to_string());
                let mut req = self.base_request();
                req.push("next", cursor);
                Some(req)
            }
            None => {
                // Clean finish: the next run starts from the watermark again.
                checkpoint.cursor_token = None;
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Numeric offset paging inside fixed-size time windows.
#[derive(Debug, Clone)]
pub struct WindowPagination {
    signpost: DateTime<Utc>,
    page_size: u32,
    window: Duration,
    origin: DateTime<Utc>,
    current: Option<Window>,
    offset: u64,
}

impl WindowPagination {
    pub fn new(
        signpost: DateTime<Utc>,
        page_size: u32,
        window_days: u32,
        origin: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            signpost,
            page_size: page_size.max(1),
            window: Duration::days(i64::from(window_days.max(1))),
            origin: origin.unwrap_or_else(default_window_origin),
            current: None,
            offset: 0,
        }
    }

    /// Open the window starting at `start` and record its end in the
    /// checkpoint before any request for it goes out.
    fn open_window(&mut self, start: DateTime<Utc>, checkpoint: &mut Checkpoint) -> Option<PageRequest> {
        if start >= self.signpost {
            debug!(%start, signpost = %self.signpost, "windows caught up with signpost");
            self.current = None;
            return None;
        }
        let end = (start + self.window).min(self.signpost);
        checkpoint.last_window_end = Some(end.to_rfc3339_opts(SecondsFormat::Secs, true));
        self.current = Some(Window { start, end });
        self.offset = 0;
        info!(%start, %end, "opening window");
        self.request()
    }

    fn request(&self) -> Option<PageRequest> {
        let window = self.current?;
        let mut req = PageRequest::default();
        req.push("occurred_after", epoch_param(window.start));
        req.push("occurred_before", epoch_param(window.end));
        req.push("limit", self.page_size.to_string());
        req.push("offset", self.offset.to_string());
        Some(req)
    }
}

impl CursorStrategy for WindowPagination {
    fn mode(&self) -> PaginationMode {
        PaginationMode::Window
    }

    fn start(&mut self, checkpoint: &mut Checkpoint) -> Option<PageRequest> {
        let start = match checkpoint.window_end() {
            Some(end) => end,
            None => {
                if let Some(raw) = checkpoint.last_window_end.as_deref() {
                    warn!(raw, "stored window end is unreadable; starting from origin");
                }
                self.origin
            }
        };
        self.open_window(start, checkpoint)
    }

    fn observe(&mut self, _record: &NormalizedRecord, _checkpoint: &mut Checkpoint) {}

    fn next(&mut self, page: &PageResponse, checkpoint: &mut Checkpoint) -> Option<PageRequest> {
        let window = self.current?;
        if page.events.len() >= self.page_size as usize {
            self.offset += u64::from(self.page_size);
            return self.request();
        }
        if window.end >= self.signpost {
            self.current = None;
            return None;
        }
        self.open_window(window.end, checkpoint)
    }
}
