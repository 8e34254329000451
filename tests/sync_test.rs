use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use opensea_tap::client::{Endpoint, EventSource, FetchError};
use opensea_tap::driver::{DriverError, StreamDriver};
use opensea_tap::model::{DriverState, PageRequest, PageResponse, PaginationMode, Partition, SchemaVersion};
use opensea_tap::output::JsonLinesSink;
use opensea_tap::pagination::{strategy_for, StrategySettings};
use opensea_tap::partition;
use opensea_tap::state::{Checkpoint, SqliteStateStore, StateStore};

const STREAM: &str = "opensea_orders_v2";
const SIGNPOST: &str = "1709596800";

async fn setup_store() -> SqliteStateStore {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    SqliteStateStore::new(pool)
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

fn sale(tx: &str, ts: i64) -> Value {
    json!({
        "event_type": "sale",
        "order_hash": format!("0xorder-{tx}"),
        "chain": "ethereum",
        "transaction": tx,
        "event_timestamp": ts,
        "quantity": 1,
        "payment": { "quantity": "1000000000000000000", "symbol": "ETH", "decimals": 18 },
        "seller": "0xseller",
        "buyer": "0xbuyer",
        "nft": { "identifier": "42", "collection": "dcl-names", "contract": "0xcontract" },
    })
}

fn page(events: Vec<Value>, next: Option<&str>) -> PageResponse {
    PageResponse {
        events,
        next: next.map(str::to_string),
    }
}

fn unauthorized() -> FetchError {
    FetchError::Unauthorized {
        url: "https://api.opensea.io/api/v2/events/collection/dcl-names".into(),
        status: 401,
    }
}

#[derive(Clone, Default)]
struct RecordingSource {
    responses: Arc<Mutex<VecDeque<Result<PageResponse, FetchError>>>>,
    calls: Arc<Mutex<Vec<(String, PageRequest)>>>,
}

impl RecordingSource {
    fn with_responses(responses: Vec<Result<PageResponse, FetchError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<(String, PageRequest)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl EventSource for RecordingSource {
    async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, FetchError> {
        self.calls
            .lock()
            .await
            .push((endpoint.path.clone(), request.clone()));
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(PageResponse::default()))
    }
}

fn records(sink: JsonLinesSink<Vec<u8>>) -> Vec<Value> {
    String::from_utf8(sink.into_inner())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap())
        .collect()
}

#[tokio::test]
async fn fresh_run_emits_records_and_keeps_latest_watermark() {
    let store = setup_store().await;
    let source = RecordingSource::with_responses(vec![Ok(page(
        vec![sale("0xa", 1700000200), sale("0xb", 1700000100)],
        None,
    ))]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;

    assert_eq!(report.state, DriverState::Done);
    assert_eq!(report.emitted, 2);
    assert_eq!(report.dropped, 0);
    assert!(report.error.is_none());

    let calls = source.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "events/collection/dcl-names");
    assert_eq!(calls[0].1.get("before"), Some(SIGNPOST));
    assert!(!calls[0].1.contains("after"));
    assert!(!calls[0].1.contains("next"));

    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.last_seen_timestamp.as_deref(), Some("1700000200"));
    assert_eq!(stored.cursor_token, None);

    let lines = records(sink);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["record"]["transaction_hash"], "0xa");
    assert_eq!(lines[1]["record"]["nft_identifier"], "42");
}

#[tokio::test]
async fn unauthorized_fails_without_touching_state() {
    let store = setup_store().await;
    let source = RecordingSource::with_responses(vec![Err(unauthorized())]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;

    assert_eq!(report.state, DriverState::Failed);
    assert_eq!(report.emitted, 0);
    match report.error {
        Some(DriverError::Fetch(ref err)) => assert_eq!(err.status(), Some(401)),
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.load(STREAM, "dcl-names").await.unwrap().is_empty());
    assert!(records(sink).is_empty());
}

#[tokio::test]
async fn malformed_event_is_dropped_and_the_rest_processed() {
    let store = setup_store().await;
    let mut broken = sale("0xbad", 1700000300);
    broken.as_object_mut().unwrap().remove("chain");
    let source = RecordingSource::with_responses(vec![Ok(page(
        vec![sale("0xa", 1700000100), broken, sale("0xc", 1700000200)],
        None,
    ))]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;

    assert_eq!(report.state, DriverState::Done);
    assert_eq!(report.emitted, 2);
    assert_eq!(report.dropped, 1);
    // The dropped event never influences the watermark.
    assert_eq!(
        report.checkpoint.last_seen_timestamp.as_deref(),
        Some("1700000200")
    );
    let hashes: Vec<Value> = records(sink)
        .into_iter()
        .map(|l| l["record"]["transaction_hash"].clone())
        .collect();
    assert_eq!(hashes, vec![json!("0xa"), json!("0xc")]);
}

#[tokio::test]
async fn interrupted_cursor_run_resumes_from_cursor() {
    let store = setup_store().await;
    let partition = Partition::new("dcl-names");
    let settings = StrategySettings::default();

    let first = RecordingSource::with_responses(vec![
        Ok(page(vec![sale("0xa", 1700000100)], Some("cursor-1"))),
        Err(FetchError::RetriesExhausted {
            url: "https://api.opensea.io/api/v2/events/collection/dcl-names".into(),
            status: Some(503),
            attempts: 3,
            message: "unavailable".into(),
        }),
    ]);
    let driver = StreamDriver::new(&first, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&settings, now());
    let mut sink = JsonLinesSink::new(Vec::new());
    let report = driver.run(&partition, strategy.as_mut(), &mut sink).await;
    assert_eq!(report.state, DriverState::Failed);
    assert_eq!(report.pages, 1);

    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token.as_deref(), Some("cursor-1"));
    assert_eq!(stored.last_seen_timestamp.as_deref(), Some("1700000100"));

    let second = RecordingSource::with_responses(vec![Ok(page(
        vec![sale("0xb", 1700000050)],
        None,
    ))]);
    let driver = StreamDriver::new(&second, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&settings, now());
    let report = driver.run(&partition, strategy.as_mut(), &mut sink).await;
    assert_eq!(report.state, DriverState::Done);

    let calls = second.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.get("next"), Some("cursor-1"));
    assert!(!calls[0].1.contains("after"));

    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token, None);
    // Older event on the resumed page does not move the watermark back.
    assert_eq!(stored.last_seen_timestamp.as_deref(), Some("1700000100"));
}

fn stale_cursor() -> FetchError {
    FetchError::Client {
        url: "https://api.opensea.io/api/v2/events/collection/dcl-names".into(),
        status: 400,
        body: r#"{"errors":["invalid cursor"]}"#.into(),
    }
}

async fn store_with_cursor(cursor: &str) -> SqliteStateStore {
    let store = setup_store().await;
    store
        .commit(
            STREAM,
            "dcl-names",
            &Checkpoint {
                last_seen_timestamp: Some("1700000100".into()),
                cursor_token: Some(cursor.into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn rejected_cursor_is_dropped_and_run_restarts_from_watermark() {
    let store = store_with_cursor("expired").await;
    let source = RecordingSource::with_responses(vec![
        Err(stale_cursor()),
        Ok(page(vec![sale("0xa", 1700000300)], None)),
    ]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert_eq!(report.state, DriverState::Done);
    assert_eq!(report.emitted, 1);

    let calls = source.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1.get("next"), Some("expired"));
    assert!(!calls[1].1.contains("next"));
    assert_eq!(calls[1].1.get("after"), Some("1700000100"));

    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token, None);
    assert_eq!(stored.last_seen_timestamp.as_deref(), Some("1700000300"));
}

#[tokio::test]
async fn rejected_cursor_is_retried_only_once() {
    let store = store_with_cursor("expired").await;
    let source = RecordingSource::with_responses(vec![Err(stale_cursor()), Err(stale_cursor())]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert_eq!(report.state, DriverState::Failed);
    assert_eq!(source.calls().await.len(), 2);
    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token, None);
    assert_eq!(stored.last_seen_timestamp.as_deref(), Some("1700000100"));
}

#[tokio::test]
async fn auth_failure_keeps_stored_cursor() {
    let store = store_with_cursor("still-good").await;
    let source = RecordingSource::with_responses(vec![Err(unauthorized())]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert_eq!(report.state, DriverState::Failed);
    assert_eq!(source.calls().await.len(), 1);
    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token.as_deref(), Some("still-good"));
}

#[tokio::test]
async fn next_run_starts_after_watermark() {
    let store = setup_store().await;
    store
        .commit(
            STREAM,
            "dcl-names",
            &Checkpoint {
                last_seen_timestamp: Some("1700000200".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let source = RecordingSource::with_responses(vec![Ok(page(vec![], None))]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;

    assert!(report.is_done());
    let calls = source.calls().await;
    assert_eq!(calls[0].1.get("after"), Some("1700000200"));
    assert_eq!(calls[0].1.get("before"), Some(SIGNPOST));
}

#[tokio::test]
async fn window_mode_walks_windows_up_to_signpost() {
    let store = setup_store().await;
    let settings = StrategySettings {
        mode: PaginationMode::Window,
        page_size: 2,
        window_days: 30,
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
    };
    let source = RecordingSource::with_responses(vec![
        Ok(page(vec![sale("0x1", 1704100000), sale("0x2", 1704200000)], None)),
        Ok(page(vec![], None)),
        Ok(page(vec![sale("0x3", 1707000000)], None)),
        Ok(page(vec![], None)),
    ]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let partition = Partition::new("dcl-names");
    let mut strategy = strategy_for(&settings, now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver.run(&partition, strategy.as_mut(), &mut sink).await;
    assert_eq!(report.state, DriverState::Done);
    assert_eq!(report.pages, 4);
    assert_eq!(report.emitted, 3);

    let calls = source.calls().await;
    let params: Vec<(Option<&str>, Option<&str>, Option<&str>)> = calls
        .iter()
        .map(|(_, req)| {
            (
                req.get("occurred_after"),
                req.get("occurred_before"),
                req.get("offset"),
            )
        })
        .collect();
    assert_eq!(
        params,
        vec![
            (Some("1704067200"), Some("1706659200"), Some("0")),
            (Some("1704067200"), Some("1706659200"), Some("2")),
            (Some("1706659200"), Some("1709251200"), Some("0")),
            (Some("1709251200"), Some(SIGNPOST), Some("0")),
        ]
    );
    assert!(calls.iter().all(|(_, req)| req.get("limit") == Some("2")));

    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.last_window_end.as_deref(), Some("2024-03-05T00:00:00Z"));

    // Caught up: a second run the same day issues no request.
    let idle = RecordingSource::default();
    let driver = StreamDriver::new(&idle, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&settings, now());
    let report = driver.run(&partition, strategy.as_mut(), &mut sink).await;
    assert_eq!(report.state, DriverState::Done);
    assert_eq!(report.pages, 0);
    assert!(idle.calls().await.is_empty());
}

#[tokio::test]
async fn window_end_is_committed_before_first_fetch() {
    let store = setup_store().await;
    let settings = StrategySettings {
        mode: PaginationMode::Window,
        page_size: 2,
        window_days: 30,
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
    };
    let source = RecordingSource::with_responses(vec![Err(unauthorized())]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut strategy = strategy_for(&settings, now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert_eq!(report.state, DriverState::Failed);
    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.last_window_end.as_deref(), Some("2024-01-31T00:00:00Z"));
}

#[tokio::test]
async fn endless_cursor_hits_page_limit() {
    let store = setup_store().await;
    let source = RecordingSource::with_responses(
        (0..5)
            .map(|i| Ok(page(vec![], Some(&format!("c{i}")))))
            .collect(),
    );
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 3);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert_eq!(report.state, DriverState::Failed);
    assert_eq!(report.pages, 3);
    assert!(matches!(report.error, Some(DriverError::PageLimit(3))));
    // Progress up to the limit is kept for the next run.
    let stored = store.load(STREAM, "dcl-names").await.unwrap();
    assert_eq!(stored.cursor_token.as_deref(), Some("c2"));
}

#[tokio::test]
async fn failing_partition_does_not_stop_the_others() {
    let store = setup_store().await;
    let source = RecordingSource::with_responses(vec![
        Err(unauthorized()),
        Ok(page(vec![sale("0xa", 1700000100)], None)),
    ]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V2, 100);
    let mut sink = JsonLinesSink::new(Vec::new());

    let summary = partition::sync(
        &driver,
        &StrategySettings::default(),
        "locked, dcl-names",
        now(),
        &mut sink,
    )
    .await
    .unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.reports[0].state, DriverState::Failed);
    assert_eq!(summary.reports[1].state, DriverState::Done);
    assert_eq!(summary.emitted(), 1);
    let failed: Vec<&str> = summary
        .failed()
        .map(|r| r.collection_id.as_str())
        .collect();
    assert_eq!(failed, vec!["locked"]);

    let calls = source.calls().await;
    assert_eq!(calls[0].0, "events/collection/locked");
    assert_eq!(calls[1].0, "events/collection/dcl-names");

    let lines = records(sink);
    assert_eq!(lines.first().unwrap()["type"], "SCHEMA");
    assert_eq!(lines[1]["type"], "RECORD");
    let state = lines.last().unwrap();
    assert_eq!(state["type"], "STATE");
    assert_eq!(
        state["value"]["bookmarks"][STREAM]["dcl-names"]["last_seen_timestamp"],
        "1700000100"
    );
    assert!(state["value"]["bookmarks"][STREAM]["locked"]["last_seen_timestamp"].is_null());
}

#[tokio::test]
async fn legacy_payloads_use_their_own_endpoint() {
    let store = setup_store().await;
    let legacy = json!({
        "event_type": "successful",
        "transaction": { "transaction_hash": "0xlegacy" },
        "chain": { "chain_identifier": "ethereum" },
        "created_date": "2021-06-01T10:00:00",
        "total_price": "5000000000000000000",
        "payment_token": { "symbol": "ETH", "decimals": 18 },
    });
    let source = RecordingSource::with_responses(vec![Ok(page(vec![legacy], None))]);
    let driver = StreamDriver::new(&source, &store, SchemaVersion::V1, 100);
    let mut strategy = strategy_for(&StrategySettings::default(), now());
    let mut sink = JsonLinesSink::new(Vec::new());

    let report = driver
        .run(&Partition::new("dcl-names"), strategy.as_mut(), &mut sink)
        .await;
    assert!(report.is_done());
    assert_eq!(driver.stream(), "opensea_orders_v1");

    let calls = source.calls().await;
    assert_eq!(calls[0].0, "events");
    let lines = records(sink);
    assert_eq!(lines[0]["stream"], "opensea_orders_v1");
    assert_eq!(lines[0]["record"]["chain"], "ethereum");
    assert_eq!(lines[0]["record"]["payment_amount"], "5000000000000000000");
    let stored = store.load("opensea_orders_v1", "dcl-names").await.unwrap();
    assert_eq!(
        stored.last_seen_timestamp.as_deref(),
        Some("2021-06-01T10:00:00")
    );
}
