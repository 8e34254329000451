//! Singer-style JSON-lines output: `SCHEMA`, `RECORD` and `STATE` messages.
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Write;

use crate::model::NormalizedRecord;
use crate::state::Checkpoint;

pub const KEY_PROPERTIES: [&str; 1] = ["order_hash"];

/// Downstream consumer of normalized records.
pub trait RecordSink: Send {
    fn write_schema(&mut self, stream: &str) -> Result<()>;

    fn write_record(&mut self, stream: &str, record: &NormalizedRecord) -> Result<()>;

    fn write_state(&mut self, stream: &str, partitions: &BTreeMap<String, Checkpoint>)
        -> Result<()>;
}

pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, message: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.out, message).context("failed to serialize message")?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn write_schema(&mut self, stream: &str) -> Result<()> {
        self.emit(&json!({
            "type": "SCHEMA",
            "stream": stream,
            "schema": record_schema(),
            "key_properties": KEY_PROPERTIES,
        }))
    }

    fn write_record(&mut self, stream: &str, record: &NormalizedRecord) -> Result<()> {
        self.emit(&json!({
            "type": "RECORD",
            "stream": stream,
            "record": record,
        }))
    }

    fn write_state(
        &mut self,
        stream: &str,
        partitions: &BTreeMap<String, Checkpoint>,
    ) -> Result<()> {
        self.emit(&json!({
            "type": "STATE",
            "value": { "bookmarks": { stream: partitions } },
        }))?;
        self.out.flush()?;
        Ok(())
    }
}

fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

fn nft_properties(prefix: &str) -> Map<String, Value> {
    let mut props = Map::new();
    for field in [
        "address",
        "collection_name",
        "identifier",
        "token_standard",
        "name",
        "description",
        "image_url",
        "display_image_url",
        "display_animation_url",
        "metadata_url",
        "opensea_url",
        "updated_at",
    ] {
        props.insert(format!("{prefix}{field}"), nullable("string"));
    }
    props.insert(format!("{prefix}is_disabled"), nullable("boolean"));
    props.insert(format!("{prefix}is_nsfw"), nullable("boolean"));
    props
}

/// JSON schema of [`NormalizedRecord`].
pub fn record_schema() -> Value {
    let mut props = Map::new();
    props.insert("transaction_hash".into(), json!({ "type": "string" }));
    props.insert("event_type".into(), nullable("string"));
    props.insert("order_hash".into(), nullable("string"));
    props.insert("chain".into(), json!({ "type": "string" }));
    props.insert("protocol_address".into(), nullable("string"));
    props.insert("closing_date".into(), nullable("integer"));
    props.insert("quantity".into(), nullable("integer"));
    props.extend(nft_properties("nft_"));
    for field in [
        "payment_symbol",
        "payment_token_address",
        "payment_amount",
        "decimals",
        "seller_address",
        "buyer_address",
        "timestamp",
    ] {
        props.insert(field.into(), nullable("string"));
    }
    props.insert(
        "bundle_assets".into(),
        json!({
            "type": "array",
            "items": { "type": "object", "properties": nft_properties("") },
        }),
    );
    json!({
        "type": "object",
        "properties": props,
        "required": ["transaction_hash", "chain", "bundle_assets"],
    })
}

/// Catalog printed by `--discover`.
pub fn catalog(stream: &str) -> Value {
    json!({
        "streams": [{
            "stream": stream,
            "tap_stream_id": stream,
            "schema": record_schema(),
            "key_properties": KEY_PROPERTIES,
        }]
    })
}
