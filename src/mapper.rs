//! Raw event → [`NormalizedRecord`] mapping for both payload generations.
//!
//! Only the transaction hash and the chain are required. Every other field is
//! looked up independently, so a missing or malformed optional value nulls
//! that field alone and never the record.
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::clock::parse_event_time;
use crate::model::{NftFields, NormalizedRecord, SchemaVersion};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("required field `{0}` missing or empty")]
    MissingField(&'static str),
}

pub fn map_event(raw: &Value, version: SchemaVersion) -> Result<NormalizedRecord, MappingError> {
    if !raw.is_object() {
        return Err(MappingError::NotAnObject);
    }
    match version {
        SchemaVersion::V2 => map_v2(raw),
        SchemaVersion::V1 => map_v1(raw),
    }
}

fn map_v2(row: &Value) -> Result<NormalizedRecord, MappingError> {
    let transaction_hash =
        string_at(row, &["transaction"]).ok_or(MappingError::MissingField("transaction"))?;
    let chain = string_at(row, &["chain"]).ok_or(MappingError::MissingField("chain"))?;

    let mut record = NormalizedRecord {
        transaction_hash,
        chain,
        event_type: string_at(row, &["event_type"]),
        order_hash: string_at(row, &["order_hash"]),
        protocol_address: string_at(row, &["protocol_address"]),
        closing_date: integer_at(row, &["closing_date"]),
        quantity: integer_at(row, &["quantity"]),
        payment_symbol: string_at(row, &["payment", "symbol"]),
        payment_token_address: string_at(row, &["payment", "token_address"]),
        payment_amount: amount_at(row, &["payment", "quantity"]),
        decimals: amount_at(row, &["payment", "decimals"]),
        seller_address: string_at(row, &["seller"]),
        buyer_address: string_at(row, &["buyer"]),
        timestamp: timestamp_at(row, &["event_timestamp"]),
        bundle_assets: bundle_at(row, &["assets"], nft_v2),
        ..Default::default()
    };
    if let Some(nft) = row.get("nft").filter(|v| v.is_object()) {
        record.set_nft(nft_v2(nft));
    }
    Ok(record)
}

fn nft_v2(nft: &Value) -> NftFields {
    NftFields {
        address: string_at(nft, &["contract"]),
        collection_name: string_at(nft, &["collection"]),
        identifier: string_at(nft, &["identifier"]),
        token_standard: string_at(nft, &["token_standard"]),
        name: string_at(nft, &["name"]),
        description: string_at(nft, &["description"]),
        image_url: string_at(nft, &["image_url"]),
        display_image_url: string_at(nft, &["display_image_url"]),
        display_animation_url: string_at(nft, &["display_animation_url"]),
        metadata_url: string_at(nft, &["metadata_url"]),
        opensea_url: string_at(nft, &["opensea_url"]),
        updated_at: string_at(nft, &["updated_at"]),
        is_disabled: bool_at(nft, &["is_disabled"]),
        is_nsfw: bool_at(nft, &["is_nsfw"]),
    }
}

fn map_v1(row: &Value) -> Result<NormalizedRecord, MappingError> {
    let transaction_hash = string_at(row, &["transaction", "transaction_hash"])
        .ok_or(MappingError::MissingField("transaction.transaction_hash"))?;
    let chain = string_at(row, &["chain"])
        .or_else(|| string_at(row, &["chain", "chain_identifier"]))
        .ok_or(MappingError::MissingField("chain"))?;

    let mut record = NormalizedRecord {
        transaction_hash,
        chain,
        event_type: string_at(row, &["event_type"]),
        order_hash: string_at(row, &["order_hash"]),
        protocol_address: string_at(row, &["contract_address"]),
        closing_date: None,
        quantity: integer_at(row, &["quantity"]),
        payment_symbol: string_at(row, &["payment_token", "symbol"]),
        payment_token_address: string_at(row, &["payment_token", "address"]),
        payment_amount: amount_at(row, &["total_price"]),
        decimals: amount_at(row, &["payment_token", "decimals"]),
        seller_address: string_at(row, &["seller", "address"]),
        buyer_address: string_at(row, &["winner_account", "address"]),
        timestamp: timestamp_at(row, &["event_timestamp"])
            .or_else(|| timestamp_at(row, &["created_date"])),
        bundle_assets: bundle_at(row, &["asset_bundle", "assets"], nft_v1),
        ..Default::default()
    };
    if let Some(asset) = row.get("asset").filter(|v| v.is_object()) {
        record.set_nft(nft_v1(asset));
    }
    Ok(record)
}

fn nft_v1(asset: &Value) -> NftFields {
    NftFields {
        address: string_at(asset, &["asset_contract", "address"]),
        collection_name: string_at(asset, &["collection", "slug"]),
        identifier: string_at(asset, &["token_id"]),
        token_standard: string_at(asset, &["asset_contract", "schema_name"])
            .map(|s| s.to_ascii_lowercase()),
        name: string_at(asset, &["name"]),
        description: string_at(asset, &["description"]),
        image_url: string_at(asset, &["image_url"]),
        display_image_url: string_at(asset, &["image_preview_url"]),
        display_animation_url: string_at(asset, &["animation_url"]),
        metadata_url: string_at(asset, &["token_metadata"]),
        opensea_url: string_at(asset, &["permalink"]),
        updated_at: None,
        is_disabled: None,
        is_nsfw: bool_at(asset, &["is_nsfw"]),
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Strings pass through, numbers and booleans are rendered, empty strings and
/// nested objects resolve to null.
fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn bool_at(value: &Value, path: &[&str]) -> Option<bool> {
    match lookup(value, path)? {
        Value::Bool(b) => Some(*b),
        other => {
            warn!(field = %path.join("."), value = %other, "expected boolean; field set to null");
            None
        }
    }
}

/// Integer coercion that fails closed: integral JSON numbers and integer
/// strings are accepted, everything else nulls the field.
fn integer_at(value: &Value, path: &[&str]) -> Option<i64> {
    let raw = lookup(value, path)?;
    let parsed = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!(field = %path.join("."), value = %raw, "non-integer value; field set to null");
    }
    parsed
}

/// Token amounts stay strings so wei-scale values keep every digit.
fn amount_at(value: &Value, path: &[&str]) -> Option<String> {
    let raw = lookup(value, path)?;
    let parsed = match raw {
        // Exponent forms are rejected rather than expanded.
        Value::Number(n) => Some(n.to_string()).filter(|s| is_decimal(s)),
        Value::String(s) if is_decimal(s.trim()) => Some(s.trim().to_string()),
        _ => None,
    };
    if parsed.is_none() {
        warn!(field = %path.join("."), value = %raw, "non-numeric amount; field set to null");
    }
    parsed
}

fn is_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    !int.is_empty()
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

/// ISO strings are kept verbatim, epoch values are rendered as decimal
/// seconds. No timezone conversion happens here.
fn timestamp_at(value: &Value, path: &[&str]) -> Option<String> {
    let raw = lookup(value, path)?;
    let rendered = match raw {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => String::new(),
    };
    if parse_event_time(&rendered).is_some() {
        Some(rendered)
    } else {
        warn!(field = %path.join("."), value = %raw, "unrecognised timestamp; field set to null");
        None
    }
}

fn bundle_at(value: &Value, path: &[&str], map: fn(&Value) -> NftFields) -> Vec<NftFields> {
    match lookup(value, path) {
        Some(Value::Array(items)) => items.iter().filter(|i| i.is_object()).map(map).collect(),
        _ => Vec::new(),
    }
}
