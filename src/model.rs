use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream payload generation. Selects both the endpoint layout and the
/// mapper used for raw events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V1,
    #[default]
    V2,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "v1",
            SchemaVersion::V2 => "v2",
        }
    }

    /// Stream name; also the scope under which partition state is stored.
    pub fn stream_name(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "opensea_orders_v1",
            SchemaVersion::V2 => "opensea_orders_v2",
        }
    }

    /// Value of the `event_type` filter sent with every request.
    pub fn sale_event_type(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "successful",
            SchemaVersion::V2 => "sale",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
    /// Opaque `next` cursor with a lower-bound timestamp on the first request.
    #[default]
    Cursor,
    /// Numeric offset inside fixed-size time windows.
    Window,
}

/// One collection being synced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub collection_id: String,
}

impl Partition {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
        }
    }
}

/// Query parameters for one page, in the order they are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub params: Vec<(String, String)>,
}

impl PageRequest {
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.params.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Decoded body of one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResponse {
    pub events: Vec<Value>,
    pub next: Option<String>,
}

impl PageResponse {
    /// Extract events from `$.asset_events[*]` and the cursor from `$.next`.
    /// A missing event list is an empty page; an empty cursor is no cursor.
    pub fn from_body(body: Value) -> Self {
        let Value::Object(mut obj) = body else {
            return Self::default();
        };
        let events = match obj.remove("asset_events") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let next = match obj.remove("next") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        };
        Self { events, next }
    }
}

/// One NFT as it appears in a record or inside a bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NftFields {
    pub address: Option<String>,
    pub collection_name: Option<String>,
    pub identifier: Option<String>,
    pub token_standard: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub display_image_url: Option<String>,
    pub display_animation_url: Option<String>,
    pub metadata_url: Option<String>,
    pub opensea_url: Option<String>,
    pub updated_at: Option<String>,
    pub is_disabled: Option<bool>,
    pub is_nsfw: Option<bool>,
}

/// Output row. Every field is always serialized so downstream consumers see
/// the same key set for every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub transaction_hash: String,
    pub event_type: Option<String>,
    pub order_hash: Option<String>,
    pub chain: String,
    pub protocol_address: Option<String>,
    pub closing_date: Option<i64>,
    pub quantity: Option<i64>,
    pub nft_address: Option<String>,
    pub nft_collection_name: Option<String>,
    pub nft_identifier: Option<String>,
    pub nft_token_standard: Option<String>,
    pub nft_name: Option<String>,
    pub nft_description: Option<String>,
    pub nft_image_url: Option<String>,
    pub nft_display_image_url: Option<String>,
    pub nft_display_animation_url: Option<String>,
    pub nft_metadata_url: Option<String>,
    pub nft_opensea_url: Option<String>,
    pub nft_updated_at: Option<String>,
    pub nft_is_disabled: Option<bool>,
    pub nft_is_nsfw: Option<bool>,
    pub payment_symbol: Option<String>,
    pub payment_token_address: Option<String>,
    pub payment_amount: Option<String>,
    pub decimals: Option<String>,
    pub seller_address: Option<String>,
    pub buyer_address: Option<String>,
    pub timestamp: Option<String>,
    pub bundle_assets: Vec<NftFields>,
}

impl NormalizedRecord {
    pub fn set_nft(&mut self, nft: NftFields) {
        self.nft_address = nft.address;
        self.nft_collection_name = nft.collection_name;
        self.nft_identifier = nft.identifier;
        self.nft_token_standard = nft.token_standard;
        self.nft_name = nft.name;
        self.nft_description = nft.description;
        self.nft_image_url = nft.image_url;
        self.nft_display_image_url = nft.display_image_url;
        self.nft_display_animation_url = nft.display_animation_url;
        self.nft_metadata_url = nft.metadata_url;
        self.nft_opensea_url = nft.opensea_url;
        self.nft_updated_at = nft.updated_at;
        self.nft_is_disabled = nft.is_disabled;
        self.nft_is_nsfw = nft.is_nsfw;
    }
}

/// Stream driver lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriverState {
    Start,
    Fetching,
    Mapping,
    Checkpointing,
    Done,
    Failed,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Start => "START",
            DriverState::Fetching => "FETCHING",
            DriverState::Mapping => "MAPPING",
            DriverState::Checkpointing => "CHECKPOINTING",
            DriverState::Done => "DONE",
            DriverState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Done | DriverState::Failed)
    }
}
