//! Wire records for the query service
//!
//! Outbound: one `QueryPayload` per query, serialized as a JSON text frame.
//! Inbound: one `ResponseFragment` per frame; a multi-part answer arrives as
//! several fragments sharing a `requestId` and is reassembled into a
//! `QueryResult` by the session engine.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// One result row: an open mapping from column name to value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Message type of an SQL query submission
pub const SQL_QUERY: &str = "SQL_QUERY";

/// Cache policy that bypasses the service-side result cache
pub const READ_CACHE_NONE: &str = "NONE";

/// Attribution/billing tag attached to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

/// Query submission record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub sql: String,
    /// Correlation id; assigned by `ensure_request_id` when left empty
    #[serde(default)]
    pub request_id: String,
    #[serde(default = "default_read_cache")]
    pub read_cache: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

fn default_message_type() -> String {
    SQL_QUERY.to_string()
}

fn default_read_cache() -> String {
    READ_CACHE_NONE.to_string()
}

impl QueryPayload {
    /// Build an `SQL_QUERY` payload with no tags and the cache bypassed.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self {
            message_type: default_message_type(),
            sql: sql.into(),
            request_id: String::new(),
            read_cache: default_read_cache(),
            tags: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Assign a fresh UUID as correlation id if the caller left it blank.
    pub fn ensure_request_id(&mut self) -> &str {
        if self.request_id.trim().is_empty() {
            self.request_id = Uuid::new_v4().to_string();
        }
        &self.request_id
    }

    /// Serialize to the text frame written on the wire.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A single inbound message carrying one part of a query answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFragment {
    #[serde(default)]
    pub message_type: String,
    pub request_id: String,
    #[serde(default)]
    pub batch_serial: i64,
    #[serde(default)]
    pub total_batches: i64,
    #[serde(default)]
    pub split_serial: i64,
    #[serde(default)]
    pub total_split_serials: i64,
    #[serde(default)]
    pub cache_info: Option<String>,
    /// Reassembly sequence number
    #[serde(default)]
    pub sub_batch_serial: i64,
    /// Completion threshold; 0 means this fragment is the whole answer
    #[serde(default)]
    pub total_sub_batches: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Vec<Row>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Row>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Row>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Assembled answer handed back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub message_type: String,
    pub request_id: String,
    pub total_batches: i64,
    pub total_sub_batches: i64,
    pub cache_info: Option<String>,
    /// Number of fragments the answer was assembled from
    pub fragments: usize,
    pub data: Vec<Row>,
}

/// A frame that could not be decoded into a `ResponseFragment`
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentError {
    /// Correlation id, when the frame was at least a JSON object carrying one
    pub request_id: Option<String>,
    pub reason: String,
}

/// Decode one inbound text frame.
///
/// On failure the correlation id is salvaged when possible so the error can
/// be scoped to a single query instead of the whole session.
pub fn decode_fragment(frame: &str) -> Result<ResponseFragment, FragmentError> {
    let value: serde_json::Value = serde_json::from_str(frame).map_err(|e| FragmentError {
        request_id: None,
        reason: format!("invalid JSON: {}", e),
    })?;

    let request_id = value
        .get("requestId")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    serde_json::from_value::<ResponseFragment>(value).map_err(|e| FragmentError {
        request_id,
        reason: format!("malformed fragment: {}", e),
    })
}
