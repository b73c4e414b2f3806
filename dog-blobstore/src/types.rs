use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::{BlobStoreError, BlobStoreResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Prefix reserved for temporary blobs, which are placed outside the volume/chapter tree
pub const TEMPORARY_BLOB_ID_PREFIX: &str = "tmp$";

/// Required header naming the blob
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";

/// Required header naming the creator of the blob
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";

/// When set to `true` on create, a temporary blob id is derived
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";

/// Ordered blob headers
pub type Headers = BTreeMap<String, String>;

/// Unique identifier for a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl BlobId {
    /// Generate a new random blob ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Generate a new random temporary blob ID
    pub fn new_temporary() -> Self {
        Self(format!("{}{}", TEMPORARY_BLOB_ID_PREFIX, Uuid::new_v4()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_BLOB_ID_PREFIX)
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle state of a store instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    New,
    Started,
    Stopped,
    Failed,
    Shutdown,
}

/// Size, hash and creation time of stored content. Set once per successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMetrics {
    pub creation_time: DateTime<Utc>,
    pub sha1: String,
    pub content_size: u64,
}

impl ContentMetrics {
    pub fn new<S: Into<String>>(creation_time: DateTime<Utc>, sha1: S, content_size: u64) -> Self {
        Self {
            creation_time,
            sha1: sha1.into(),
            content_size,
        }
    }

    /// Metrics stamped with the current time, truncated to the millisecond
    /// precision the attribute record persists.
    pub fn now<S: Into<String>>(sha1: S, content_size: u64) -> Self {
        let now = Utc::now();
        let creation_time = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);
        Self::new(creation_time, sha1, content_size)
    }
}

/// Aggregate usage of a store, summed across all shard counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStoreMetrics {
    pub blob_count: i64,
    pub total_size: i64,
}

const HEADER_PREFIX: &str = "@";
const CREATION_TIME_FIELD: &str = "creationTime";
const SHA1_FIELD: &str = "sha1";
const SIZE_FIELD: &str = "size";
const DELETED_FIELD: &str = "deleted";
const DELETED_REASON_FIELD: &str = "deletedReason";

/// Per-blob metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttributes {
    pub headers: Headers,
    pub metrics: ContentMetrics,
    pub deleted: bool,
    pub deleted_reason: Option<String>,
}

impl BlobAttributes {
    pub fn new(headers: Headers, metrics: ContentMetrics) -> Self {
        Self {
            headers,
            metrics,
            deleted: false,
            deleted_reason: None,
        }
    }

    pub fn mark_deleted<S: Into<String>>(&mut self, reason: S) {
        self.deleted = true;
        self.deleted_reason = Some(reason.into());
    }

    pub fn clear_deleted(&mut self) {
        self.deleted = false;
        self.deleted_reason = None;
    }

    /// Replace headers, metrics and deletion state from another record
    pub fn update_from(&mut self, other: &BlobAttributes) {
        self.headers = other.headers.clone();
        self.metrics = other.metrics.clone();
        self.deleted = other.deleted;
        self.deleted_reason = other.deleted_reason.clone();
    }

    /// Flatten into the string map persisted by both attribute backends.
    /// Headers are stored under an `@` prefix next to the metric fields.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields: BTreeMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| (format!("{}{}", HEADER_PREFIX, k), v.clone()))
            .collect();

        fields.insert(
            CREATION_TIME_FIELD.to_string(),
            self.metrics.creation_time.timestamp_millis().to_string(),
        );
        fields.insert(SHA1_FIELD.to_string(), self.metrics.sha1.clone());
        fields.insert(SIZE_FIELD.to_string(), self.metrics.content_size.to_string());

        if self.deleted {
            fields.insert(DELETED_FIELD.to_string(), "true".to_string());
            if let Some(reason) = &self.deleted_reason {
                fields.insert(DELETED_REASON_FIELD.to_string(), reason.clone());
            }
        }
        fields
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> BlobStoreResult<Self> {
        let headers = fields
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(HEADER_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        let millis: i64 = required_field(fields, CREATION_TIME_FIELD)?
            .parse()
            .map_err(|_| BlobStoreError::invalid("creationTime is not a number"))?;
        let creation_time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| BlobStoreError::invalid(format!("creationTime {} out of range", millis)))?;
        let content_size: u64 = required_field(fields, SIZE_FIELD)?
            .parse()
            .map_err(|_| BlobStoreError::invalid("size is not a number"))?;
        let sha1 = required_field(fields, SHA1_FIELD)?.to_string();

        let deleted = fields
            .get(DELETED_FIELD)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            headers,
            metrics: ContentMetrics::new(creation_time, sha1, content_size),
            deleted,
            deleted_reason: if deleted {
                fields.get(DELETED_REASON_FIELD).cloned()
            } else {
                None
            },
        })
    }
}

fn required_field<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> BlobStoreResult<&'a str> {
    fields
        .get(name)
        .map(|v| v.as_str())
        .ok_or_else(|| BlobStoreError::invalid(format!("attribute record is missing {}", name)))
}
