//! Narrow interfaces over the two remote services a blob store is a client of.
//!
//! Transport and credential wiring for real buckets and metadata stores live
//! outside this crate; [`MemoryObjectStore`](crate::MemoryObjectStore) and [`MemoryMetadataStore`](crate::MemoryMetadataStore) are the in-process implementations.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{BlobStoreResult, ByteStream};

/// Type alias for boxed streams
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Permission required to write new objects
pub const CREATE_PERMISSION: &str = "storage.objects.create";

/// Permission required to remove objects
pub const DELETE_PERMISSION: &str = "storage.objects.delete";

/// Ceiling on keys accepted by one batched metadata delete
pub const DEFAULT_MAX_DELETE_BATCH: usize = 500;

/// Bucket-style object storage primitives
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an in-memory object, replacing any existing object at `path`
    async fn put(&self, path: &str, data: Bytes) -> BlobStoreResult<ObjectRef>;

    /// Store an object from a stream of unknown length
    async fn put_stream(&self, path: &str, stream: ByteStream) -> BlobStoreResult<ObjectRef>;

    /// Object metadata, or `None` when absent
    async fn get(&self, path: &str) -> BlobStoreResult<Option<ObjectRef>>;

    /// Object content, or `None` when absent
    async fn open(&self, path: &str) -> BlobStoreResult<Option<ByteStream>>;

    /// Remove an object; returns whether something was deleted
    async fn delete(&self, path: &str) -> BlobStoreResult<bool>;

    /// All objects whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> BlobStoreResult<Vec<ObjectRef>>;

    /// Atomically concatenate `parts`, in order, into `destination`
    async fn compose(&self, destination: &str, parts: &[String]) -> BlobStoreResult<ObjectRef>;

    /// Server-side copy
    async fn copy(&self, source: &str, destination: &str) -> BlobStoreResult<ObjectRef>;

    /// Whether the caller holds every named permission on `path`
    async fn test_permissions(&self, path: &str, permissions: &[&str]) -> BlobStoreResult<bool>;

    /// Maximum number of parts one compose request accepts
    fn compose_limit(&self) -> usize {
        32
    }
}

/// Read a whole object into memory, `None` when absent
pub async fn read_object(store: &dyn ObjectStore, path: &str) -> BlobStoreResult<Option<Bytes>> {
    let Some(stream) = store.open(path).await? else {
        return Ok(None);
    };
    let buffer = stream
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(Some(buffer.freeze()))
}

/// Reference to a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub path: String,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// Address of one metadata entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl EntityKey {
    pub fn new<N, K, S>(namespace: N, kind: K, name: S) -> Self
    where
        N: Into<String>,
        K: Into<String>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Typed field value of a metadata entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Field map of a metadata entity
pub type Fields = BTreeMap<String, FieldValue>;

/// One query result row
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: EntityKey,
    /// Empty for key-only queries; only the projected fields for projections
    pub fields: Fields,
}

/// Shape of the rows a query returns; cheaper shapes read less
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    KeysOnly,
    Fields(Vec<String>),
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub namespace: String,
    pub kind: String,
    pub projection: Projection,
    pub limit: Option<usize>,
}

impl Query {
    pub fn keys_only<N: Into<String>, K: Into<String>>(namespace: N, kind: K) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            projection: Projection::KeysOnly,
            limit: None,
        }
    }

    pub fn projection<N: Into<String>, K: Into<String>>(namespace: N, kind: K, fields: &[&str]) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            projection: Projection::Fields(fields.iter().map(|f| f.to_string()).collect()),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Key-value metadata store with transactional batch writes
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, key: &EntityKey, fields: Fields) -> BlobStoreResult<()>;

    async fn get(&self, key: &EntityKey) -> BlobStoreResult<Option<Fields>>;

    /// Remove entities; at most [`MetadataStore::max_delete_batch`] keys per call
    async fn delete(&self, keys: &[EntityKey]) -> BlobStoreResult<()>;

    /// Rows of one kind in one namespace, without ordering guarantees
    async fn query(&self, query: Query) -> BlobStoreResult<BoxStream<BlobStoreResult<Entity>>>;

    /// Write every entity or none of them
    async fn commit(&self, writes: Vec<(EntityKey, Fields)>) -> BlobStoreResult<()>;

    fn max_delete_batch(&self) -> usize {
        DEFAULT_MAX_DELETE_BATCH
    }
}
