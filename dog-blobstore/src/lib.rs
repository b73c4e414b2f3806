//! # dog-blobstore: Bucket-backed blob storage
//!
//! `dog-blobstore` stores blobs as objects in a cloud bucket and keeps the
//! bookkeeping that a bucket alone cannot: per-blob attributes, an index of
//! soft-deleted blobs waiting for compaction, and sharded usage counters.
//!
//! ## Key Features
//!
//! - **Chunked compose uploads**: large streams are split into parts, uploaded
//!   concurrently and stitched together server-side
//! - **Per-blob serialization**: every mutation of one blob id is ordered, distinct ids never wait on each other
//! - **Soft delete and compaction**: deletes are cheap marks, reclaimed later in bulk
//! - **Sharded metrics**: blob count and total size kept without a single hot counter
//! - **Storage agnostic**: bucket and metadata store sit behind traits, with in-memory implementations for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dog_blobstore::prelude::*;
//! use dog_blobstore::{MemoryMetadataStore, MemoryObjectStore, TokioJobScheduler};
//!
//! # #[tokio::main]
//! # async fn main() -> BlobStoreResult<()> {
//! let config = BlobStoreConfig::new("media", "media-bucket").with_chunk_size(5 * 1024 * 1024);
//! let store = BucketBlobStore::init(
//!     config,
//!     Arc::new(MemoryObjectStore::new()),
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(TokioJobScheduler::new()),
//! )
//! .await?;
//! store.start().await?;
//!
//! let mut headers = Headers::new();
//! headers.insert(BLOB_NAME_HEADER.to_string(), "hello.txt".to_string());
//! headers.insert(CREATED_BY_HEADER.to_string(), "user-123".to_string());
//! let body: ByteStream = Box::pin(futures::stream::once(async { Ok(bytes::Bytes::from_static(b"Hello, world!")) }));
//!
//! let blob = store.create(headers, body).await?;
//! let content = store.open(&blob).await?;
//! # drop(content);
//!
//! store.soft_delete(blob.id(), "no longer needed").await?;
//! store.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               BucketBlobStore                │  ← lifecycle, per-id locking
//! ├───────────┬────────────┬───────────┬─────────┤
//! │ Uploader  │ Attributes │ Deleted   │ Metrics │
//! │           │ Store      │ BlobIndex │ Store   │
//! ├───────────┴─────┬──────┴───────────┴─────────┤
//! │   ObjectStore   │        MetadataStore       │  ← storage primitives
//! └─────────────────┴────────────────────────────┘
//! ```
//!
//! Transport clients for a real bucket and metadata service implement
//! [`ObjectStore`] and [`MetadataStore`]; nothing above them knows which
//! provider is in use.

pub mod attributes;
pub mod blob_store;
mod config;
pub mod deleted_index;
mod error;
mod live;
pub mod location;
mod memory;
pub mod metrics;
pub mod scheduler;
pub mod store;
mod types;
pub mod upload;

// Re-export main types for clean API
pub use attributes::{AttributesStore, MetadataAttributesStore, ObjectFileAttributesStore};
pub use blob_store::{BucketBlobStore, QuotaViolation, METADATA_FILENAME};
pub use config::{
    migrate_legacy_attributes, AttributesBackendKind, BlobStoreConfig, QuotaLimit, UploadRules,
    DEFAULT_DELETED_BLOB_QUERY_LIMIT,
};
pub use deleted_index::{DeletedBlobIndex, WARN_LIMIT};
pub use error::{BlobStoreError, BlobStoreResult};
pub use live::{Blob, CacheStats};
pub use location::{BlobLocationResolver, ShardKey};
pub use memory::{MemoryMetadataStore, MemoryObjectStore};
pub use metrics::ShardedCounterMetricsStore;
pub use scheduler::{JobScheduler, ManualJobScheduler, PeriodicJob, TokioJobScheduler};
pub use store::{
    Entity, EntityKey, FieldValue, Fields, MetadataStore, ObjectRef, ObjectStore, Projection, Query,
};
pub use types::{
    BlobAttributes, BlobId, BlobStoreMetrics, ByteStream, ContentMetrics, Headers, StoreState,
    BLOB_NAME_HEADER, CREATED_BY_HEADER, TEMPORARY_BLOB_HEADER, TEMPORARY_BLOB_ID_PREFIX,
};
pub use upload::{MultipartUploader, SinglepartUploader, UploadStats, Uploader};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Blob, BlobAttributes, BlobId, BlobStoreConfig, BlobStoreError, BlobStoreResult, BucketBlobStore,
        ByteStream, Headers, BLOB_NAME_HEADER, CREATED_BY_HEADER,
    };
}
