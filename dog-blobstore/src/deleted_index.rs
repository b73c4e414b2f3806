use std::sync::Arc;

use futures_util::TryStreamExt;
use tracing::{debug, warn};

use crate::config::DEFAULT_DELETED_BLOB_QUERY_LIMIT;
use crate::store::{BoxStream, EntityKey, Fields, MetadataStore, Query};
use crate::{BlobId, BlobStoreResult};

/// Entity kind of index entries
pub const DELETED_BLOBS_KIND: &str = "DeletedBlobs";

/// Index size at which compaction is considered to be falling behind
pub const WARN_LIMIT: usize = 1000;

/// Blob id used to check the index during provisioning
pub const SENTINEL_BLOB_ID: &str = "tmp$/sentinel";

/// Key-only ledger of soft-deleted blob ids awaiting compaction
pub struct DeletedBlobIndex {
    metadata: Arc<dyn MetadataStore>,
    namespace: String,
    query_limit: usize,
}

impl DeletedBlobIndex {
    pub fn new<S: Into<String>>(metadata: Arc<dyn MetadataStore>, namespace: S) -> Self {
        Self {
            metadata,
            namespace: namespace.into(),
            query_limit: DEFAULT_DELETED_BLOB_QUERY_LIMIT,
        }
    }

    pub fn with_query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit.max(1);
        self
    }

    pub fn query_limit(&self) -> usize {
        self.query_limit
    }

    fn key(&self, blob_id: &BlobId) -> EntityKey {
        EntityKey::new(self.namespace.as_str(), DELETED_BLOBS_KIND, blob_id.as_str())
    }

    pub async fn add(&self, blob_id: &BlobId) -> BlobStoreResult<()> {
        self.metadata.put(&self.key(blob_id), Fields::new()).await
    }

    pub async fn remove(&self, blob_id: &BlobId) -> BlobStoreResult<()> {
        self.metadata.delete(std::slice::from_ref(&self.key(blob_id))).await
    }

    /// Soft-deleted ids, at most the configured query limit per listing, in no particular order
    pub async fn contents(&self) -> BlobStoreResult<BoxStream<BlobStoreResult<BlobId>>> {
        let rows = self
            .metadata
            .query(Query::keys_only(self.namespace.as_str(), DELETED_BLOBS_KIND).with_limit(self.query_limit))
            .await?;
        Ok(Box::pin(
            rows.map_ok(|entity| BlobId::from_string(entity.key.name)),
        ))
    }

    /// Number of entries, counted with a key-only scan
    pub async fn count(&self) -> BlobStoreResult<usize> {
        let rows = self
            .metadata
            .query(Query::keys_only(self.namespace.as_str(), DELETED_BLOBS_KIND))
            .await?;
        rows.try_fold(0usize, |n, _| async move { Ok(n + 1) }).await
    }

    /// Whether the index has grown past [`WARN_LIMIT`]
    pub async fn is_backlogged(&self) -> BlobStoreResult<bool> {
        Ok(self.count().await? >= WARN_LIMIT)
    }

    /// Delete every entry, in batches no larger than the metadata store accepts
    pub async fn remove_all(&self) -> BlobStoreResult<usize> {
        warn!("Removing all entries in the index of soft-deleted blobs");

        let keys: Vec<EntityKey> = self
            .metadata
            .query(Query::keys_only(self.namespace.as_str(), DELETED_BLOBS_KIND))
            .await?
            .map_ok(|entity| entity.key)
            .try_collect()
            .await?;

        let batch = self.metadata.max_delete_batch().max(1);
        for partition in keys.chunks(batch) {
            self.metadata.delete(partition).await?;
        }

        warn!("Deleted {} blob ids from the soft-deleted blob index", keys.len());
        Ok(keys.len())
    }

    /// Write and remove a sentinel entry to prove the namespace is usable
    pub async fn test(&self) -> BlobStoreResult<()> {
        let sentinel = BlobId::from(SENTINEL_BLOB_ID);
        self.add(&sentinel).await?;
        self.remove(&sentinel).await?;
        debug!("Soft-deleted blob index in {} is writable", self.namespace);
        Ok(())
    }
}
