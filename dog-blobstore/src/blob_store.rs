use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::attributes::{attributes_store_for, AttributesStore};
use crate::deleted_index::{DeletedBlobIndex, WARN_LIMIT};
use crate::live::{Blob, CacheStats, LiveBlob, LiveBlobCache};
use crate::location::{store_namespace, BlobLocationResolver, BLOB_CONTENT_SUFFIX, CONTENT_PREFIX};
use crate::metrics::ShardedCounterMetricsStore;
use crate::scheduler::{JobScheduler, PeriodicJob, PeriodicTask};
use crate::store::{read_object, MetadataStore, ObjectStore, CREATE_PERMISSION, DELETE_PERMISSION};
use crate::upload::{uploader_for, ContentMeter, UploadStats, Uploader};
use crate::{
    BlobAttributes, BlobId, BlobStoreConfig, BlobStoreError, BlobStoreMetrics, BlobStoreResult, ByteStream,
    ContentMetrics, Headers, StoreState, BLOB_NAME_HEADER, CREATED_BY_HEADER, TEMPORARY_BLOB_HEADER,
};

/// Bucket object recording the layout version of the store
pub const METADATA_FILENAME: &str = "metadata.properties";

const TYPE_KEY: &str = "type";
pub const TYPE_V1: &str = "gcp/1";
pub const FILE_V1: &str = "file/1";

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Reported when stored bytes exceed the configured quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaViolation {
    pub total_size: i64,
    pub max_total_bytes: u64,
}

enum Ingest {
    Upload(ByteStream),
    Copy { source: BlobId, metrics: ContentMetrics },
}

/// Blob store over a bucket and a metadata store.
///
/// Every mutation of a blob id runs under that id's handle lock, so creates
/// and deletes of one id are totally ordered while different ids proceed
/// independently. Reads of a fresh handle take no lock.
pub struct BucketBlobStore {
    config: BlobStoreConfig,
    namespace: String,
    objects: Arc<dyn ObjectStore>,
    scheduler: Arc<dyn JobScheduler>,
    resolver: BlobLocationResolver,
    uploader: Arc<dyn Uploader>,
    attributes: Arc<dyn AttributesStore>,
    deleted_index: DeletedBlobIndex,
    metrics: Arc<ShardedCounterMetricsStore>,
    live: LiveBlobCache,
    state: RwLock<StoreState>,
    jobs: Mutex<Vec<PeriodicJob>>,
}

impl BucketBlobStore {
    /// Wire up the store and prove its metadata namespace is usable
    #[instrument(skip_all, fields(store = %config.name))]
    pub async fn init(
        config: BlobStoreConfig,
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> BlobStoreResult<Arc<Self>> {
        config.validate()?;
        let namespace = store_namespace(&config.name);

        objects.get(METADATA_FILENAME).await.map_err(|e| {
            BlobStoreError::provisioning_caused_by(
                format!("Unable to initialize blob store bucket: {}", config.bucket_name),
                e,
            )
        })?;

        let deleted_index = DeletedBlobIndex::new(metadata.clone(), namespace.as_str())
            .with_query_limit(config.deleted_blob_query_limit);
        deleted_index
            .test()
            .await
            .map_err(|e| BlobStoreError::provisioning_caused_by("Failed to create deleted blob index", e))?;

        let metrics = Arc::new(ShardedCounterMetricsStore::new(
            metadata.clone(),
            namespace.as_str(),
            config.metrics_flush_delay,
        ));
        metrics
            .test()
            .await
            .map_err(|e| BlobStoreError::provisioning_caused_by("Failed to create blob metrics store", e))?;

        let attributes = attributes_store_for(config.attributes_backend, objects.clone(), metadata, &namespace);
        let uploader = uploader_for(&config.upload_rules);

        debug!("Deleted blobs index and metrics store initialized in {}", namespace);

        Ok(Arc::new(Self {
            config,
            namespace,
            objects,
            scheduler,
            resolver: BlobLocationResolver::new(),
            uploader,
            attributes,
            deleted_index,
            metrics,
            live: LiveBlobCache::new(),
            state: RwLock::new(StoreState::New),
            jobs: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    fn check_state(&self, operation: &'static str, allowed: &[StoreState]) -> BlobStoreResult<()> {
        let state = *self.state.read();
        if !allowed.contains(&state) {
            return Err(BlobStoreError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn check_started(&self, operation: &'static str) -> BlobStoreResult<()> {
        self.check_state(operation, &[StoreState::Started])
    }

    /// Verify the bucket layout marker and schedule the background jobs
    #[instrument(skip(self), fields(store = %self.config.name))]
    pub async fn start(self: &Arc<Self>) -> BlobStoreResult<()> {
        self.check_state("start", &[StoreState::New, StoreState::Stopped])?;
        info!("Starting {}", self.config.name);

        if let Err(e) = self.check_layout_marker().await {
            *self.state.write() = StoreState::Failed;
            return Err(e);
        }

        self.metrics
            .start(self.scheduler.as_ref(), self.config.metrics_flush_interval);

        let weak = Arc::downgrade(self);
        let quota_job = self.scheduler.schedule(
            "quota-check",
            self.config.quota_check_interval,
            store_task(weak.clone(), |store| async move {
                if let Err(e) = store.check_quota().await {
                    warn!("Quota check for {} failed: {}", store.config.name, e);
                }
            }),
        );
        let purge_job = self.scheduler.schedule(
            "live-blob-purge",
            self.config.metrics_flush_interval,
            store_task(weak, |store| async move {
                let evicted = store.live.purge();
                if evicted > 0 {
                    debug!("Evicted {} unreferenced blob handles", evicted);
                }
            }),
        );
        self.jobs.lock().extend([quota_job, purge_job]);

        *self.state.write() = StoreState::Started;
        info!("{} started", self.config.name);
        Ok(())
    }

    async fn check_layout_marker(&self) -> BlobStoreResult<()> {
        match read_object(self.objects.as_ref(), METADATA_FILENAME).await? {
            Some(raw) => {
                let properties = parse_properties(&raw);
                let layout = properties.get(TYPE_KEY).map(String::as_str);
                if layout != Some(TYPE_V1) && layout != Some(FILE_V1) {
                    return Err(BlobStoreError::provisioning(format!(
                        "Unsupported blob store type/version: {} in {}",
                        layout.unwrap_or("<missing>"),
                        METADATA_FILENAME
                    )));
                }
            }
            None => {
                let marker = format!("{}={}\n", TYPE_KEY, TYPE_V1);
                self.objects.put(METADATA_FILENAME, Bytes::from(marker)).await?;
            }
        }
        Ok(())
    }

    /// Cancel background jobs and write out queued metrics
    #[instrument(skip(self), fields(store = %self.config.name))]
    pub async fn stop(&self) -> BlobStoreResult<()> {
        self.check_started("stop")?;
        info!("Stopping {}", self.config.name);
        *self.state.write() = StoreState::Stopped;

        let jobs: Vec<PeriodicJob> = self.jobs.lock().drain(..).collect();
        for job in jobs {
            job.shutdown().await;
        }
        debug!("Quota and purge jobs stopped for {}, flushing metrics", self.config.name);
        self.metrics.stop().await;
        self.uploader.drain().await;
        self.live.purge();

        info!("{} stopped", self.config.name);
        Ok(())
    }

    pub async fn shutdown(&self) -> BlobStoreResult<()> {
        if self.state() == StoreState::Started {
            self.stop().await?;
        }
        *self.state.write() = StoreState::Shutdown;
        Ok(())
    }

    /// Delete all metrics and soft-delete index data. Bucket content is left alone.
    pub async fn remove(&self) -> BlobStoreResult<()> {
        self.check_state(
            "remove",
            &[StoreState::New, StoreState::Stopped, StoreState::Failed, StoreState::Shutdown],
        )?;
        self.metrics.remove_data().await?;
        self.deleted_index.remove_all().await?;
        Ok(())
    }

    pub async fn create(&self, headers: Headers, stream: ByteStream) -> BlobStoreResult<Blob> {
        self.create_internal(headers, Ingest::Upload(stream), None).await
    }

    /// Create under a caller-chosen id, replacing any blob already there
    pub async fn create_with_id(&self, headers: Headers, stream: ByteStream, blob_id: BlobId) -> BlobStoreResult<Blob> {
        self.create_internal(headers, Ingest::Upload(stream), Some(blob_id))
            .await
    }

    /// Hard links into a local filesystem have no bucket equivalent
    pub fn create_from_path(&self, _path: &std::path::Path, _headers: Headers) -> BlobStoreResult<Blob> {
        Err(BlobStoreError::Unsupported("hard links"))
    }

    /// Server-side copy of `blob_id`'s content to a new blob carrying `headers`
    pub async fn copy(&self, blob_id: &BlobId, headers: Headers) -> BlobStoreResult<Blob> {
        let source = self
            .get(blob_id)
            .await?
            .ok_or_else(|| BlobStoreError::not_found(blob_id.as_str()))?;
        let metrics = source
            .metrics()
            .ok_or_else(|| BlobStoreError::not_found(blob_id.as_str()))?;
        self.create_internal(
            headers,
            Ingest::Copy {
                source: blob_id.clone(),
                metrics,
            },
            None,
        )
        .await
    }

    #[instrument(skip(self, headers, ingest), fields(store = %self.config.name))]
    async fn create_internal(&self, headers: Headers, ingest: Ingest, assigned: Option<BlobId>) -> BlobStoreResult<Blob> {
        self.check_started("create")?;
        for required in [BLOB_NAME_HEADER, CREATED_BY_HEADER] {
            if !headers.contains_key(required) {
                return Err(BlobStoreError::MissingHeader(required.to_string()));
            }
        }
        // ids become path segments; listing cannot recover one that spans directories
        if let Some(id) = &assigned {
            if id.as_str().contains('/') {
                return Err(BlobStoreError::invalid(format!("Blob id {} must not contain '/'", id)));
            }
        }

        let blob_id = assigned.unwrap_or_else(|| {
            if headers.get(TEMPORARY_BLOB_HEADER).map(String::as_str) == Some("true") {
                BlobId::new_temporary()
            } else {
                BlobId::new()
            }
        });
        let content_path = self.resolver.content_path(&blob_id);

        let handle = self.live.get_or_create(&blob_id);
        let _guard = handle.lock().await;
        debug!("Writing blob {} to {}", blob_id, content_path);

        match self.ingest(&blob_id, &content_path, headers, ingest).await {
            Ok(attributes) => {
                handle.refresh(attributes);
                Ok(Blob::new(handle.clone()))
            }
            Err(e) => {
                handle.mark_stale();
                self.discard_partial(&blob_id, &content_path).await;
                Err(e.for_blob(blob_id.as_str()))
            }
        }
    }

    async fn ingest(
        &self,
        blob_id: &BlobId,
        content_path: &str,
        headers: Headers,
        ingest: Ingest,
    ) -> BlobStoreResult<BlobAttributes> {
        let (sha1, size) = match ingest {
            Ingest::Upload(stream) => {
                let (metered, meter) = ContentMeter::wrap(stream);
                self.uploader.upload(&self.objects, content_path, metered).await?;
                meter.snapshot()
            }
            Ingest::Copy { source, metrics } => {
                self.objects
                    .copy(&self.resolver.content_path(&source), content_path)
                    .await?;
                (metrics.sha1, metrics.content_size)
            }
        };

        let attributes = BlobAttributes::new(headers, ContentMetrics::now(sha1, size));
        self.attributes.store(blob_id, &attributes).await?;
        self.metrics.record_addition(blob_id, size)?;
        Ok(attributes)
    }

    async fn discard_partial(&self, blob_id: &BlobId, content_path: &str) {
        if let Err(e) = self.attributes.delete(blob_id).await {
            warn!("Failed to remove attributes of {} during cleanup: {}", blob_id, e);
        }
        if let Err(e) = self.objects.delete(content_path).await {
            warn!("Failed to remove {} during cleanup: {}", content_path, e);
        }
    }

    pub async fn get(&self, blob_id: &BlobId) -> BlobStoreResult<Option<Blob>> {
        self.get_blob(blob_id, false).await
    }

    pub async fn get_including_deleted(&self, blob_id: &BlobId) -> BlobStoreResult<Option<Blob>> {
        self.get_blob(blob_id, true).await
    }

    async fn get_blob(&self, blob_id: &BlobId, include_deleted: bool) -> BlobStoreResult<Option<Blob>> {
        self.check_started("get")?;
        let handle = self.live.get_or_create(blob_id);

        if handle.is_stale() {
            let _guard = handle.lock().await;
            if handle.is_stale() {
                match self.attributes.load(blob_id).await? {
                    Some(attributes) => handle.refresh(attributes),
                    None => {
                        warn!("Attempt to access nonexistent blob {}", blob_id);
                        return Ok(None);
                    }
                }
            }
        }

        if handle.is_deleted() && !include_deleted {
            warn!("Attempt to access soft-deleted blob {}", blob_id);
            return Ok(None);
        }

        debug!("Accessing blob {}", blob_id);
        Ok(Some(Blob::new(handle)))
    }

    /// Content of a blob previously returned by this store
    pub async fn open(&self, blob: &Blob) -> BlobStoreResult<ByteStream> {
        self.check_started("open")?;
        self.objects
            .open(&self.resolver.content_path(blob.id()))
            .await
            .map_err(|e| e.for_blob(blob.id().as_str()))?
            .ok_or_else(|| BlobStoreError::not_found(blob.id().as_str()))
    }

    pub async fn exists(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        self.check_started("exists")?;
        self.attributes
            .exists(blob_id)
            .await
            .map_err(|e| e.for_blob(blob_id.as_str()))
    }

    pub async fn attributes(&self, blob_id: &BlobId) -> BlobStoreResult<Option<BlobAttributes>> {
        self.check_started("attributes")?;
        self.attributes.load(blob_id).await
    }

    /// Overwrite the record of an existing blob; returns false when there is none
    pub async fn set_attributes(&self, blob_id: &BlobId, attributes: &BlobAttributes) -> BlobStoreResult<bool> {
        self.check_started("set_attributes")?;
        let handle = self.live.get_or_create(blob_id);
        let _guard = handle.lock().await;

        let Some(mut existing) = self.attributes.load(blob_id).await? else {
            return Ok(false);
        };
        existing.update_from(attributes);
        self.attributes
            .store(blob_id, &existing)
            .await
            .map_err(|e| e.for_blob(blob_id.as_str()))?;
        handle.mark_stale();
        Ok(true)
    }

    /// Mark a blob deleted and queue it for compaction. Deleting an absent or
    /// already deleted blob returns false.
    #[instrument(skip(self), fields(store = %self.config.name))]
    pub async fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> BlobStoreResult<bool> {
        self.check_started("soft_delete")?;
        let handle = self.live.get_or_create(blob_id);
        let _guard = handle.lock().await;
        debug!("Soft deleting blob {}", blob_id);

        self.mark_deleted(blob_id, reason, &handle)
            .await
            .map_err(|e| e.for_blob(blob_id.as_str()))
    }

    async fn mark_deleted(&self, blob_id: &BlobId, reason: &str, handle: &LiveBlob) -> BlobStoreResult<bool> {
        let Some(mut attributes) = self.attributes.load(blob_id).await? else {
            warn!("Attempt to mark-for-delete nonexistent blob {}", blob_id);
            return Ok(false);
        };
        if attributes.deleted {
            debug!("Attempt to delete already-deleted blob {}", blob_id);
            return Ok(false);
        }

        attributes.mark_deleted(reason);
        self.attributes.store(blob_id, &attributes).await?;
        self.deleted_index.add(blob_id).await?;
        handle.mark_stale();
        Ok(true)
    }

    /// Reverse a soft delete that has not been compacted yet
    pub async fn undelete(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        self.check_started("undelete")?;
        let handle = self.live.get_or_create(blob_id);
        let _guard = handle.lock().await;

        self.clear_deleted(blob_id, &handle)
            .await
            .map_err(|e| e.for_blob(blob_id.as_str()))
    }

    async fn clear_deleted(&self, blob_id: &BlobId, handle: &LiveBlob) -> BlobStoreResult<bool> {
        match self.attributes.load(blob_id).await? {
            Some(mut attributes) if attributes.deleted => {
                attributes.clear_deleted();
                self.attributes.store(blob_id, &attributes).await?;
                self.deleted_index.remove(blob_id).await?;
                handle.mark_stale();
                debug!("Undeleted blob {}", blob_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove content, attributes and index entry. Returns whether content was deleted.
    #[instrument(skip(self), fields(store = %self.config.name))]
    pub async fn hard_delete(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        self.check_started("hard_delete")?;
        let handle = self.live.get_or_create(blob_id);
        let result = {
            let _guard = handle.lock().await;
            self.delete_content(blob_id).await
        };
        drop(handle);
        self.live.invalidate(blob_id);

        result.map_err(|e| e.for_blob(blob_id.as_str()))
    }

    async fn delete_content(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        debug!("Hard deleting blob {}", blob_id);
        let deleted = self.objects.delete(&self.resolver.content_path(blob_id)).await?;
        if !deleted {
            return Ok(false);
        }

        match self.attributes.load(blob_id).await? {
            Some(attributes) => self
                .metrics
                .record_deletion(blob_id, attributes.metrics.content_size)?,
            None => warn!("No attributes for hard-deleted blob {}, usage metrics not adjusted", blob_id),
        }
        self.attributes.delete(blob_id).await?;
        self.deleted_index.remove(blob_id).await?;
        Ok(true)
    }

    /// Hard-delete every blob in the soft-delete index. Checks `cancel` between
    /// blobs and returns how many index entries were processed.
    #[instrument(skip(self, cancel), fields(store = %self.config.name))]
    pub async fn compact(&self, cancel: &CancellationToken) -> BlobStoreResult<u64> {
        self.check_started("compact")?;
        info!("Begin deleted blobs processing");

        let started = Instant::now();
        let mut last_progress = started;
        let mut processed = 0u64;
        let mut contents = self.deleted_index.contents().await?;

        while let Some(blob_id) = contents.next().await {
            if cancel.is_cancelled() {
                info!("Deleted blobs processing cancelled after {}", processed);
                return Err(BlobStoreError::Cancelled { processed });
            }
            let blob_id = blob_id?;

            match self.attributes.load(&blob_id).await? {
                Some(attributes) if !attributes.deleted => {
                    debug!("Blob {} was restored, dropping index entry", blob_id);
                    self.deleted_index.remove(&blob_id).await?;
                }
                _ => {
                    if !self.hard_delete(&blob_id).await? {
                        debug!("Content of {} already gone, dropping index entry", blob_id);
                        self.attributes.delete(&blob_id).await?;
                        self.deleted_index.remove(&blob_id).await?;
                    }
                }
            }
            processed += 1;

            if last_progress.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!("Elapsed time: {:?}, processed: {}", started.elapsed(), processed);
                last_progress = Instant::now();
            }
        }

        info!("Elapsed time: {:?}, processed: {}", started.elapsed(), processed);
        Ok(processed)
    }

    /// Blob count and total size as of the last metrics flush
    pub async fn metrics(&self) -> BlobStoreResult<BlobStoreMetrics> {
        self.check_started("metrics")?;
        self.metrics.metrics().await
    }

    /// Write queued usage mutations now, waiting for the flush slot if needed
    pub async fn flush_metrics(&self) -> usize {
        self.metrics.flush().await
    }

    pub fn pending_metrics_mutations(&self) -> usize {
        self.metrics.pending_mutations()
    }

    pub async fn soft_deleted_count(&self) -> BlobStoreResult<usize> {
        self.deleted_index.count().await
    }

    /// Whether compaction is falling behind, measured against [`WARN_LIMIT`]
    pub async fn soft_delete_backlog(&self) -> BlobStoreResult<bool> {
        let backlog = self.deleted_index.is_backlogged().await?;
        if backlog {
            warn!("Soft-deleted blob index of {} has reached {} entries", self.config.name, WARN_LIMIT);
        }
        Ok(backlog)
    }

    /// Whether the bucket grants both object create and delete
    pub async fn is_writable(&self) -> BlobStoreResult<bool> {
        self.check_started("is_writable")?;
        self.objects
            .test_permissions(CONTENT_PREFIX, &[CREATE_PERMISSION, DELETE_PERMISSION])
            .await
            .map_err(|e| {
                error!("Failed to retrieve permissions for {}: {}", self.config.bucket_name, e);
                e
            })
    }

    /// Ids of every blob with content in the bucket
    pub async fn blob_ids(&self) -> BlobStoreResult<Vec<BlobId>> {
        self.check_started("blob_ids")?;
        Ok(self
            .content_objects()
            .await?
            .into_iter()
            .filter_map(|(id, _)| id)
            .collect())
    }

    /// Ids of permanent blobs whose content changed within the last `since_days` days
    pub async fn blob_ids_updated_since(&self, since_days: i64) -> BlobStoreResult<Vec<BlobId>> {
        if since_days < 0 {
            return Err(BlobStoreError::invalid("since_days must be >= 0"));
        }
        self.blob_ids_updated_after(Utc::now() - chrono::Duration::days(since_days))
            .await
    }

    pub async fn blob_ids_updated_after(&self, cutoff: DateTime<Utc>) -> BlobStoreResult<Vec<BlobId>> {
        self.check_started("blob_ids_updated_since")?;
        Ok(self
            .content_objects()
            .await?
            .into_iter()
            .filter(|(_, updated_at)| *updated_at > cutoff)
            .filter_map(|(id, _)| id)
            .filter(|id| !id.is_temporary())
            .collect())
    }

    async fn content_objects(&self) -> BlobStoreResult<Vec<(Option<BlobId>, DateTime<Utc>)>> {
        let prefix = format!("{}/", CONTENT_PREFIX);
        Ok(self
            .objects
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|o| o.path.ends_with(BLOB_CONTENT_SUFFIX))
            .map(|o| (self.resolver.blob_id_from_path(&o.path), o.updated_at))
            .collect())
    }

    /// Compare usage with the configured quota, warning on violation
    pub async fn check_quota(&self) -> BlobStoreResult<Option<QuotaViolation>> {
        let Some(limit) = self.config.quota else {
            return Ok(None);
        };
        let usage = self.metrics().await?;
        if usage.total_size > 0 && usage.total_size as u64 > limit.max_total_bytes {
            warn!(
                "Blob store {} is over quota: {} bytes stored, limit {}",
                self.config.name, usage.total_size, limit.max_total_bytes
            );
            return Ok(Some(QuotaViolation {
                total_size: usage.total_size,
                max_total_bytes: limit.max_total_bytes,
            }));
        }
        Ok(None)
    }

    /// Wait until intermediate chunks of finished uploads are deleted
    pub async fn drain_uploads(&self) {
        self.uploader.drain().await;
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploader.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.live.stats()
    }
}

fn store_task<F, Fut>(store: Weak<BucketBlobStore>, body: F) -> PeriodicTask
where
    F: Fn(Arc<BucketBlobStore>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let body = Arc::new(body);
    Arc::new(move || {
        let store = store.clone();
        let body = body.clone();
        async move {
            if let Some(store) = store.upgrade() {
                body(store).await;
            }
        }
        .boxed()
    })
}

fn parse_properties(raw: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMetadataStore, MemoryObjectStore};
    use crate::scheduler::ManualJobScheduler;
    use tracing_test::traced_test;

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        metadata: Arc<MemoryMetadataStore>,
        scheduler: Arc<ManualJobScheduler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                objects: Arc::new(MemoryObjectStore::new()),
                metadata: Arc::new(MemoryMetadataStore::new()),
                scheduler: Arc::new(ManualJobScheduler::new()),
            }
        }

        async fn init(&self) -> BlobStoreResult<Arc<BucketBlobStore>> {
            let config = BlobStoreConfig::new("unit", "bucket").with_metrics_flush_delay(Duration::ZERO);
            BucketBlobStore::init(config, self.objects.clone(), self.metadata.clone(), self.scheduler.clone()).await
        }
    }

    fn headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "file.txt".to_string());
        headers.insert(CREATED_BY_HEADER.to_string(), "unit".to_string());
        headers
    }

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::once(async move { Ok(Bytes::from_static(data)) }))
    }

    #[test]
    fn properties_are_parsed() {
        let parsed = parse_properties(b"# comment\ntype = gcp/1\n\nother=x=y\n");
        assert_eq!(parsed.get("type").map(String::as_str), Some("gcp/1"));
        assert_eq!(parsed.get("other").map(String::as_str), Some("x=y"));
    }

    #[tokio::test]
    async fn start_writes_layout_marker_and_schedules_jobs() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        assert_eq!(store.state(), StoreState::New);

        store.start().await.unwrap();

        assert_eq!(
            fixture.objects.read(METADATA_FILENAME).unwrap(),
            Bytes::from_static(b"type=gcp/1\n")
        );
        let mut jobs = fixture.scheduler.active_jobs();
        jobs.sort();
        assert_eq!(jobs, vec!["live-blob-purge", "metrics-flush", "quota-check"]);

        store.stop().await.unwrap();
        assert!(fixture.scheduler.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn unknown_layout_fails_start() {
        let fixture = Fixture::new();
        fixture
            .objects
            .put(METADATA_FILENAME, Bytes::from_static(b"type=s3/1\n"))
            .await
            .unwrap();
        let store = fixture.init().await.unwrap();

        let err = store.start().await.unwrap_err();
        assert!(matches!(err, BlobStoreError::Provisioning { .. }));
        assert_eq!(store.state(), StoreState::Failed);
    }

    #[tokio::test]
    async fn file_layout_is_accepted() {
        let fixture = Fixture::new();
        fixture
            .objects
            .put(METADATA_FILENAME, Bytes::from_static(b"type=file/1\n"))
            .await
            .unwrap();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_metadata_store_fails_init() {
        let fixture = Fixture::new();
        fixture.metadata.set_unavailable(true);

        let err = fixture.init().await.err().unwrap();
        assert!(matches!(err, BlobStoreError::Provisioning { .. }));
    }

    #[tokio::test]
    async fn operations_are_guarded_by_state() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();

        let err = store.create(headers(), body(b"x")).await.unwrap_err();
        assert!(err.is_invalid_state());
        assert!(store.remove().await.is_ok());

        store.start().await.unwrap();
        assert!(store.remove().await.unwrap_err().is_invalid_state());
        assert!(store.start().await.unwrap_err().is_invalid_state());

        store.shutdown().await.unwrap();
        assert_eq!(store.state(), StoreState::Shutdown);
        assert!(store.get(&BlobId::new()).await.unwrap_err().is_invalid_state());
    }

    #[tokio::test]
    async fn missing_headers_are_rejected() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();

        let mut incomplete = headers();
        incomplete.remove(CREATED_BY_HEADER);
        let err = store.create(incomplete, body(b"x")).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::MissingHeader(ref h) if h == CREATED_BY_HEADER));
    }

    #[tokio::test]
    async fn temporary_header_selects_tmp_location() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();

        let mut temporary = headers();
        temporary.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
        let blob = store.create(temporary, body(b"scratch")).await.unwrap();

        assert!(blob.id().is_temporary());
        assert!(fixture.objects.contains(&format!("content/tmp/{}.bytes", blob.id())));
        assert!(store.blob_ids_updated_since(1).await.unwrap().is_empty());
        assert_eq!(store.blob_ids().await.unwrap(), vec![blob.id().clone()]);
    }

    #[tokio::test]
    async fn failed_attribute_write_cleans_up_content() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();
        fixture.objects.fail_puts_containing(".properties");

        let err = store.create(headers(), body(b"payload")).await.unwrap_err();

        assert!(matches!(err, BlobStoreError::Storage { .. }));
        assert!(fixture.objects.paths().iter().all(|p| !p.ends_with(".bytes")));
        assert_eq!(store.pending_metrics_mutations(), 0);
    }

    #[traced_test]
    #[tokio::test]
    async fn soft_deleted_access_is_logged() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();

        let blob = store.create(headers(), body(b"x")).await.unwrap();
        store.soft_delete(blob.id(), "test").await.unwrap();

        assert!(store.get(blob.id()).await.unwrap().is_none());
        assert!(logs_contain("Attempt to access soft-deleted blob"));
    }

    #[tokio::test]
    async fn create_from_path_is_unsupported() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        let err = store
            .create_from_path(std::path::Path::new("/tmp/x"), headers())
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::Unsupported(_)));
    }

    #[tokio::test]
    async fn quota_violation_is_reported() {
        let fixture = Fixture::new();
        let config = BlobStoreConfig::new("quota", "bucket")
            .with_metrics_flush_delay(Duration::ZERO)
            .with_quota(4);
        let store = BucketBlobStore::init(
            config,
            fixture.objects.clone(),
            fixture.metadata.clone(),
            fixture.scheduler.clone(),
        )
        .await
        .unwrap();
        store.start().await.unwrap();

        store.create(headers(), body(b"abc")).await.unwrap();
        store.flush_metrics().await;
        assert_eq!(store.check_quota().await.unwrap(), None);

        store.create(headers(), body(b"defg")).await.unwrap();
        store.flush_metrics().await;
        assert_eq!(
            store.check_quota().await.unwrap(),
            Some(QuotaViolation {
                total_size: 7,
                max_total_bytes: 4
            })
        );
    }

    #[tokio::test]
    async fn denied_permissions_make_store_read_only() {
        let fixture = Fixture::new();
        let store = fixture.init().await.unwrap();
        store.start().await.unwrap();

        assert!(store.is_writable().await.unwrap());
        fixture.objects.set_permissions_denied(true);
        assert!(!store.is_writable().await.unwrap());
    }
}
