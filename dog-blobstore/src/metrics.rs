use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::location::{BlobLocationResolver, ShardKey};
use crate::scheduler::{JobScheduler, PeriodicJob, PeriodicTask};
use crate::store::{EntityKey, FieldValue, Fields, MetadataStore, Query};
use crate::{BlobId, BlobStoreError, BlobStoreMetrics, BlobStoreResult, StoreState};

/// Entity kind of shard counters
pub const SHARD_KIND: &str = "MetricsStoreShard";

const COUNT_FIELD: &str = "count";
const SIZE_FIELD: &str = "size";
const SENTINEL_SHARD: &str = "tmp$/sentinel";

/// One pending change to a shard counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsMutation {
    pub shard: ShardKey,
    pub size_delta: i64,
    pub count_delta: i64,
}

struct FlushState {
    receiver: mpsc::UnboundedReceiver<MetricsMutation>,
    last_flush: Option<Instant>,
}

/// Usage counters spread across one record per shard.
///
/// Recording is a queue push. A single flush at a time drains the queue,
/// folds it into one delta per shard and commits every touched counter in one
/// transaction; if that fails the drained mutations go back on the queue.
pub struct ShardedCounterMetricsStore {
    metadata: Arc<dyn MetadataStore>,
    namespace: String,
    resolver: BlobLocationResolver,
    state: RwLock<StoreState>,
    sender: mpsc::UnboundedSender<MetricsMutation>,
    flush_state: tokio::sync::Mutex<FlushState>,
    pending: AtomicUsize,
    flush_delay: Duration,
    flush_job: Mutex<Option<PeriodicJob>>,
}

impl ShardedCounterMetricsStore {
    pub fn new<S: Into<String>>(metadata: Arc<dyn MetadataStore>, namespace: S, flush_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            metadata,
            namespace: namespace.into(),
            resolver: BlobLocationResolver::new(),
            state: RwLock::new(StoreState::Stopped),
            sender,
            flush_state: tokio::sync::Mutex::new(FlushState {
                receiver,
                last_flush: None,
            }),
            pending: AtomicUsize::new(0),
            flush_delay,
            flush_job: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    /// Accept mutations and flush every `interval` on `scheduler`
    pub fn start(self: &Arc<Self>, scheduler: &dyn JobScheduler, interval: Duration) {
        *self.state.write() = StoreState::Started;

        let store = Arc::downgrade(self);
        let task: PeriodicTask = Arc::new(move || {
            let store = store.clone();
            async move {
                if let Some(store) = store.upgrade() {
                    store.flush().await;
                }
            }
            .boxed()
        });
        let job = scheduler.schedule("metrics-flush", interval, task);
        if let Some(previous) = self.flush_job.lock().replace(job) {
            previous.cancel();
        }
    }

    /// Stop accepting mutations, cancel the periodic flush and write out what is queued
    pub async fn stop(&self) {
        *self.state.write() = StoreState::Stopped;
        let job = self.flush_job.lock().take();
        if let Some(job) = job {
            job.shutdown().await;
        }
        self.flush().await;

        let stranded = self.pending_mutations();
        if stranded > 0 {
            warn!("{} metrics mutations could not be written before stop", stranded);
        }
    }

    fn check_started(&self, operation: &'static str) -> BlobStoreResult<()> {
        let state = *self.state.read();
        if state != StoreState::Started {
            return Err(BlobStoreError::InvalidState { operation, state });
        }
        Ok(())
    }

    pub fn record_addition(&self, blob_id: &BlobId, size: u64) -> BlobStoreResult<()> {
        self.record(blob_id, size as i64, 1, "record_addition")
    }

    pub fn record_deletion(&self, blob_id: &BlobId, size: u64) -> BlobStoreResult<()> {
        self.record(blob_id, -(size as i64), -1, "record_deletion")
    }

    fn record(&self, blob_id: &BlobId, size_delta: i64, count_delta: i64, operation: &'static str) -> BlobStoreResult<()> {
        self.check_started(operation)?;
        let shard = self.resolver.shard_key(blob_id)?;
        self.enqueue(MetricsMutation {
            shard,
            size_delta,
            count_delta,
        });
        Ok(())
    }

    fn enqueue(&self, mutation: MetricsMutation) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // the receiver lives as long as self
        let _ = self.sender.send(mutation);
    }

    /// Mutations recorded but not yet written
    pub fn pending_mutations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Write queued mutations. At most one flush runs at a time and flushes are
    /// spaced by at least the flush delay; a caller arriving early waits for its
    /// slot. Failures are logged and the mutations re-queued, never returned.
    ///
    /// Returns the number of mutations written.
    pub async fn flush(&self) -> usize {
        // held for the whole flush so shard read-modify-write never interleaves
        let mut flush_state = self.flush_state.lock().await;
        if flush_state.receiver.is_empty() {
            return 0;
        }

        if let Some(last) = flush_state.last_flush {
            let ready_at = last + self.flush_delay;
            if Instant::now() < ready_at {
                debug!("Flush waiting {:?} for its slot", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
        flush_state.last_flush = Some(Instant::now());

        let mut drained = Vec::new();
        while let Ok(mutation) = flush_state.receiver.try_recv() {
            drained.push(mutation);
        }
        self.pending.fetch_sub(drained.len(), Ordering::SeqCst);

        match self.write_deltas(&drained).await {
            Ok(shards) => {
                debug!("Drained {} mutations into {} shard counters", drained.len(), shards);
                drained.len()
            }
            Err(e) => {
                warn!("Metrics flush failed, requeueing {} mutations: {}", drained.len(), e);
                for mutation in drained {
                    self.enqueue(mutation);
                }
                0
            }
        }
    }

    async fn write_deltas(&self, mutations: &[MetricsMutation]) -> BlobStoreResult<usize> {
        let mut deltas: BTreeMap<&ShardKey, (i64, i64)> = BTreeMap::new();
        for mutation in mutations {
            let entry = deltas.entry(&mutation.shard).or_insert((0, 0));
            entry.0 += mutation.size_delta;
            entry.1 += mutation.count_delta;
        }

        let mut writes = Vec::with_capacity(deltas.len());
        for (shard, (size_delta, count_delta)) in deltas {
            let key = self.shard_key(shard.as_str());
            let counter = self.shard_counter(&key).await?;
            let mut fields = Fields::new();
            fields.insert(SIZE_FIELD.to_string(), FieldValue::Integer(field(&counter, SIZE_FIELD) + size_delta));
            fields.insert(COUNT_FIELD.to_string(), FieldValue::Integer(field(&counter, COUNT_FIELD) + count_delta));
            writes.push((key, fields));
        }

        let shards = writes.len();
        if shards > 0 {
            self.metadata.commit(writes).await?;
        }
        Ok(shards)
    }

    fn shard_key(&self, shard: &str) -> EntityKey {
        EntityKey::new(self.namespace.as_str(), SHARD_KIND, shard)
    }

    /// Current counter, created at zero when absent
    async fn shard_counter(&self, key: &EntityKey) -> BlobStoreResult<Fields> {
        if let Some(existing) = self.metadata.get(key).await? {
            trace!("Counter for {} already present", key.name);
            return Ok(existing);
        }

        debug!("Creating metrics counter shard for {}", key.name);
        let mut zero = Fields::new();
        zero.insert(SIZE_FIELD.to_string(), FieldValue::Integer(0));
        zero.insert(COUNT_FIELD.to_string(), FieldValue::Integer(0));
        self.metadata.put(key, zero.clone()).await?;
        Ok(zero)
    }

    /// Sum of all shard counters. Mutations still queued are not included.
    pub async fn metrics(&self) -> BlobStoreResult<BlobStoreMetrics> {
        let rows = self
            .metadata
            .query(Query::projection(
                self.namespace.as_str(),
                SHARD_KIND,
                &[COUNT_FIELD, SIZE_FIELD],
            ))
            .await?;

        rows.try_fold(BlobStoreMetrics::default(), |mut totals, entity| async move {
            totals.blob_count += field(&entity.fields, COUNT_FIELD);
            totals.total_size += field(&entity.fields, SIZE_FIELD);
            Ok(totals)
        })
        .await
    }

    /// Delete every shard counter
    pub async fn remove_data(&self) -> BlobStoreResult<()> {
        warn!("Removing all blob store metrics data");
        let keys: Vec<EntityKey> = self
            .metadata
            .query(Query::keys_only(self.namespace.as_str(), SHARD_KIND))
            .await?
            .map_ok(|entity| entity.key)
            .try_collect()
            .await?;

        let batch = self.metadata.max_delete_batch().max(1);
        for partition in keys.chunks(batch) {
            self.metadata.delete(partition).await?;
        }
        warn!("Blob store metrics data removed, {} shards", keys.len());
        Ok(())
    }

    /// Write, remove and read a counter to prove the namespace is usable
    pub async fn test(&self) -> BlobStoreResult<()> {
        let key = self.shard_key(SENTINEL_SHARD);
        self.shard_counter(&key).await?;
        self.metadata.delete(std::slice::from_ref(&key)).await?;
        self.metrics().await?;
        Ok(())
    }
}

fn field(fields: &Fields, name: &str) -> i64 {
    fields.get(name).and_then(FieldValue::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMetadataStore;
    use crate::scheduler::ManualJobScheduler;

    fn started(metadata: &Arc<MemoryMetadataStore>) -> Arc<ShardedCounterMetricsStore> {
        let store = Arc::new(ShardedCounterMetricsStore::new(
            metadata.clone(),
            "blobstore-test",
            Duration::from_millis(10),
        ));
        store.start(&ManualJobScheduler::new(), Duration::from_secs(5));
        store
    }

    #[tokio::test]
    async fn recording_requires_started() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = ShardedCounterMetricsStore::new(metadata, "ns", Duration::ZERO);

        let err = store.record_addition(&BlobId::new(), 10).unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(store.pending_mutations(), 0);
    }

    #[tokio::test]
    async fn flush_folds_mutations_per_shard() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = started(&metadata);

        let ids: Vec<BlobId> = (0..20).map(|_| BlobId::new()).collect();
        for id in &ids {
            store.record_addition(id, 100).unwrap();
        }
        store.record_deletion(&ids[0], 100).unwrap();

        assert_eq!(store.metrics().await.unwrap(), BlobStoreMetrics::default());
        assert_eq!(store.flush().await, 21);
        assert_eq!(metadata.commit_count(), 1);

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.blob_count, 19);
        assert_eq!(metrics.total_size, 1_900);
    }

    #[tokio::test]
    async fn failed_commit_requeues_mutations() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = started(&metadata);
        store.record_addition(&BlobId::new(), 7).unwrap();
        store.record_addition(&BlobId::new(), 3).unwrap();

        metadata.fail_next_commits(1);
        assert_eq!(store.flush().await, 0);
        assert_eq!(store.pending_mutations(), 2);

        assert_eq!(store.flush().await, 2);
        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.blob_count, 2);
        assert_eq!(metrics.total_size, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_are_spaced_by_delay() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = Arc::new(ShardedCounterMetricsStore::new(
            metadata.clone(),
            "ns",
            Duration::from_secs(1),
        ));
        store.start(&ManualJobScheduler::new(), Duration::from_secs(5));

        store.record_addition(&BlobId::new(), 1).unwrap();
        store.flush().await;
        let first = Instant::now();

        store.record_addition(&BlobId::new(), 1).unwrap();
        store.flush().await;
        assert!(Instant::now() - first >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_flushes_and_rejects_new_mutations() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = started(&metadata);
        store.record_addition(&BlobId::new(), 5).unwrap();

        store.stop().await;

        assert_eq!(store.metrics().await.unwrap().blob_count, 1);
        assert!(store.record_addition(&BlobId::new(), 5).is_err());
    }

    #[tokio::test]
    async fn remove_data_and_sentinel_clear_counters() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let store = started(&metadata);
        store.test().await.unwrap();
        assert!(metadata.is_empty());

        store.record_addition(&BlobId::new(), 5).unwrap();
        store.flush().await;
        assert!(!metadata.is_empty());

        store.remove_data().await.unwrap();
        assert!(metadata.is_empty());
        assert_eq!(store.metrics().await.unwrap(), BlobStoreMetrics::default());
    }
}
