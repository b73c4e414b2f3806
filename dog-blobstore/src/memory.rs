//! In-memory object and metadata stores for testing and development.
//!
//! Both stores expose a handful of helpers for steering failures into the
//! paths a real bucket or metadata service would take.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use parking_lot::RwLock;

use crate::store::{
    BoxStream, Entity, EntityKey, Fields, MetadataStore, ObjectRef, ObjectStore, Projection, Query,
};
use crate::{BlobStoreError, BlobStoreResult, ByteStream};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    updated_at: DateTime<Utc>,
}

impl StoredObject {
    fn to_ref(&self, path: &str) -> ObjectRef {
        ObjectRef {
            path: path.to_string(),
            size_bytes: self.data.len() as u64,
            updated_at: self.updated_at,
        }
    }
}

/// In-memory bucket
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,

    /// Puts to paths containing any of these fragments fail
    failing_puts: RwLock<Vec<String>>,

    /// Deletes of paths containing any of these fragments fail
    failing_deletes: RwLock<Vec<String>>,

    failing_composes: AtomicUsize,
    permissions_denied: AtomicBool,
    unavailable: AtomicBool,

    /// Latency added to every put, in milliseconds
    put_delay_ms: AtomicU64,

    put_calls: AtomicUsize,
    compose_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> BlobStoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlobStoreError::backend_message("bucket unavailable"));
        }
        Ok(())
    }

    fn check_put(&self, path: &str) -> BlobStoreResult<()> {
        self.check_available()?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_puts.read().iter().any(|f| path.contains(f.as_str())) {
            return Err(BlobStoreError::backend_message(format!("injected put failure for {}", path)));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn insert(&self, path: &str, data: Bytes) -> ObjectRef {
        let object = StoredObject {
            data,
            updated_at: Utc::now(),
        };
        let object_ref = object.to_ref(path);
        self.objects.write().insert(path.to_string(), object);
        object_ref
    }

    /// Make subsequent puts to paths containing `fragment` fail
    pub fn fail_puts_containing<S: Into<String>>(&self, fragment: S) {
        self.failing_puts.write().push(fragment.into());
    }

    /// Make subsequent deletes of paths containing `fragment` fail
    pub fn fail_deletes_containing<S: Into<String>>(&self, fragment: S) {
        self.failing_deletes.write().push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.failing_puts.write().clear();
        self.failing_deletes.write().clear();
        self.failing_composes.store(0, Ordering::SeqCst);
    }

    /// Fail the next `count` compose requests
    pub fn fail_next_composes(&self, count: usize) {
        self.failing_composes.store(count, Ordering::SeqCst);
    }

    /// Make every put take at least `delay` before it lands
    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_permissions_denied(&self, denied: bool) {
        self.permissions_denied.store(denied, Ordering::SeqCst);
    }

    /// Fail every request until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Raw content of an object (for testing)
    pub fn read(&self, path: &str) -> Option<Bytes> {
        self.objects.read().get(path).map(|o| o.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Backdate an object's modification time (for testing)
    pub fn set_updated_at(&self, path: &str, updated_at: DateTime<Utc>) {
        if let Some(object) = self.objects.write().get_mut(path) {
            object.updated_at = updated_at;
        }
    }

    pub fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn compose_count(&self) -> usize {
        self.compose_calls.load(Ordering::SeqCst)
    }

    /// Delete requests received, whether or not the object existed
    pub fn delete_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> BlobStoreResult<ObjectRef> {
        self.check_put(path)?;
        self.simulate_latency().await;
        Ok(self.insert(path, data))
    }

    async fn put_stream(&self, path: &str, stream: ByteStream) -> BlobStoreResult<ObjectRef> {
        self.check_put(path)?;
        self.simulate_latency().await;
        let buffer = stream
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(self.insert(path, buffer.freeze()))
    }

    async fn get(&self, path: &str) -> BlobStoreResult<Option<ObjectRef>> {
        self.check_available()?;
        Ok(self.objects.read().get(path).map(|o| o.to_ref(path)))
    }

    async fn open(&self, path: &str) -> BlobStoreResult<Option<ByteStream>> {
        self.check_available()?;
        let data = self.objects.read().get(path).map(|o| o.data.clone());
        Ok(data.map(|data| {
            let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
            stream
        }))
    }

    async fn delete(&self, path: &str) -> BlobStoreResult<bool> {
        self.check_available()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.read().iter().any(|f| path.contains(f.as_str())) {
            return Err(BlobStoreError::backend_message(format!("injected delete failure for {}", path)));
        }
        Ok(self.objects.write().remove(path).is_some())
    }

    async fn list(&self, prefix: &str) -> BlobStoreResult<Vec<ObjectRef>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, o)| o.to_ref(path))
            .collect())
    }

    async fn compose(&self, destination: &str, parts: &[String]) -> BlobStoreResult<ObjectRef> {
        self.check_available()?;
        self.compose_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_composes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_composes.store(remaining - 1, Ordering::SeqCst);
            return Err(BlobStoreError::backend_message("injected compose failure"));
        }
        if parts.len() > self.compose_limit() {
            return Err(BlobStoreError::invalid(format!(
                "compose accepts at most {} parts, got {}",
                self.compose_limit(),
                parts.len()
            )));
        }

        let mut buffer = BytesMut::new();
        {
            let objects = self.objects.read();
            for part in parts {
                let object = objects
                    .get(part)
                    .ok_or_else(|| BlobStoreError::backend_message(format!("compose source {} missing", part)))?;
                buffer.extend_from_slice(&object.data);
            }
        }
        Ok(self.insert(destination, buffer.freeze()))
    }

    async fn copy(&self, source: &str, destination: &str) -> BlobStoreResult<ObjectRef> {
        self.check_available()?;
        let data = self
            .objects
            .read()
            .get(source)
            .map(|o| o.data.clone())
            .ok_or_else(|| BlobStoreError::not_found(source))?;
        Ok(self.insert(destination, data))
    }

    async fn test_permissions(&self, _path: &str, _permissions: &[&str]) -> BlobStoreResult<bool> {
        self.check_available()?;
        Ok(!self.permissions_denied.load(Ordering::SeqCst))
    }
}

/// In-memory metadata store with all-or-nothing commits
#[derive(Default)]
pub struct MemoryMetadataStore {
    entities: Arc<RwLock<BTreeMap<EntityKey, Fields>>>,
    failing_commits: AtomicUsize,
    failing_puts: AtomicUsize,
    unavailable: AtomicBool,
    commit_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> BlobStoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlobStoreError::backend_message("metadata store unavailable"));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Roll back the next `count` commits
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Entities of one kind in one namespace (for testing)
    pub fn entities(&self, namespace: &str, kind: &str) -> Vec<(EntityKey, Fields)> {
        self.entities
            .read()
            .iter()
            .filter(|(k, _)| k.namespace == namespace && k.kind == kind)
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, key: &EntityKey, fields: Fields) -> BlobStoreResult<()> {
        self.check_available()?;
        if Self::take_failure(&self.failing_puts) {
            return Err(BlobStoreError::backend_message(format!("injected put failure for {}", key.name)));
        }
        self.entities.write().insert(key.clone(), fields);
        Ok(())
    }

    async fn get(&self, key: &EntityKey) -> BlobStoreResult<Option<Fields>> {
        self.check_available()?;
        Ok(self.entities.read().get(key).cloned())
    }

    async fn delete(&self, keys: &[EntityKey]) -> BlobStoreResult<()> {
        self.check_available()?;
        if keys.len() > self.max_delete_batch() {
            return Err(BlobStoreError::invalid(format!(
                "batch delete accepts at most {} keys, got {}",
                self.max_delete_batch(),
                keys.len()
            )));
        }
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut entities = self.entities.write();
        for key in keys {
            entities.remove(key);
        }
        Ok(())
    }

    async fn query(&self, query: Query) -> BlobStoreResult<BoxStream<BlobStoreResult<Entity>>> {
        self.check_available()?;
        let rows: Vec<BlobStoreResult<Entity>> = self
            .entities
            .read()
            .iter()
            .filter(|(k, _)| k.namespace == query.namespace && k.kind == query.kind)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(key, fields)| {
                let fields = match &query.projection {
                    Projection::KeysOnly => Fields::new(),
                    Projection::Fields(names) => fields
                        .iter()
                        .filter(|(name, _)| names.contains(name))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                    Projection::Full => fields.clone(),
                };
                Ok(Entity {
                    key: key.clone(),
                    fields,
                })
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(rows)))
    }

    async fn commit(&self, writes: Vec<(EntityKey, Fields)>) -> BlobStoreResult<()> {
        self.check_available()?;
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_commits) {
            return Err(BlobStoreError::backend_message("transaction rolled back"));
        }
        let mut entities = self.entities.write();
        for (key, fields) in writes {
            entities.insert(key, fields);
        }
        Ok(())
    }
}
