use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use crate::config::AttributesBackendKind;
use crate::location::BlobLocationResolver;
use crate::store::{read_object, EntityKey, FieldValue, Fields, MetadataStore, ObjectStore};
use crate::{BlobAttributes, BlobId, BlobStoreResult};

/// Entity kind of attribute records in the metadata backend
pub const ATTRIBUTES_KIND: &str = "BlobAttributes";

/// Persistence of per-blob attribute records.
///
/// `store` overwrites the whole record; callers serialize read-modify-write
/// cycles on the blob id themselves.
#[async_trait]
pub trait AttributesStore: Send + Sync {
    /// The record for `blob_id`, or `None` when there is none
    async fn load(&self, blob_id: &BlobId) -> BlobStoreResult<Option<BlobAttributes>>;

    async fn store(&self, blob_id: &BlobId, attributes: &BlobAttributes) -> BlobStoreResult<()>;

    async fn exists(&self, blob_id: &BlobId) -> BlobStoreResult<bool>;

    /// Remove the record; returns whether one existed
    async fn delete(&self, blob_id: &BlobId) -> BlobStoreResult<bool>;
}

/// Build the attributes store selected in configuration
pub fn attributes_store_for(
    kind: AttributesBackendKind,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    namespace: &str,
) -> Arc<dyn AttributesStore> {
    match kind {
        AttributesBackendKind::ObjectFile => Arc::new(ObjectFileAttributesStore::new(objects)),
        AttributesBackendKind::Metadata => Arc::new(MetadataAttributesStore::new(metadata, namespace)),
    }
}

/// One attribute object next to each content object in the bucket
pub struct ObjectFileAttributesStore {
    objects: Arc<dyn ObjectStore>,
    resolver: BlobLocationResolver,
}

impl ObjectFileAttributesStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            resolver: BlobLocationResolver::new(),
        }
    }
}

#[async_trait]
impl AttributesStore for ObjectFileAttributesStore {
    async fn load(&self, blob_id: &BlobId) -> BlobStoreResult<Option<BlobAttributes>> {
        let path = self.resolver.attribute_path(blob_id);
        let raw = match read_object(self.objects.as_ref(), &path).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!("Failed to load attributes {}: {}", path, e);
                return Err(e.for_blob(blob_id.as_str()));
            }
        };
        let fields: BTreeMap<String, String> = serde_json::from_slice(&raw)?;
        BlobAttributes::from_fields(&fields).map(Some)
    }

    async fn store(&self, blob_id: &BlobId, attributes: &BlobAttributes) -> BlobStoreResult<()> {
        let encoded = serde_json::to_vec(&attributes.to_fields())?;
        self.objects
            .put(&self.resolver.attribute_path(blob_id), Bytes::from(encoded))
            .await
            .map(|_| ())
    }

    async fn exists(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        Ok(self
            .objects
            .get(&self.resolver.attribute_path(blob_id))
            .await?
            .is_some())
    }

    async fn delete(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        self.objects.delete(&self.resolver.attribute_path(blob_id)).await
    }
}

/// One entity per blob in the store's metadata namespace
pub struct MetadataAttributesStore {
    metadata: Arc<dyn MetadataStore>,
    namespace: String,
}

impl MetadataAttributesStore {
    pub fn new<S: Into<String>>(metadata: Arc<dyn MetadataStore>, namespace: S) -> Self {
        Self {
            metadata,
            namespace: namespace.into(),
        }
    }

    fn key(&self, blob_id: &BlobId) -> EntityKey {
        EntityKey::new(self.namespace.as_str(), ATTRIBUTES_KIND, blob_id.as_str())
    }
}

#[async_trait]
impl AttributesStore for MetadataAttributesStore {
    async fn load(&self, blob_id: &BlobId) -> BlobStoreResult<Option<BlobAttributes>> {
        let entity = match self.metadata.get(&self.key(blob_id)).await {
            Ok(entity) => entity,
            Err(e) => {
                error!("Failed to load attributes for {}: {}", blob_id, e);
                return Err(e.for_blob(blob_id.as_str()));
            }
        };
        let Some(entity) = entity else {
            return Ok(None);
        };

        let fields: BTreeMap<String, String> = entity
            .into_iter()
            .filter_map(|(name, value)| match value {
                FieldValue::String(v) => Some((name, v)),
                FieldValue::Integer(v) => Some((name, v.to_string())),
                FieldValue::Bool(v) => Some((name, v.to_string())),
            })
            .collect();
        BlobAttributes::from_fields(&fields).map(Some)
    }

    async fn store(&self, blob_id: &BlobId, attributes: &BlobAttributes) -> BlobStoreResult<()> {
        let fields: Fields = attributes
            .to_fields()
            .into_iter()
            .map(|(name, value)| (name, FieldValue::String(value)))
            .collect();
        self.metadata.put(&self.key(blob_id), fields).await
    }

    async fn exists(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        Ok(self.metadata.get(&self.key(blob_id)).await?.is_some())
    }

    async fn delete(&self, blob_id: &BlobId) -> BlobStoreResult<bool> {
        let key = self.key(blob_id);
        let existed = self.metadata.get(&key).await?.is_some();
        if existed {
            self.metadata.delete(std::slice::from_ref(&key)).await?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMetadataStore, MemoryObjectStore};
    use crate::{ContentMetrics, Headers, BLOB_NAME_HEADER};

    fn sample() -> BlobAttributes {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "report.pdf".to_string());
        BlobAttributes::new(headers, ContentMetrics::now("da39a3ee5e6b4b0d3255bfef95601890afd80709", 0))
    }

    fn backends() -> Vec<(Arc<MemoryObjectStore>, Arc<dyn AttributesStore>)> {
        [AttributesBackendKind::ObjectFile, AttributesBackendKind::Metadata]
            .into_iter()
            .map(|kind| {
                let objects = Arc::new(MemoryObjectStore::new());
                let metadata = Arc::new(MemoryMetadataStore::new());
                let store = attributes_store_for(kind, objects.clone(), metadata, "blobstore-test");
                (objects, store)
            })
            .collect()
    }

    #[tokio::test]
    async fn absent_record_is_not_an_error() {
        for (_, store) in backends() {
            let id = BlobId::new();
            assert!(store.load(&id).await.unwrap().is_none());
            assert!(!store.exists(&id).await.unwrap());
            assert!(!store.delete(&id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn store_overwrites_whole_record() {
        for (_, store) in backends() {
            let id = BlobId::new();
            let mut attributes = sample();
            store.store(&id, &attributes).await.unwrap();

            attributes.mark_deleted("user request");
            store.store(&id, &attributes).await.unwrap();

            let loaded = store.load(&id).await.unwrap().unwrap();
            assert_eq!(loaded, attributes);
            assert!(store.exists(&id).await.unwrap());
            assert!(store.delete(&id).await.unwrap());
            assert!(store.load(&id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn object_backend_writes_next_to_content() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = ObjectFileAttributesStore::new(objects.clone());
        let id = BlobId::new();

        store.store(&id, &sample()).await.unwrap();

        assert!(objects.contains(&BlobLocationResolver::new().attribute_path(&id)));
    }

    #[tokio::test]
    async fn load_failures_carry_blob_id() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = ObjectFileAttributesStore::new(objects.clone());
        objects.set_unavailable(true);

        let err = store.load(&BlobId::from("abc")).await.unwrap_err();
        assert!(matches!(err, crate::BlobStoreError::Storage { ref blob_id, .. } if blob_id == "abc"));
    }
}
