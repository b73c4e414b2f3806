//! Placement of blobs inside the bucket and inside the metadata store.
//!
//! Permanent blobs are spread over a `vol-NN/chap-NN` tree so that no single
//! prefix grows without bound; temporary blobs live under `tmp/`. The volume
//! segment doubles as the metrics [`ShardKey`].

use uuid::Uuid;

use crate::{BlobId, BlobStoreError, BlobStoreResult};

/// Root prefix for all blob content and attribute objects
pub const CONTENT_PREFIX: &str = "content";

/// Suffix of the object holding blob bytes
pub const BLOB_CONTENT_SUFFIX: &str = ".bytes";

/// Suffix of the object holding blob attributes (object-file backend)
pub const BLOB_ATTRIBUTES_SUFFIX: &str = ".properties";

/// Location segment for temporary blobs
pub const TEMPORARY_LOCATION: &str = "tmp";

/// Prefix applied to the per-store metadata namespace
pub const NAMESPACE_PREFIX: &str = "blobstore-";

const VOLUMES: u32 = 43;
const CHAPTERS: u32 = 47;

/// Coarse subdivision of the blob id space used to spread counter writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey(pub String);

impl ShardKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministically resolves where a blob lives
#[derive(Debug, Clone, Default)]
pub struct BlobLocationResolver;

impl BlobLocationResolver {
    pub fn new() -> Self {
        Self
    }

    /// Bucket-relative location without suffix, e.g. `vol-07/chap-31/<id>` or `tmp/tmp$<uuid>`
    pub fn location(&self, blob_id: &BlobId) -> String {
        if blob_id.is_temporary() {
            return format!("{}/{}", TEMPORARY_LOCATION, blob_id.as_str());
        }

        let hash = crc32fast::hash(blob_id.as_str().as_bytes());
        let volume = hash % VOLUMES + 1;
        let chapter = (hash / VOLUMES) % CHAPTERS + 1;
        format!("vol-{:02}/chap-{:02}/{}", volume, chapter, blob_id.as_str())
    }

    pub fn content_path(&self, blob_id: &BlobId) -> String {
        format!("{}/{}{}", CONTENT_PREFIX, self.location(blob_id), BLOB_CONTENT_SUFFIX)
    }

    pub fn attribute_path(&self, blob_id: &BlobId) -> String {
        format!("{}/{}{}", CONTENT_PREFIX, self.location(blob_id), BLOB_ATTRIBUTES_SUFFIX)
    }

    /// The top-level partition of the blob's location
    pub fn shard_key(&self, blob_id: &BlobId) -> BlobStoreResult<ShardKey> {
        let location = self.location(blob_id);
        match location.split_once('/') {
            Some((shard, _)) if !shard.is_empty() => Ok(ShardKey(shard.to_string())),
            _ => Err(BlobStoreError::invalid(format!(
                "unexpected blob location {} for {}; no '/' separator",
                location, blob_id
            ))),
        }
    }

    /// Recover a blob id from a content or attribute object path
    pub fn blob_id_from_path(&self, path: &str) -> Option<BlobId> {
        let file_name = path.rsplit('/').next()?;
        let id = file_name
            .strip_suffix(BLOB_CONTENT_SUFFIX)
            .or_else(|| file_name.strip_suffix(BLOB_ATTRIBUTES_SUFFIX))?;
        if id.is_empty() {
            return None;
        }
        Some(BlobId::from_string(id.to_string()))
    }
}

/// Store names usable verbatim as a metadata namespace; anything else is hashed
pub fn safe_namespace(name: &str) -> String {
    let verbatim = name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if verbatim {
        name.to_string()
    } else {
        Uuid::new_v3(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

/// Metadata namespace isolating one store instance from others sharing the account
pub fn store_namespace(store_name: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, safe_namespace(store_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_blobs_land_in_volume_tree() {
        let resolver = BlobLocationResolver::new();
        let id = BlobId::from("5c7e4b1a-0000-4000-8000-000000000001");
        let location = resolver.location(&id);

        let parts: Vec<&str> = location.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("vol-"));
        assert!(parts[1].starts_with("chap-"));
        assert_eq!(parts[2], id.as_str());
        assert_eq!(resolver.location(&id), location);
        assert_eq!(resolver.shard_key(&id).unwrap().as_str(), parts[0]);
    }

    #[test]
    fn temporary_blobs_share_tmp_shard() {
        let resolver = BlobLocationResolver::new();
        let id = BlobId::new_temporary();

        assert_eq!(resolver.location(&id), format!("tmp/{}", id));
        assert_eq!(resolver.shard_key(&id).unwrap().as_str(), "tmp");
        assert_eq!(
            resolver.content_path(&id),
            format!("content/tmp/{}.bytes", id)
        );
    }

    #[test]
    fn blob_id_recovered_from_paths() {
        let resolver = BlobLocationResolver::new();
        let id = BlobId::new();

        assert_eq!(resolver.blob_id_from_path(&resolver.content_path(&id)), Some(id.clone()));
        assert_eq!(resolver.blob_id_from_path(&resolver.attribute_path(&id)), Some(id));
        assert_eq!(resolver.blob_id_from_path("content/metadata.json"), None);
    }

    #[test]
    fn namespaces_hash_unsafe_names() {
        assert_eq!(store_namespace("default"), "blobstore-default");

        let hashed = safe_namespace("my store/with spaces");
        assert_ne!(hashed, "my store/with spaces");
        assert_eq!(hashed, safe_namespace("my store/with spaces"));
        assert!(Uuid::parse_str(&hashed).is_ok());
    }
}
