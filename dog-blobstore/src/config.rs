use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::{BlobStoreError, BlobStoreResult};

pub const BUCKET_NAME_KEY: &str = "bucketName";
pub const REGION_KEY: &str = "region";
pub const CREDENTIAL_FILE_PATH_KEY: &str = "credentialFilePath";
pub const CHUNK_SIZE_KEY: &str = "chunkSize";
pub const DELETED_BLOB_QUERY_LIMIT_KEY: &str = "deletedBlobIndex.contentQueryLimit";
pub const METRICS_FLUSH_DELAY_KEY: &str = "metricsStore.flushDelay";
pub const QUOTA_CHECK_INTERVAL_KEY: &str = "quota.warnIntervalSeconds";
pub const QUOTA_MAX_BYTES_KEY: &str = "quota.maxTotalBytes";
pub const ATTRIBUTES_BACKEND_KEY: &str = "attributes.backend";

/// Key renames applied to configurations written by older releases: (legacy, current)
const LEGACY_KEYS: [(&str, &str); 3] = [
    ("bucket", BUCKET_NAME_KEY),
    ("location", REGION_KEY),
    ("credential_file", CREDENTIAL_FILE_PATH_KEY),
];

pub const DEFAULT_DELETED_BLOB_QUERY_LIMIT: usize = 100_000;

/// Configuration for a bucket-backed blob store
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Store instance name; namespaces all persisted metadata
    pub name: String,

    pub bucket_name: String,

    pub region: Option<String>,

    /// Handed to the transport factory, which lives outside this crate
    pub credential_file_path: Option<String>,

    /// Rules for chunked uploads
    pub upload_rules: UploadRules,

    /// Upper bound on ids returned by one soft-delete index listing
    pub deleted_blob_query_limit: usize,

    /// Minimum spacing between two metrics flushes
    pub metrics_flush_delay: Duration,

    /// Cadence of the periodic metrics flush job
    pub metrics_flush_interval: Duration,

    pub quota_check_interval: Duration,

    pub quota: Option<QuotaLimit>,

    /// Where blob attribute records are persisted
    pub attributes_backend: AttributesBackendKind,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            bucket_name: String::new(),
            region: None,
            credential_file_path: None,
            upload_rules: UploadRules::default(),
            deleted_blob_query_limit: DEFAULT_DELETED_BLOB_QUERY_LIMIT,
            metrics_flush_delay: Duration::from_secs(1),
            metrics_flush_interval: Duration::from_secs(5),
            quota_check_interval: Duration::from_secs(60),
            quota: None,
            attributes_backend: AttributesBackendKind::ObjectFile,
        }
    }
}

/// Rules for chunked uploads
#[derive(Debug, Clone, Default)]
pub struct UploadRules {
    /// Bytes per chunk; 0 uploads the whole stream in one put
    pub chunk_size: usize,
}

impl UploadRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_size > 0
    }
}

/// Soft limit on store usage, reported by the quota check job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimit {
    pub max_total_bytes: u64,
}

/// Storage strategy for attribute records, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributesBackendKind {
    /// One properties object next to the content object in the bucket
    #[default]
    ObjectFile,
    /// One entity per blob in the metadata store
    Metadata,
}

impl BlobStoreConfig {
    /// Create a new config with defaults
    pub fn new<N: Into<String>, B: Into<String>>(name: N, bucket_name: B) -> Self {
        Self {
            name: name.into(),
            bucket_name: bucket_name.into(),
            ..Self::default()
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credential_file_path<S: Into<String>>(mut self, path: S) -> Self {
        self.credential_file_path = Some(path.into());
        self
    }

    pub fn with_upload_rules(mut self, rules: UploadRules) -> Self {
        self.upload_rules = rules;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.upload_rules.chunk_size = bytes;
        self
    }

    pub fn with_deleted_blob_query_limit(mut self, limit: usize) -> Self {
        self.deleted_blob_query_limit = limit;
        self
    }

    pub fn with_metrics_flush_delay(mut self, delay: Duration) -> Self {
        self.metrics_flush_delay = delay;
        self
    }

    pub fn with_metrics_flush_interval(mut self, interval: Duration) -> Self {
        self.metrics_flush_interval = interval;
        self
    }

    pub fn with_quota_check_interval(mut self, interval: Duration) -> Self {
        self.quota_check_interval = interval;
        self
    }

    pub fn with_quota(mut self, max_total_bytes: u64) -> Self {
        self.quota = Some(QuotaLimit { max_total_bytes });
        self
    }

    pub fn with_attributes_backend(mut self, backend: AttributesBackendKind) -> Self {
        self.attributes_backend = backend;
        self
    }

    /// Build a config from the string attributes a store is persisted with.
    /// Legacy keys are migrated first.
    pub fn from_attributes<N: Into<String>>(
        name: N,
        attributes: &BTreeMap<String, String>,
    ) -> BlobStoreResult<Self> {
        let attributes = migrate_legacy_attributes(attributes.clone());

        let bucket_name = attributes
            .get(BUCKET_NAME_KEY)
            .cloned()
            .ok_or_else(|| BlobStoreError::invalid(format!("Missing attribute {}", BUCKET_NAME_KEY)))?;

        let mut config = Self::new(name, bucket_name);
        config.region = attributes.get(REGION_KEY).cloned();
        config.credential_file_path = attributes.get(CREDENTIAL_FILE_PATH_KEY).cloned();

        // zero or negative sizes select single-put uploads
        if let Some(size) = parse_number::<i64>(&attributes, CHUNK_SIZE_KEY)? {
            config.upload_rules.chunk_size = usize::try_from(size).unwrap_or(0);
        }
        if let Some(limit) = parse_number::<usize>(&attributes, DELETED_BLOB_QUERY_LIMIT_KEY)? {
            config.deleted_blob_query_limit = limit;
        }
        if let Some(secs) = parse_number::<u64>(&attributes, METRICS_FLUSH_DELAY_KEY)? {
            config.metrics_flush_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_number::<u64>(&attributes, QUOTA_CHECK_INTERVAL_KEY)? {
            config.quota_check_interval = Duration::from_secs(secs);
        }
        if let Some(max_total_bytes) = parse_number::<u64>(&attributes, QUOTA_MAX_BYTES_KEY)? {
            config.quota = Some(QuotaLimit { max_total_bytes });
        }
        if let Some(backend) = attributes.get(ATTRIBUTES_BACKEND_KEY) {
            config.attributes_backend = match backend.as_str() {
                "file" | "object" => AttributesBackendKind::ObjectFile,
                "metadata" | "datastore" => AttributesBackendKind::Metadata,
                other => {
                    return Err(BlobStoreError::invalid(format!(
                        "Unknown attributes backend: {}",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BlobStoreResult<()> {
        if self.name.is_empty() {
            return Err(BlobStoreError::invalid("Store name must not be empty"));
        }
        if self.bucket_name.is_empty() {
            return Err(BlobStoreError::invalid("Bucket name must not be empty"));
        }
        if self.deleted_blob_query_limit == 0 {
            return Err(BlobStoreError::invalid("Deleted blob query limit must be positive"));
        }
        Ok(())
    }
}

/// Rename configuration keys written by older releases. When both the legacy
/// and current key are present the current value wins. Nothing is persisted.
pub fn migrate_legacy_attributes(mut attributes: BTreeMap<String, String>) -> BTreeMap<String, String> {
    for (legacy, current) in LEGACY_KEYS {
        if let Some(value) = attributes.remove(legacy) {
            debug!("migrating legacy configuration key {} -> {}", legacy, current);
            attributes.entry(current.to_string()).or_insert(value);
        }
    }
    attributes
}

fn parse_number<T: std::str::FromStr>(
    attributes: &BTreeMap<String, String>,
    key: &str,
) -> BlobStoreResult<Option<T>> {
    attributes
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| BlobStoreError::invalid(format!("{} must be a number, got {}", key, raw)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn legacy_keys_are_renamed() {
        let migrated = migrate_legacy_attributes(attrs(&[
            ("bucket", "old-bucket"),
            ("location", "us-east1"),
            ("credential_file", "/etc/creds.json"),
        ]));

        assert_eq!(migrated.get(BUCKET_NAME_KEY).map(String::as_str), Some("old-bucket"));
        assert_eq!(migrated.get(REGION_KEY).map(String::as_str), Some("us-east1"));
        assert_eq!(
            migrated.get(CREDENTIAL_FILE_PATH_KEY).map(String::as_str),
            Some("/etc/creds.json")
        );
        assert!(!migrated.contains_key("bucket"));
        assert!(!migrated.contains_key("location"));
    }

    #[test]
    fn current_key_wins_over_legacy() {
        let migrated = migrate_legacy_attributes(attrs(&[("bucket", "old"), ("bucketName", "new")]));
        assert_eq!(migrated.get(BUCKET_NAME_KEY).map(String::as_str), Some("new"));
        assert_eq!(migrated.len(), 1);
    }

    #[test]
    fn recognized_options_are_read() {
        let config = BlobStoreConfig::from_attributes(
            "store-a",
            &attrs(&[
                ("bucket", "b"),
                (CHUNK_SIZE_KEY, "2097152"),
                (DELETED_BLOB_QUERY_LIMIT_KEY, "50"),
                (METRICS_FLUSH_DELAY_KEY, "3"),
                (QUOTA_CHECK_INTERVAL_KEY, "120"),
                (ATTRIBUTES_BACKEND_KEY, "metadata"),
            ]),
        )
        .unwrap();

        assert_eq!(config.bucket_name, "b");
        assert_eq!(config.upload_rules.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.deleted_blob_query_limit, 50);
        assert_eq!(config.metrics_flush_delay, Duration::from_secs(3));
        assert_eq!(config.quota_check_interval, Duration::from_secs(120));
        assert_eq!(config.attributes_backend, AttributesBackendKind::Metadata);
    }

    #[test]
    fn defaults_apply_when_options_absent() {
        let config = BlobStoreConfig::from_attributes("s", &attrs(&[("bucketName", "b")])).unwrap();
        assert!(!config.upload_rules.is_chunked());
        assert_eq!(config.deleted_blob_query_limit, DEFAULT_DELETED_BLOB_QUERY_LIMIT);
        assert_eq!(config.quota_check_interval, Duration::from_secs(60));
        assert_eq!(config.attributes_backend, AttributesBackendKind::ObjectFile);
    }

    #[test]
    fn negative_chunk_size_selects_single_put() {
        let config =
            BlobStoreConfig::from_attributes("s", &attrs(&[("bucketName", "b"), (CHUNK_SIZE_KEY, "-1")])).unwrap();
        assert!(!config.upload_rules.is_chunked());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let result = BlobStoreConfig::from_attributes("s", &attrs(&[("bucketName", "b"), (CHUNK_SIZE_KEY, "big")]));
        assert!(matches!(result, Err(BlobStoreError::Invalid { .. })));
    }

    #[test]
    fn missing_bucket_is_rejected() {
        assert!(BlobStoreConfig::from_attributes("s", &BTreeMap::new()).is_err());
    }
}
