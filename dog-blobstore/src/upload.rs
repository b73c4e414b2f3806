use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::{ObjectRef, ObjectStore};
use crate::{BlobStoreError, BlobStoreResult, ByteStream, UploadRules};

/// Marker embedded in the names of intermediate chunk objects
pub const CHUNK_MARKER: &str = ".chunk";

/// Writes a byte stream of unknown length to one object
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        store: &Arc<dyn ObjectStore>,
        destination: &str,
        stream: ByteStream,
    ) -> BlobStoreResult<ObjectRef>;

    fn stats(&self) -> UploadStats {
        UploadStats::default()
    }

    /// Wait for background work left behind by earlier uploads
    async fn drain(&self) {}
}

/// Pick the uploader the rules call for
pub fn uploader_for(rules: &UploadRules) -> Arc<dyn Uploader> {
    if rules.is_chunked() {
        Arc::new(MultipartUploader::new(rules.chunk_size))
    } else {
        Arc::new(SinglepartUploader)
    }
}

/// Counters describing multipart upload behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploads: u64,
    pub chunks_uploaded: u64,
    pub max_chunks: u64,
    pub compose_limit_hits: u64,
}

/// One put for the whole stream
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglepartUploader;

#[async_trait]
impl Uploader for SinglepartUploader {
    async fn upload(
        &self,
        store: &Arc<dyn ObjectStore>,
        destination: &str,
        stream: ByteStream,
    ) -> BlobStoreResult<ObjectRef> {
        store
            .put_stream(destination, stream)
            .await
            .map_err(|e| BlobStoreError::upload(destination, e))
    }
}

/// Uploads fixed-size chunks concurrently and composes them into the destination.
///
/// The first chunk is written directly to the destination path, so a stream
/// that fits in one chunk needs no compose request. When the compose limit is
/// reached the rest of the stream becomes the final part, whatever its size.
pub struct MultipartUploader {
    chunk_size: usize,
    cleanup: TaskTracker,
    uploads: AtomicU64,
    chunks_uploaded: AtomicU64,
    max_chunks: AtomicU64,
    compose_limit_hits: AtomicU64,
}

impl MultipartUploader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cleanup: TaskTracker::new(),
            uploads: AtomicU64::new(0),
            chunks_uploaded: AtomicU64::new(0),
            max_chunks: AtomicU64::new(0),
            compose_limit_hits: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Wait for scheduled chunk deletions to finish (for testing and shutdown)
    pub async fn drain_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }

    async fn upload_parts(
        &self,
        store: &Arc<dyn ObjectStore>,
        destination: &str,
        stream: ByteStream,
        chunk_names: &mut Vec<String>,
    ) -> BlobStoreResult<ObjectRef> {
        let limit = store.compose_limit().max(1);
        let upload_tag = Uuid::new_v4().simple().to_string();
        let mut reader = ChunkReader::new(stream, self.chunk_size);
        let mut pending = JoinSet::new();
        let mut first = None;
        let mut read_error = None;

        for part_number in 1..=limit {
            let chunk_name = chunk_name(destination, part_number, &upload_tag);

            if part_number == limit {
                if part_number > 1 {
                    match reader.has_remaining().await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            read_error = Some(e);
                            break;
                        }
                    }
                }
                debug!(
                    "Upload for {} hit the compose limit of {} parts; consider a larger chunk size than {}",
                    destination, limit, self.chunk_size
                );
                self.compose_limit_hits.fetch_add(1, Ordering::Relaxed);

                let tail = reader.into_remaining();
                chunk_names.push(chunk_name.clone());
                let store = store.clone();
                pending.spawn(async move { store.put_stream(&chunk_name, tail).await });
                break;
            }

            let chunk = match reader.next_chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            };
            if chunk.is_empty() && part_number > 1 {
                break;
            }
            chunk_names.push(chunk_name.clone());

            if part_number == 1 {
                first = Some(store.put(&chunk_name, chunk).await?);
            } else {
                debug!("Uploading chunk {} for {} of {} bytes", part_number, destination, chunk.len());
                let store = store.clone();
                pending.spawn(async move { store.put(&chunk_name, chunk).await });
            }
        }

        // join barrier: parts already in flight settle even when the source failed
        let mut failure = None;
        while let Some(joined) = pending.join_next().await {
            let outcome = joined.map_err(|e| BlobStoreError::backend_message(format!("chunk task failed: {}", e)));
            if let Err(e) = outcome.and_then(|put| put) {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = read_error {
            return Err(e.into());
        }
        if let Some(e) = failure {
            return Err(e);
        }

        match (chunk_names.len(), first) {
            (1, Some(single)) => Ok(single),
            _ => {
                debug!("Chunk uploads for {} completed, composing {} parts", destination, chunk_names.len());
                store.compose(destination, chunk_names.as_slice()).await
            }
        }
    }

    fn schedule_cleanup(&self, store: &Arc<dyn ObjectStore>, chunk_names: Vec<String>) {
        let intermediate: Vec<String> = chunk_names
            .into_iter()
            .filter(|name| name.contains(CHUNK_MARKER))
            .collect();
        if intermediate.is_empty() {
            return;
        }

        let store = store.clone();
        self.cleanup.spawn(async move {
            for name in intermediate {
                match store.delete(&name).await {
                    Ok(_) => debug!("Removed chunk {}", name),
                    Err(e) => warn!("Failed to remove chunk {}: {}", name, e),
                }
            }
        });
    }

    fn record_chunks(&self, count: usize) {
        let count = count as u64;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.chunks_uploaded.fetch_add(count, Ordering::Relaxed);
        self.max_chunks.fetch_max(count, Ordering::Relaxed);
    }
}

#[async_trait]
impl Uploader for MultipartUploader {
    #[instrument(skip(self, store, stream), fields(chunk_size = self.chunk_size))]
    async fn upload(
        &self,
        store: &Arc<dyn ObjectStore>,
        destination: &str,
        stream: ByteStream,
    ) -> BlobStoreResult<ObjectRef> {
        info!("Starting multipart upload for {}", destination);

        let mut chunk_names = Vec::new();
        let result = self
            .upload_parts(store, destination, stream, &mut chunk_names)
            .await;

        self.record_chunks(chunk_names.len());
        self.schedule_cleanup(store, chunk_names);

        result.map_err(|e| BlobStoreError::upload(destination, e))
    }

    fn stats(&self) -> UploadStats {
        UploadStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            chunks_uploaded: self.chunks_uploaded.load(Ordering::Relaxed),
            max_chunks: self.max_chunks.load(Ordering::Relaxed),
            compose_limit_hits: self.compose_limit_hits.load(Ordering::Relaxed),
        }
    }

    async fn drain(&self) {
        self.drain_cleanup().await;
    }
}

/// Object name of part `part_number`; part 1 is the destination itself.
/// `upload_tag` keeps parts of successive uploads to one destination apart.
pub fn chunk_name(destination: &str, part_number: usize, upload_tag: &str) -> String {
    if part_number == 1 {
        destination.to_string()
    } else {
        format!("{}{}{}.{}", destination, CHUNK_MARKER, part_number, upload_tag)
    }
}

/// Reads a byte stream in fixed-size pieces regardless of how the source frames it
struct ChunkReader {
    stream: ByteStream,
    buffer: BytesMut,
    chunk_size: usize,
    exhausted: bool,
}

impl ChunkReader {
    fn new(stream: ByteStream, chunk_size: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            chunk_size,
            exhausted: false,
        }
    }

    async fn fill(&mut self, want: usize) -> std::io::Result<()> {
        while self.buffer.len() < want && !self.exhausted {
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Up to `chunk_size` bytes; shorter only at end of stream, empty once drained
    async fn next_chunk(&mut self) -> std::io::Result<Bytes> {
        self.fill(self.chunk_size).await?;
        let take = self.chunk_size.min(self.buffer.len());
        Ok(self.buffer.split_to(take).freeze())
    }

    async fn has_remaining(&mut self) -> std::io::Result<bool> {
        self.fill(1).await?;
        Ok(!self.buffer.is_empty())
    }

    fn into_remaining(self) -> ByteStream {
        let Self { mut stream, buffer, .. } = self;
        Box::pin(async_stream::stream! {
            if !buffer.is_empty() {
                yield Ok(buffer.freeze());
            }
            while let Some(item) = stream.next().await {
                yield item;
            }
        })
    }
}

/// Running SHA-1 and byte count of a stream as it is consumed
#[derive(Clone, Default)]
pub struct ContentMeter {
    state: Arc<Mutex<MeterState>>,
}

#[derive(Default)]
struct MeterState {
    hasher: Sha1,
    size: u64,
}

impl ContentMeter {
    /// Wrap `stream` so every byte passing through is hashed and counted
    pub fn wrap(stream: ByteStream) -> (ByteStream, ContentMeter) {
        let meter = ContentMeter::default();
        let inner = meter.clone();
        let metered = stream.inspect_ok(move |bytes| {
            let mut state = inner.state.lock();
            state.hasher.update(bytes);
            state.size += bytes.len() as u64;
        });
        (Box::pin(metered), meter)
    }

    /// Hex SHA-1 and size of everything seen so far
    pub fn snapshot(&self) -> (String, u64) {
        let state = self.state.lock();
        (hex::encode(state.hasher.clone().finalize()), state.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use std::time::Duration;

    fn framed(data: &[u8], frame: usize) -> ByteStream {
        let frames: Vec<std::io::Result<Bytes>> = data
            .chunks(frame.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(frames))
    }

    #[tokio::test]
    async fn chunk_reader_reframes_input() {
        let data: Vec<u8> = (0..25u8).collect();
        let mut reader = ChunkReader::new(framed(&data, 7), 10);

        assert_eq!(reader.next_chunk().await.unwrap().len(), 10);
        assert_eq!(reader.next_chunk().await.unwrap().len(), 10);
        assert_eq!(reader.next_chunk().await.unwrap(), Bytes::copy_from_slice(&data[20..]));
        assert!(reader.next_chunk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_stream_needs_no_compose() {
        let memory = Arc::new(MemoryObjectStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(16);

        let object = uploader.upload(&store, "dest", framed(b"tiny", 4)).await.unwrap();

        assert_eq!(object.size_bytes, 4);
        assert_eq!(memory.compose_count(), 0);
        assert_eq!(uploader.stats().max_chunks, 1);
    }

    #[tokio::test]
    async fn empty_stream_yields_empty_object() {
        let memory = Arc::new(MemoryObjectStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(16);

        let object = uploader.upload(&store, "dest", framed(b"", 1)).await.unwrap();

        assert_eq!(object.size_bytes, 0);
        assert_eq!(memory.read("dest").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn chunks_are_composed_and_cleaned() {
        let memory = Arc::new(MemoryObjectStore::new());
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(10);
        let data: Vec<u8> = (0..35u8).collect();

        uploader.upload(&store, "dest", framed(&data, 3)).await.unwrap();
        uploader.drain_cleanup().await;

        assert_eq!(memory.read("dest").unwrap(), Bytes::from(data));
        assert_eq!(memory.compose_count(), 1);
        assert_eq!(memory.paths(), vec!["dest".to_string()]);
        assert_eq!(uploader.stats().chunks_uploaded, 4);
    }

    #[tokio::test]
    async fn failed_part_is_wrapped_and_chunks_still_cleaned() {
        let memory = Arc::new(MemoryObjectStore::new());
        memory.fail_puts_containing(".chunk3");
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(4);

        let result = uploader.upload(&store, "dest", framed(&[7u8; 20], 20)).await;
        uploader.drain_cleanup().await;

        assert!(matches!(result, Err(BlobStoreError::Upload { .. })));
        assert!(memory.paths().iter().all(|p| !p.contains(CHUNK_MARKER)));
    }

    #[tokio::test]
    async fn source_error_lets_inflight_parts_finish() {
        let memory = Arc::new(MemoryObjectStore::new());
        memory.set_put_delay(Duration::from_millis(20));
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(4);

        let frames: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcdefghijkl")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "source reset")),
        ];
        let err = uploader
            .upload(&store, "dest", Box::pin(futures::stream::iter(frames)))
            .await
            .unwrap_err();

        assert!(matches!(err, BlobStoreError::Upload { .. }));
        assert!(err.to_string().contains("source reset"));
        let landed = memory.paths().iter().filter(|p| p.contains(CHUNK_MARKER)).count();
        assert_eq!(landed, 2);

        uploader.drain_cleanup().await;
        assert!(memory.paths().iter().all(|p| !p.contains(CHUNK_MARKER)));
    }

    #[tokio::test]
    async fn cleanup_failures_do_not_fail_upload() {
        let memory = Arc::new(MemoryObjectStore::new());
        memory.fail_deletes_containing(CHUNK_MARKER);
        let store: Arc<dyn ObjectStore> = memory.clone();
        let uploader = MultipartUploader::new(4);

        let object = uploader.upload(&store, "dest", framed(&[1u8; 9], 9)).await.unwrap();
        uploader.drain_cleanup().await;

        assert_eq!(object.size_bytes, 9);
        assert!(memory.paths().iter().any(|p| p.starts_with("dest.chunk2.")));
    }

    #[tokio::test]
    async fn meter_hashes_consumed_bytes() {
        let (stream, meter) = ContentMeter::wrap(framed(b"hello world", 3));
        let _: Vec<_> = stream.collect().await;

        let (sha1, size) = meter.snapshot();
        assert_eq!(size, 11);
        assert_eq!(sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }
}
