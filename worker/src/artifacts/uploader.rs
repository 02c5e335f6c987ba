//! Artifact upload to object storage

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, MultipartUpload, ObjectStore, PutMultipartOpts, PutOptions,
};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRecord;
use crate::errors::UploadError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Files larger than this are streamed as a multipart upload
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Uploads local files into the configured bucket
///
/// Puts overwrite, so uploading the same key twice is harmless.
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    chunk_size: usize,
    max_concurrency: usize,
    retries: u32,
    cooldown: CooldownOptions,
    content_type_attribute: bool,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: 4,
            retries: 0,
            cooldown: CooldownOptions::default(),
            content_type_attribute: true,
        }
    }

    /// Part size for multipart uploads and the single-put threshold
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Retry transient failures up to `retries` times
    pub fn with_retries(mut self, retries: u32, cooldown: CooldownOptions) -> Self {
        self.retries = retries;
        self.cooldown = cooldown;
        self
    }

    /// Store the content type with each object
    ///
    /// Must be off for stores without attribute support (local filesystem).
    pub fn with_content_type_attribute(mut self, enabled: bool) -> Self {
        self.content_type_attribute = enabled;
        self
    }

    pub async fn upload_record(&self, record: &ArtifactRecord) -> Result<u64, UploadError> {
        self.upload(&record.local_path, &record.remote_key, &record.content_type)
            .await
    }

    /// Upload one file, returning the number of bytes stored
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_key: &str,
        content_type: &str,
    ) -> Result<u64, UploadError> {
        let mut attempt = 0;
        loop {
            match self.upload_once(local_path, remote_key, content_type).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    warn!(key = %remote_key, error = %e, "Upload failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn upload_once(
        &self,
        local_path: &Path,
        remote_key: &str,
        content_type: &str,
    ) -> Result<u64, UploadError> {
        let permanent = |message: String| UploadError::Permanent {
            key: remote_key.to_string(),
            message,
        };
        let store_error = |e: object_store::Error| UploadError::from_store(remote_key, e);

        let location = ObjectPath::parse(remote_key).map_err(|e| permanent(e.to_string()))?;
        let mut attributes = Attributes::new();
        if self.content_type_attribute {
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
        }

        let mut file = File::open(local_path)
            .await
            .map_err(|e| permanent(format!("cannot open {}: {e}", local_path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| permanent(format!("cannot stat {}: {e}", local_path.display())))?
            .len();

        if size <= self.chunk_size as u64 {
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data)
                .await
                .map_err(|e| permanent(format!("cannot read {}: {e}", local_path.display())))?;
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store
                .put_opts(&location, Bytes::from(data).into(), opts)
                .await
                .map_err(store_error)?;
        } else {
            let opts = PutMultipartOpts {
                attributes,
                ..Default::default()
            };
            let mut upload = self
                .store
                .put_multipart_opts(&location, opts)
                .await
                .map_err(store_error)?;
            if let Err(e) = self
                .put_parts(&mut file, upload.as_mut(), local_path, remote_key)
                .await
            {
                abort_upload(upload.as_mut(), remote_key).await;
                return Err(e);
            }
            if let Err(e) = upload.complete().await {
                abort_upload(upload.as_mut(), remote_key).await;
                return Err(store_error(e));
            }
            debug!(key = %remote_key, size, "Multipart upload completed");
        }

        info!(key = %remote_key, size, content_type = %content_type, "Uploaded artifact");
        Ok(size)
    }

    /// Read the file in `chunk_size` parts, keeping up to `max_concurrency` in flight
    async fn put_parts(
        &self,
        file: &mut File,
        upload: &mut dyn MultipartUpload,
        local_path: &Path,
        remote_key: &str,
    ) -> Result<(), UploadError> {
        let mut in_flight: FuturesUnordered<object_store::UploadPart> = FuturesUnordered::new();
        loop {
            let mut part = Vec::with_capacity(self.chunk_size);
            let n = (&mut *file)
                .take(self.chunk_size as u64)
                .read_to_end(&mut part)
                .await
                .map_err(|e| UploadError::Permanent {
                    key: remote_key.to_string(),
                    message: format!("cannot read {}: {e}", local_path.display()),
                })?;
            if n == 0 {
                break;
            }
            while in_flight.len() >= self.max_concurrency {
                if let Some(result) = in_flight.next().await {
                    result.map_err(|e| UploadError::from_store(remote_key, e))?;
                }
            }
            in_flight.push(upload.put_part(Bytes::from(part).into()));
            if n < self.chunk_size {
                break;
            }
        }
        while let Some(result) = in_flight.next().await {
            result.map_err(|e| UploadError::from_store(remote_key, e))?;
        }
        Ok(())
    }
}

/// Abort a multipart upload, dropping any parts already stored
async fn abort_upload(upload: &mut dyn MultipartUpload, remote_key: &str) {
    if let Err(e) = upload.abort().await {
        warn!(key = %remote_key, error = %e, "Failed to abort multipart upload");
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, ObjectMeta, PutPayload, PutResult, UploadPart,
    };

    use super::*;

    /// Store that fails the first `failures` writes, then behaves like `InMemory`
    ///
    /// Multipart writes fail on their first part so the upload must be aborted.
    #[derive(Debug)]
    struct FlakyStore {
        inner: InMemory,
        failures: AtomicUsize,
        transient: bool,
        attempts: AtomicUsize,
        aborts: Arc<AtomicUsize>,
    }

    impl FlakyStore {
        fn new(failures: usize, transient: bool) -> Self {
            Self {
                inner: InMemory::new(),
                failures: AtomicUsize::new(failures),
                transient,
                attempts: AtomicUsize::new(0),
                aborts: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn aborts(&self) -> usize {
            self.aborts.load(Ordering::SeqCst)
        }

        /// Count one write and report whether it should fail
        fn next_attempt_fails(&self) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn error(transient: bool) -> object_store::Error {
            if transient {
                object_store::Error::Generic {
                    store: "flaky",
                    source: "connection reset by peer".into(),
                }
            } else {
                object_store::Error::NotImplemented
            }
        }
    }

    impl fmt::Display for FlakyStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FlakyStore")
        }
    }

    #[derive(Debug)]
    struct FailingUpload {
        transient: bool,
        aborts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl MultipartUpload for FailingUpload {
        fn put_part(&mut self, _data: PutPayload) -> UploadPart {
            let err = FlakyStore::error(self.transient);
            Box::pin(async move { Err(err) })
        }

        async fn complete(&mut self) -> object_store::Result<PutResult> {
            Err(FlakyStore::error(self.transient))
        }

        async fn abort(&mut self) -> object_store::Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_opts(
            &self,
            location: &ObjectPath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if self.next_attempt_fails() {
                return Err(Self::error(self.transient));
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &ObjectPath,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            if self.next_attempt_fails() {
                return Ok(Box::new(FailingUpload {
                    transient: self.transient,
                    aborts: self.aborts.clone(),
                }));
            }
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &ObjectPath,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(
            &self,
            from: &ObjectPath,
            to: &ObjectPath,
        ) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn fast_cooldown() -> CooldownOptions {
        CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    async fn stored(store: &InMemory, key: &str) -> (Bytes, Option<String>) {
        let result = store.get(&ObjectPath::from(key)).await.unwrap();
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| v.as_ref().to_string());
        (result.bytes().await.unwrap(), content_type)
    }

    #[tokio::test]
    async fn test_small_file_single_put() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("index.html");
        std::fs::write(&file, "<html></html>").unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = ArtifactUploader::new(store.clone());
        let size = uploader
            .upload(&file, "__outputs/p1/index.html", "text/html")
            .await
            .unwrap();

        assert_eq!(size, 13);
        let (data, content_type) = stored(&store, "__outputs/p1/index.html").await;
        assert_eq!(&data[..], b"<html></html>");
        assert_eq!(content_type.as_deref(), Some("text/html"));
    }

    #[tokio::test]
    async fn test_large_file_streams_in_parts() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("bundle.bin");
        let contents: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&file, &contents).unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = ArtifactUploader::new(store.clone()).with_chunk_size(16 * 1024);
        uploader
            .upload(&file, "__outputs/p1/bundle.bin", "application/octet-stream")
            .await
            .unwrap();

        let (data, _) = stored(&store, "__outputs/p1/bundle.bin").await;
        assert_eq!(data.len(), contents.len());
        assert_eq!(&data[..], &contents[..]);
    }

    #[tokio::test]
    async fn test_reupload_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.js");
        let store = Arc::new(InMemory::new());
        let uploader = ArtifactUploader::new(store.clone());

        std::fs::write(&file, "v1").unwrap();
        uploader.upload(&file, "__outputs/p1/app.js", "text/javascript").await.unwrap();
        std::fs::write(&file, "v2").unwrap();
        uploader.upload(&file, "__outputs/p1/app.js", "text/javascript").await.unwrap();

        let (data, _) = stored(&store, "__outputs/p1/app.js").await;
        assert_eq!(&data[..], b"v2");
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let uploader = ArtifactUploader::new(Arc::new(InMemory::new()));
        let err = uploader
            .upload(&tmp.path().join("gone.txt"), "__outputs/p1/gone.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.key(), "__outputs/p1/gone.txt");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.js");
        std::fs::write(&file, "console.log(1)").unwrap();

        let store = Arc::new(FlakyStore::new(2, true));
        let uploader = ArtifactUploader::new(store.clone()).with_retries(2, fast_cooldown());
        let size = uploader
            .upload(&file, "__outputs/p1/app.js", "text/javascript")
            .await
            .unwrap();

        assert_eq!(size, 14);
        assert_eq!(store.attempts(), 3);
        let result = store.inner.get(&ObjectPath::from("__outputs/p1/app.js")).await;
        assert_eq!(&result.unwrap().bytes().await.unwrap()[..], b"console.log(1)");
    }

    #[tokio::test]
    async fn test_transient_retries_are_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.js");
        std::fs::write(&file, "console.log(1)").unwrap();

        let store = Arc::new(FlakyStore::new(5, true));
        let uploader = ArtifactUploader::new(store.clone()).with_retries(1, fast_cooldown());
        let err = uploader
            .upload(&file, "__outputs/p1/app.js", "text/javascript")
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("app.js");
        std::fs::write(&file, "console.log(1)").unwrap();

        let store = Arc::new(FlakyStore::new(1, false));
        let uploader = ArtifactUploader::new(store.clone()).with_retries(3, fast_cooldown());
        let err = uploader
            .upload(&file, "__outputs/p1/app.js", "text/javascript")
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(store.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_multipart_upload_is_aborted_and_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("bundle.bin");
        let contents: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&file, &contents).unwrap();

        let store = Arc::new(FlakyStore::new(1, true));
        let uploader = ArtifactUploader::new(store.clone())
            .with_chunk_size(16 * 1024)
            .with_retries(1, fast_cooldown());
        let size = uploader
            .upload(&file, "__outputs/p1/bundle.bin", "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(size, 50_000);
        assert_eq!(store.attempts(), 2);
        assert_eq!(store.aborts(), 1);
        let result = store.inner.get(&ObjectPath::from("__outputs/p1/bundle.bin")).await;
        assert_eq!(&result.unwrap().bytes().await.unwrap()[..], &contents[..]);
    }
}
