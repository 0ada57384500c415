//! Object-storage multipart upload that tails the growing session file.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{UploadError, UploadOutcome, UploadReporter};
use crate::constants::OBJECT_PART_SIZE;
use crate::session::Metadata;
use crate::stream::{SinkProgress, TailingReader};

/// Builds the object key for a session from its metadata.
pub type KeyGenerator = Arc<dyn Fn(&Metadata) -> String + Send + Sync>;

/// Where one multipart upload goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartTarget {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Canned ACL, e.g. `public-read`.
    pub acl: Option<String>,
    /// Content type stored with the object.
    pub content_type: Option<String>,
}

/// A part the store accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    /// 1-based part number.
    pub part_number: i32,
    /// Entity tag returned for the part.
    pub e_tag: String,
}

/// Multipart upload operations of an object store.
#[async_trait]
pub trait ObjectStorageClient: Send + Sync + fmt::Debug {
    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart_upload(&self, target: &MultipartTarget)
    -> Result<String, UploadError>;

    /// Uploads one part.
    async fn upload_part(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartReceipt, UploadError>;

    /// Completes the upload; returns the object location when the store reports one.
    async fn complete_multipart_upload(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> Result<Option<String>, UploadError>;

    /// Aborts the upload, discarding uploaded parts.
    async fn abort_multipart_upload(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
    ) -> Result<(), UploadError>;
}

/// Server-side object-storage configuration for sessions.
#[derive(Clone)]
pub struct ObjectStorageTarget {
    /// Store client.
    pub client: Arc<dyn ObjectStorageClient>,
    /// Destination bucket.
    pub bucket: String,
    /// Canned ACL applied on create.
    pub acl: Option<String>,
    /// Object key generator.
    pub key_generator: KeyGenerator,
}

impl ObjectStorageTarget {
    /// Targets `bucket` with the default key generator and no ACL.
    pub fn new(client: Arc<dyn ObjectStorageClient>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            acl: None,
            key_generator: Arc::new(default_key),
        }
    }

    /// Sets the canned ACL.
    #[must_use]
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// Replaces the key generator.
    #[must_use]
    pub fn with_key_generator(
        mut self,
        generator: impl Fn(&Metadata) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }
}

impl fmt::Debug for ObjectStorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageTarget")
            .field("client", &self.client)
            .field("bucket", &self.bucket)
            .field("acl", &self.acl)
            .finish_non_exhaustive()
    }
}

/// Default object key: `<16 random alphanumerics>/<filename or "upload">`.
#[must_use]
pub fn default_key(metadata: &Metadata) -> String {
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let filename = metadata.filename.as_deref().unwrap_or("upload");
    format!("{prefix}/{filename}")
}

/// [`ObjectStorageClient`] over the AWS S3 SDK (also S3-compatible stores).
#[derive(Debug, Clone)]
pub struct S3MultipartClient {
    client: aws_sdk_s3::Client,
}

impl S3MultipartClient {
    /// Wraps an existing SDK client.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Builds a client from the environment's AWS configuration.
    ///
    /// `endpoint_url` points at an S3-compatible store (MinIO, R2); path-style
    /// addressing is used for it.
    pub async fn from_env(region: Option<String>, endpoint_url: Option<String>) -> Self {
        let region_provider = match region {
            Some(region) => RegionProviderChain::first_try(aws_config::Region::new(region)),
            None => RegionProviderChain::default_provider(),
        };
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let client = match endpoint_url {
            Some(endpoint) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&config)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                aws_sdk_s3::Client::from_conf(s3_config)
            }
            None => aws_sdk_s3::Client::new(&config),
        };
        Self { client }
    }
}

#[async_trait]
impl ObjectStorageClient for S3MultipartClient {
    async fn create_multipart_upload(
        &self,
        target: &MultipartTarget,
    ) -> Result<String, UploadError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key);
        if let Some(acl) = &target.acl {
            request = request.acl(ObjectCannedAcl::from(acl.as_str()));
        }
        if let Some(content_type) = &target.content_type {
            request = request.content_type(content_type);
        }

        let output = request.send().await.map_err(|e| {
            UploadError::object_storage(
                "create_multipart_upload",
                DisplayErrorContext(&e).to_string(),
            )
        })?;
        output.upload_id().map(str::to_string).ok_or_else(|| {
            UploadError::object_storage("create_multipart_upload", "no upload id returned")
        })
    }

    async fn upload_part(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<PartReceipt, UploadError> {
        let output = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                UploadError::object_storage("upload_part", DisplayErrorContext(&e).to_string())
            })?;
        let e_tag = output.e_tag().map(str::to_string).ok_or_else(|| {
            UploadError::object_storage("upload_part", format!("no ETag for part {part_number}"))
        })?;
        Ok(PartReceipt { part_number, e_tag })
    }

    async fn complete_multipart_upload(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
        parts: &[PartReceipt],
    ) -> Result<Option<String>, UploadError> {
        let completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect::<Vec<_>>();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                UploadError::object_storage(
                    "complete_multipart_upload",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;
        Ok(output.location().map(str::to_string))
    }

    async fn abort_multipart_upload(
        &self,
        target: &MultipartTarget,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| {
                UploadError::object_storage(
                    "abort_multipart_upload",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;
        Ok(())
    }
}

/// Uploads the session file part by part while it is still being written.
#[derive(Debug)]
pub(crate) struct ObjectStorageUpload {
    target: Option<ObjectStorageTarget>,
    metadata: Metadata,
    path: PathBuf,
    progress: watch::Receiver<SinkProgress>,
}

impl ObjectStorageUpload {
    pub(crate) fn new(
        target: Option<ObjectStorageTarget>,
        metadata: Metadata,
        path: PathBuf,
        progress: watch::Receiver<SinkProgress>,
    ) -> Self {
        Self {
            target,
            metadata,
            path,
            progress,
        }
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub(crate) async fn run(self, reporter: &UploadReporter) -> Result<UploadOutcome, UploadError> {
        let target = self.target.ok_or(UploadError::MissingObjectStorageConfig)?;
        let multipart = MultipartTarget {
            bucket: target.bucket.clone(),
            key: (target.key_generator)(&self.metadata),
            acl: target.acl.clone(),
            content_type: self.metadata.content_type.clone(),
        };
        let mut reader = TailingReader::open(&self.path, self.progress)
            .await
            .map_err(|e| UploadError::io(&self.path, e))?;

        let upload_id = target.client.create_multipart_upload(&multipart).await?;
        debug!(bucket = %multipart.bucket, key = %multipart.key, %upload_id, "created multipart upload");

        let uploaded = upload_parts(
            target.client.as_ref(),
            &multipart,
            &upload_id,
            &mut reader,
            reporter,
        )
        .await;
        let (parts, bytes) = match uploaded {
            Ok(uploaded) => uploaded,
            Err(error) => {
                if let Err(abort_error) = target
                    .client
                    .abort_multipart_upload(&multipart, &upload_id)
                    .await
                {
                    warn!(error = %abort_error, %upload_id, "failed to abort multipart upload");
                }
                return Err(match error {
                    PartFailure::Read(source) => UploadError::io(&self.path, source),
                    PartFailure::Upload(error) => error,
                });
            }
        };

        let location = target
            .client
            .complete_multipart_upload(&multipart, &upload_id, &parts)
            .await?;
        info!(
            bucket = %multipart.bucket,
            key = %multipart.key,
            parts = parts.len(),
            bytes,
            "multipart upload completed"
        );

        let url = location
            .clone()
            .unwrap_or_else(|| format!("s3://{}/{}", multipart.bucket, multipart.key));
        Ok(UploadOutcome {
            url: Some(url),
            response: Some(serde_json::json!({
                "bucket": multipart.bucket,
                "key": multipart.key,
                "location": location,
                "parts": parts.len(),
                "bytes": bytes,
            })),
        })
    }
}

enum PartFailure {
    Read(std::io::Error),
    Upload(UploadError),
}

/// Uploads every part; at least one part is sent, even for an empty file.
async fn upload_parts(
    client: &dyn ObjectStorageClient,
    multipart: &MultipartTarget,
    upload_id: &str,
    reader: &mut TailingReader,
    reporter: &UploadReporter,
) -> Result<(Vec<PartReceipt>, u64), PartFailure> {
    let mut parts = Vec::new();
    let mut uploaded: u64 = 0;
    loop {
        let body = reader
            .read_up_to(OBJECT_PART_SIZE)
            .await
            .map_err(PartFailure::Read)?;
        if body.is_empty() && !parts.is_empty() {
            break;
        }
        let len = body.len();
        let part_number = i32::try_from(parts.len() + 1).map_err(|_| {
            PartFailure::Upload(UploadError::object_storage("upload_part", "too many parts"))
        })?;

        let receipt = client
            .upload_part(multipart, upload_id, part_number, body)
            .await
            .map_err(PartFailure::Upload)?;
        parts.push(receipt);
        uploaded += len as u64;
        reporter.uploaded(uploaded);
        debug!(part_number, bytes = len, "uploaded part");

        if len < OBJECT_PART_SIZE {
            break;
        }
    }
    Ok((parts, uploaded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;
    use crate::session::SessionMessage;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct MemoryStore {
        parts: Mutex<BTreeMap<i32, Bytes>>,
        completed: Mutex<Option<Vec<u8>>>,
        aborted: Mutex<bool>,
        fail_part: Option<i32>,
    }

    #[async_trait]
    impl ObjectStorageClient for MemoryStore {
        async fn create_multipart_upload(
            &self,
            _target: &MultipartTarget,
        ) -> Result<String, UploadError> {
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _target: &MultipartTarget,
            _upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<PartReceipt, UploadError> {
            if self.fail_part == Some(part_number) {
                return Err(UploadError::object_storage("upload_part", "slow down"));
            }
            self.parts.lock().unwrap().insert(part_number, body);
            Ok(PartReceipt {
                part_number,
                e_tag: format!("etag-{part_number}"),
            })
        }

        async fn complete_multipart_upload(
            &self,
            target: &MultipartTarget,
            _upload_id: &str,
            parts: &[PartReceipt],
        ) -> Result<Option<String>, UploadError> {
            let stored = self.parts.lock().unwrap();
            let object = parts
                .iter()
                .flat_map(|part| stored[&part.part_number].to_vec())
                .collect();
            *self.completed.lock().unwrap() = Some(object);
            Ok(Some(format!("https://store.example.com/{}/{}", target.bucket, target.key)))
        }

        async fn abort_multipart_upload(
            &self,
            _target: &MultipartTarget,
            _upload_id: &str,
        ) -> Result<(), UploadError> {
            *self.aborted.lock().unwrap() = true;
            Ok(())
        }
    }

    fn target(store: Arc<MemoryStore>) -> ObjectStorageTarget {
        ObjectStorageTarget::new(store, "media")
            .with_acl("public-read")
            .with_key_generator(|metadata| {
                format!("in/{}", metadata.filename.clone().unwrap_or_default())
            })
    }

    #[tokio::test]
    async fn test_missing_target_fails_before_transfer() {
        let dir = TempDir::new().unwrap();
        let (_tx, progress) = watch::channel(SinkProgress::default());
        let upload = ObjectStorageUpload::new(None, Metadata::default(), dir.path().join("tok"), progress);
        let (messages, _rx) = mpsc::unbounded_channel();

        let error = upload.run(&UploadReporter::new(messages)).await.unwrap_err();
        assert!(matches!(error, UploadError::MissingObjectStorageConfig));
    }

    #[tokio::test]
    async fn test_uploads_growing_file_in_parts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        let contents: Vec<u8> = (0..OBJECT_PART_SIZE + 1234).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, b"").unwrap();
        let (progress_tx, progress) = watch::channel(SinkProgress::default());

        let store = Arc::new(MemoryStore::default());
        let upload = ObjectStorageUpload::new(
            Some(target(store.clone())),
            Metadata::new("clip.mp4", "video/mp4"),
            path.clone(),
            progress,
        );
        let (messages, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { upload.run(&UploadReporter::new(messages)).await });

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let mut written = 0;
        for piece in contents.chunks(1024 * 1024) {
            file.write_all(piece).unwrap();
            written += piece.len() as u64;
            progress_tx.send_replace(SinkProgress {
                bytes_written: written,
                closed: false,
            });
            tokio::task::yield_now().await;
        }
        progress_tx.send_replace(SinkProgress {
            bytes_written: contents.len() as u64,
            closed: true,
        });

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome.url.as_deref(),
            Some("https://store.example.com/media/in/clip.mp4")
        );
        assert_eq!(store.parts.lock().unwrap().len(), 2);
        assert_eq!(store.completed.lock().unwrap().as_deref(), Some(&contents[..]));

        let mut last = 0;
        while let Ok(message) = rx.try_recv() {
            if let SessionMessage::UploadProgress { bytes_uploaded } = message {
                last = bytes_uploaded;
            }
        }
        assert_eq!(last, contents.len() as u64);
    }

    #[tokio::test]
    async fn test_empty_file_uploads_single_empty_part() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"").unwrap();
        let (_tx, progress) = watch::channel(SinkProgress {
            bytes_written: 0,
            closed: true,
        });
        let store = Arc::new(MemoryStore::default());
        let upload = ObjectStorageUpload::new(Some(target(store.clone())), Metadata::default(), path, progress);
        let (messages, _rx) = mpsc::unbounded_channel();

        upload.run(&UploadReporter::new(messages)).await.unwrap();
        assert_eq!(store.parts.lock().unwrap().len(), 1);
        assert_eq!(store.completed.lock().unwrap().as_deref(), Some(&[][..]));
    }

    #[tokio::test]
    async fn test_part_failure_aborts_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tok");
        std::fs::write(&path, b"payload").unwrap();
        let (_tx, progress) = watch::channel(SinkProgress {
            bytes_written: 7,
            closed: true,
        });
        let store = Arc::new(MemoryStore {
            fail_part: Some(1),
            ..MemoryStore::default()
        });
        let upload = ObjectStorageUpload::new(Some(target(store.clone())), Metadata::default(), path, progress);
        let (messages, _rx) = mpsc::unbounded_channel();

        let error = upload.run(&UploadReporter::new(messages)).await.unwrap_err();
        assert_eq!(error.kind(), "object_storage");
        assert!(*store.aborted.lock().unwrap());
        assert!(store.completed.lock().unwrap().is_none());
    }
}
