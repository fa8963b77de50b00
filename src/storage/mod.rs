//! Multipart blob storage.
//!
//! [`BlobStore`] is the capability the pipeline consumes: create an upload
//! session, upload numbered parts, complete or abort the session.
//! [`StorageProvider`] implements it on top of `object_store`'s
//! [`MultipartStore`] for S3, GCS and an in-memory backend.

mod gcs;
mod memory;
mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{MultipartId, ObjectStore, RetryConfig};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use gcs::GcsConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;

/// An open multipart upload: the fully qualified object path and the
/// store-assigned session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub path: Path,
    pub id: MultipartId,
}

/// Opaque tag the store returns for an uploaded part (an ETag on S3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTag(pub String);

/// Remote multipart upload capability.
///
/// Part numbers are 1-based. Implementations must not retry on behalf of
/// the caller beyond what their transport already does.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Start a multipart upload for `key`.
    async fn create_multipart_upload(&self, key: &Path) -> Result<UploadSession, StorageError>;

    /// Upload one part and return its tag.
    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<PartTag, StorageError>;

    /// Assemble the object from `parts`, which must be ordered by part number.
    async fn complete_multipart_upload(
        &self,
        session: &UploadSession,
        parts: &[(usize, PartTag)],
    ) -> Result<(), StorageError>;

    /// Discard the session and every part uploaded to it.
    async fn abort_multipart_upload(&self, session: &UploadSession) -> Result<(), StorageError>;
}

/// A shared blob store handle.
pub type BlobStoreRef = Arc<dyn BlobStore>;

/// Storage provider backed by an `object_store` multipart implementation.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) multipart_store: Arc<dyn MultipartStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for the supported backends
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";
const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Memory,
}

static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Gcs, GCS_URL),
        (Backend::Memory, MEMORY_URL),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("Invalid regex pattern")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, regex) in MATCHERS.iter() {
            if let Some(matches) = regex.captures(url) {
                return match backend {
                    Backend::S3 => Ok(Self::parse_s3(&matches)),
                    Backend::Gcs => Ok(Self::parse_gcs(&matches)),
                    Backend::Memory => Ok(Self::parse_memory(&matches)),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let region = std::env::var("AWS_DEFAULT_REGION").ok();

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key_of(matches),
        })
    }

    fn parse_gcs(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        BackendConfig::Gcs(GcsConfig {
            bucket,
            key: key_of(matches),
        })
    }

    fn parse_memory(matches: &regex::Captures) -> Self {
        BackendConfig::Memory(MemoryConfig {
            key: key_of(matches),
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }
}

fn key_of(matches: &regex::Captures) -> Option<Path> {
    matches
        .name("key")
        .map(|m| m.as_str())
        .filter(|key| !key.is_empty())
        .map(Path::from)
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Canonical URL of the bucket (and key prefix, if any).
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        self.object_store
            .get(&self.qualify_path(&path))
            .await
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }
}

/// Retry policy for cloud backends. Retries happen in the transport only;
/// a part that still fails is reported to the shard as is.
pub(crate) fn transport_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        retry_timeout: Duration::from_secs(300),
        ..RetryConfig::default()
    }
}

/// Run a store request, recording its outcome and latency.
async fn instrumented<T>(
    operation: StorageOperation,
    request: impl Future<Output = object_store::Result<T>>,
) -> Result<T, StorageError> {
    let start = Instant::now();
    let result = request.await;

    emit!(StorageRequest {
        operation,
        status: RequestStatus::from_result(&result),
    });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });

    result.context(ObjectStoreSnafu)
}

#[async_trait]
impl BlobStore for StorageProvider {
    async fn create_multipart_upload(&self, key: &Path) -> Result<UploadSession, StorageError> {
        let path = self.qualify_path(key).into_owned();
        let id = instrumented(
            StorageOperation::CreateMultipart,
            self.multipart_store.create_multipart(&path),
        )
        .await?;
        debug!("Created multipart upload {} for {}", id, path);
        Ok(UploadSession { path, id })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<PartTag, StorageError> {
        // object_store numbers parts from zero
        let part_idx = part_number.saturating_sub(1);
        let part_id = instrumented(
            StorageOperation::PutPart,
            self.multipart_store
                .put_part(&session.path, &session.id, part_idx, bytes.into()),
        )
        .await?;
        Ok(PartTag(part_id.content_id))
    }

    async fn complete_multipart_upload(
        &self,
        session: &UploadSession,
        parts: &[(usize, PartTag)],
    ) -> Result<(), StorageError> {
        let part_ids: Vec<PartId> = parts
            .iter()
            .map(|(_, tag)| PartId {
                content_id: tag.0.clone(),
            })
            .collect();
        instrumented(
            StorageOperation::CompleteMultipart,
            self.multipart_store
                .complete_multipart(&session.path, &session.id, part_ids),
        )
        .await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
        instrumented(
            StorageOperation::AbortMultipart,
            self.multipart_store.abort_multipart(&session.path, &session.id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/path/to/data").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("path/to/data")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_s3_endpoint_url_parsing() {
        let config = BackendConfig::parse_url("s3::http://localhost:4566/ingest").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "ingest");
                assert_eq!(s3.key, None);
                if std::env::var("AWS_ENDPOINT").is_err() {
                    assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:4566"));
                }
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_gcs_url_parsing() {
        let config = BackendConfig::parse_url("gs://mybucket/path/to/data").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "mybucket");
                assert_eq!(gcs.key, Some(Path::from("path/to/data")));
            }
            _ => panic!("Expected Gcs config"),
        }
    }

    #[test]
    fn test_memory_url_parsing() {
        assert_eq!(
            BackendConfig::parse_url("memory://").unwrap(),
            BackendConfig::Memory(MemoryConfig { key: None })
        );
        assert_eq!(
            BackendConfig::parse_url("memory://staging").unwrap(),
            BackendConfig::Memory(MemoryConfig {
                key: Some(Path::from("staging"))
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("ftp://example.com/data").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_multipart_roundtrip_through_memory() {
        let storage = StorageProvider::for_url_with_options("memory://prefix", HashMap::new())
            .await
            .unwrap();

        let session = storage
            .create_multipart_upload(&Path::from("out.0.csv.gz"))
            .await
            .unwrap();
        assert_eq!(session.path, Path::from("prefix/out.0.csv.gz"));

        let first = storage
            .upload_part(&session, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let second = storage
            .upload_part(&session, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        storage
            .complete_multipart_upload(&session, &[(1, first), (2, second)])
            .await
            .unwrap();

        let content = storage.get("out.0.csv.gz").await.unwrap();
        assert_eq!(content.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_no_object() {
        let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap();

        let session = storage
            .create_multipart_upload(&Path::from("orphan.csv.gz"))
            .await
            .unwrap();
        storage
            .upload_part(&session, 1, Bytes::from_static(b"partial"))
            .await
            .unwrap();
        storage.abort_multipart_upload(&session).await.unwrap();

        let err = storage.get("orphan.csv.gz").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        ));
    }
}
