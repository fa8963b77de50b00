//! Test doubles for pipeline tests.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use object_store::path::Path;
use std::io::Read;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::storage::{BlobStore, PartTag, StorageProvider, UploadSession};

/// Store call that should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    Create,
    UploadPart,
    Complete,
}

/// In-memory store that fails one kind of call for one object key.
#[derive(Debug)]
pub(crate) struct FaultyStore {
    inner: StorageProvider,
    failing_key: String,
    point: FaultPoint,
    aborted: Mutex<Vec<Path>>,
}

impl FaultyStore {
    pub(crate) fn new(failing_key: &str, point: FaultPoint) -> Self {
        Self {
            inner: StorageProvider::in_memory(),
            failing_key: failing_key.to_string(),
            point,
            aborted: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn storage(&self) -> &StorageProvider {
        &self.inner
    }

    pub(crate) fn aborted(&self) -> Vec<Path> {
        self.aborted.lock().unwrap().clone()
    }

    fn check(&self, point: FaultPoint, path: &Path) -> Result<(), StorageError> {
        if point == self.point && path.as_ref().ends_with(&self.failing_key) {
            return Err(StorageError::ObjectStore {
                source: object_store::Error::Generic {
                    store: "faulty",
                    source: format!("injected {point:?} failure for {path}").into(),
                },
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FaultyStore {
    async fn create_multipart_upload(&self, key: &Path) -> Result<UploadSession, StorageError> {
        self.check(FaultPoint::Create, key)?;
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        bytes: Bytes,
    ) -> Result<PartTag, StorageError> {
        self.check(FaultPoint::UploadPart, &session.path)?;
        self.inner.upload_part(session, part_number, bytes).await
    }

    async fn complete_multipart_upload(
        &self,
        session: &UploadSession,
        parts: &[(usize, PartTag)],
    ) -> Result<(), StorageError> {
        self.check(FaultPoint::Complete, &session.path)?;
        self.inner.complete_multipart_upload(session, parts).await
    }

    async fn abort_multipart_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
        self.aborted.lock().unwrap().push(session.path.clone());
        self.inner.abort_multipart_upload(session).await
    }
}

/// Decode a gzip object into its lines.
pub(crate) fn decode_gzip(bytes: &[u8]) -> Vec<String> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text).unwrap();
    text.lines().map(str::to_string).collect()
}
