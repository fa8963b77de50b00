//! S3 storage backend.
//!
//! Plain `s3://bucket/prefix` URLs go to AWS; `s3::http://host:port/bucket`
//! targets an S3-compatible endpoint (MinIO, LocalStack) with path-style
//! requests.

use object_store::aws::AmazonS3Builder;
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::ObjectStore;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{S3ConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider, transport_retry};

/// S3 storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Custom endpoint, from `AWS_ENDPOINT` or an `s3::` URL.
    pub endpoint: Option<String>,
    /// Region from `AWS_DEFAULT_REGION`; storage options may still override it.
    pub region: Option<String>,
    pub bucket: String,
    /// Prefix prepended to every shard key.
    pub key: Option<Path>,
}

impl S3Config {
    /// Human-readable location of the bucket and prefix, used in logs.
    pub fn canonical_url(&self) -> String {
        let base = match (&self.region, &self.endpoint) {
            (_, Some(endpoint)) => format!("s3::{}/{}", endpoint, self.bucket),
            (Some(region), _) => format!("https://s3.{}.amazonaws.com/{}", region, self.bucket),
            _ => format!("https://s3.amazonaws.com/{}", self.bucket),
        };

        match &self.key {
            Some(key) => format!("{base}/{key}"),
            None => base,
        }
    }
}

impl StorageProvider {
    pub(super) async fn construct_s3(
        config: S3Config,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_retry(transport_retry());

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &config.endpoint {
            debug!("Using S3-compatible endpoint {}", endpoint);
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        // Explicit storage options win over the environment and the URL
        for (key, value) in &options {
            builder = builder.with_config(key.parse().context(S3ConfigSnafu)?, value.clone());
        }

        let canonical_url = config.canonical_url();
        let s3_store = Arc::new(builder.build().context(S3ConfigSnafu)?);
        let multipart_store: Arc<dyn MultipartStore> = s3_store.clone();
        let object_store: Arc<dyn ObjectStore> = s3_store;

        Ok(Self {
            config: BackendConfig::S3(config),
            object_store,
            multipart_store,
            canonical_url,
        })
    }
}
