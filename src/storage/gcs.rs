//! Google Cloud Storage backend.
//!
//! Credentials come from the environment (`GOOGLE_*` variables) or from
//! `GOOGLE_SERVICE_ACCOUNT_KEY`, which holds the key JSON itself.

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::ObjectStore;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GcsConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider, transport_retry};

/// Google Cloud Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsConfig {
    pub bucket: String,
    /// Prefix prepended to every shard key.
    pub key: Option<Path>,
}

impl GcsConfig {
    /// Human-readable location of the bucket and prefix, used in logs.
    pub fn canonical_url(&self) -> String {
        let base = format!("https://{}.storage.googleapis.com", self.bucket);
        match &self.key {
            Some(key) => format!("{base}/{key}"),
            None => base,
        }
    }
}

impl StorageProvider {
    pub(super) async fn construct_gcs(
        config: GcsConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&config.bucket)
            .with_retry(transport_retry());

        if let Ok(service_account_key) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
            debug!("Constructing GCS builder with service account key");
            builder = builder.with_service_account_key(&service_account_key);
        }

        for (key, value) in &options {
            builder = builder.with_config(key.parse().context(GcsConfigSnafu)?, value.clone());
        }

        let canonical_url = config.canonical_url();
        let gcs_store = Arc::new(builder.build().context(GcsConfigSnafu)?);
        let multipart_store: Arc<dyn MultipartStore> = gcs_store.clone();
        let object_store: Arc<dyn ObjectStore> = gcs_store;

        Ok(Self {
            config: BackendConfig::Gcs(config),
            object_store,
            multipart_store,
            canonical_url,
        })
    }
}
