//! Integration tests for flurry

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flurry::error::{PipelineError, ShardError, StorageError};
use flurry::storage::{PartTag, UploadSession};
use flurry::{BlobStore, Config, Pipeline, PipelineOptions, StorageProvider, shard_key};
use object_store::path::Path;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

fn csv_rows(count: usize) -> String {
    (0..count)
        .map(|i| format!("{i},user-{i},{}\n", i % 17))
        .collect()
}

fn decode(bytes: &[u8]) -> String {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text).unwrap();
    text
}

mod config_tests {
    use super::*;

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
destination:
  bucket: "s3://exports"
  path: "daily/users"
  storage_options:
    region: eu-west-1

sharding:
  shard_count: 4
  batch_size: 500
  part_size_mb: 8
  abort_on_failure: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.destination.url(), "s3://exports");
        assert_eq!(config.sharding.shard_count, 4);
        assert_eq!(config.max_in_flight(), 8);

        let options = config.pipeline_options();
        assert_eq!(options.batch_size, 500);
        assert_eq!(options.min_part_size, 8 * 1024 * 1024);
        assert!(options.abort_on_failure);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "destination:\n  bucket: my-bucket\n  path: out/run\nmetrics:\n  address: 127.0.0.1:9090"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.destination.url(), "s3://my-bucket");
        assert_eq!(config.sharding.shard_count, 12);
        assert_eq!(config.sharding.batch_size, 2000);
        assert_eq!(config.metrics.address.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "destination:\n  bucket: b\n  path: p\nsharding:\n  shards: 3\n";
        assert!(Config::from_yaml(yaml).is_err());
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_end_to_end_reconstruction() {
        let storage = StorageProvider::in_memory();
        let options = PipelineOptions::default()
            .with_shard_count(3)
            .with_batch_size(100)
            .with_min_part_size(4 * 1024);
        let input = csv_rows(10_000);

        let stats = Pipeline::create(Arc::new(storage.clone()), "exports/users", options)
            .await
            .unwrap()
            .run(input.as_bytes())
            .await
            .unwrap();

        assert_eq!(stats.records, 10_000);
        assert_eq!(stats.batches, 100);

        let mut shards = Vec::new();
        for shard in 0..3 {
            let object = storage.get(shard_key("exports/users", shard)).await.unwrap();
            let text = decode(&object);
            shards.push(text.lines().map(str::to_string).collect::<Vec<_>>());
        }

        let mut rebuilt = Vec::new();
        for batch in 0..100 {
            let shard = batch % 3;
            let offset = (batch / 3) * 100;
            rebuilt.extend_from_slice(&shards[shard][offset..offset + 100]);
        }
        let expected: Vec<String> = input.lines().map(str::to_string).collect();
        assert_eq!(rebuilt, expected);
    }

    #[tokio::test]
    async fn test_more_shards_than_batches() {
        let storage = StorageProvider::in_memory();
        let options = PipelineOptions::default()
            .with_shard_count(8)
            .with_batch_size(10);

        let stats = Pipeline::create(Arc::new(storage.clone()), "sparse", options)
            .await
            .unwrap()
            .run(csv_rows(25).as_bytes())
            .await
            .unwrap();

        let records: Vec<u64> = stats.shards.iter().map(|s| s.records).collect();
        assert_eq!(records, vec![10, 10, 5, 0, 0, 0, 0, 0]);

        for shard in 3..8 {
            let object = storage.get(shard_key("sparse", shard)).await.unwrap();
            assert_eq!(decode(&object), "");
        }
    }

    #[tokio::test]
    async fn test_run_pipeline_with_memory_url() {
        let mut config = Config::new("memory://", "scratch/run");
        config.sharding.shard_count = 2;
        config.sharding.batch_size = 7;

        let stats = flurry::run_pipeline(
            &config,
            csv_rows(50).as_bytes(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.records, 50);
        assert_eq!(stats.shards.len(), 2);
        assert_eq!(stats.shards[0].key, Path::from("scratch/run.0.csv.gz"));
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_invalid_config() {
        let mut config = Config::new("memory://", "bad");
        config.sharding.shard_count = 0;

        let err = flurry::run_pipeline(&config, &b""[..], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    /// Store whose part uploads always fail.
    #[derive(Debug)]
    struct RejectingStore {
        inner: StorageProvider,
        aborts: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for RejectingStore {
        async fn create_multipart_upload(
            &self,
            key: &Path,
        ) -> Result<UploadSession, StorageError> {
            self.inner.create_multipart_upload(key).await
        }

        async fn upload_part(
            &self,
            _session: &UploadSession,
            _part_number: usize,
            _bytes: Bytes,
        ) -> Result<PartTag, StorageError> {
            Err(StorageError::ObjectStore {
                source: object_store::Error::Generic {
                    store: "rejecting",
                    source: "part rejected".into(),
                },
            })
        }

        async fn complete_multipart_upload(
            &self,
            session: &UploadSession,
            parts: &[(usize, PartTag)],
        ) -> Result<(), StorageError> {
            self.inner.complete_multipart_upload(session, parts).await
        }

        async fn abort_multipart_upload(
            &self,
            session: &UploadSession,
        ) -> Result<(), StorageError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            self.inner.abort_multipart_upload(session).await
        }
    }

    #[tokio::test]
    async fn test_transient_failure_aborts_when_enabled() {
        let store = Arc::new(RejectingStore {
            inner: StorageProvider::in_memory(),
            aborts: AtomicUsize::new(0),
        });
        let options = PipelineOptions::default()
            .with_shard_count(2)
            .with_batch_size(5)
            .with_abort_on_failure(true);

        // Residual upload at completion fails for every shard
        let err = Pipeline::create(store.clone(), "rejected", options)
            .await
            .unwrap()
            .run(csv_rows(20).as_bytes())
            .await
            .unwrap_err();

        match err.shard_error() {
            Some(ShardError::Store { source, .. }) => assert!(source.is_transient()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.aborts.load(Ordering::SeqCst), 2);
        assert!(store.inner.get(shard_key("rejected", 0)).await.is_err());
    }
}
