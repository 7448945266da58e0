//! Destinations for snapshot payloads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::aws::AwsClients;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Storage backend failure. Retryable.
    #[error("snapshot storage unavailable: {0}")]
    Unavailable(String),
}

/// Persists a snapshot body and returns a reference to it.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, SinkError>;
}

/// Sink keeping payloads in process memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemorySink {
    pub const SCHEME: &'static str = "memory://";

    pub fn new() -> Self {
        Self::default()
    }

    /// Payload previously stored under `payload_ref`.
    pub async fn get(&self, payload_ref: &str) -> Option<Bytes> {
        let key = payload_ref.strip_prefix(Self::SCHEME)?;
        self.objects.read().await.get(key).cloned()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, SinkError> {
        self.objects
            .write()
            .await
            .insert(key.to_owned(), Bytes::from(body));
        Ok(format!("{}{key}", Self::SCHEME))
    }
}

/// Sink writing payloads to S3 as JSON objects.
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl SnapshotSink for S3Sink {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String, SinkError> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type("application/json")
            .body(ByteStream::from(Bytes::from(body)))
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Ok(format!("s3://{}/{object_key}", self.bucket))
    }
}

/// S3 when `SNAPSHOT_BUCKET` is set and AWS clients exist, memory otherwise.
pub fn build_sink(cfg: &Config, aws: Option<&AwsClients>) -> Arc<dyn SnapshotSink> {
    match (cfg.snapshot_bucket.as_deref(), aws) {
        (Some(bucket), Some(aws)) => Arc::new(S3Sink::new(
            aws.s3.clone(),
            bucket,
            cfg.snapshot_prefix.clone(),
        )),
        _ => Arc::new(MemorySink::new()),
    }
}
