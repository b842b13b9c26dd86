use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Object store operations used by the durable store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Names of all buckets visible to the current credentials
    async fn list_buckets(&self) -> anyhow::Result<Vec<String>>;

    /// Write one object
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> anyhow::Result<()>;
}

/// Errors returned by [`DurableStore::upload`]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store target is unresolved: no bucket name contains '{token}'")]
    Unresolved { token: String },

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write s3://{bucket}/{key}: {source}")]
    Write {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    /// True when the failure comes from configuration rather than the write path
    pub fn is_configuration(&self) -> bool {
        matches!(self, StoreError::Unresolved { .. })
    }
}

/// Bucket the store writes into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Bucket(String),
    Unresolved,
}

/// Resolve the target bucket.
///
/// A configured bucket name wins. Otherwise the first listed bucket whose name
/// contains `bucket_contains` is adopted. Never fails: listing errors and
/// missing matches leave the target unresolved so that every later write
/// reports the misconfiguration.
pub async fn resolve_bucket(api: &dyn ObjectStoreApi, config: &StoreConfig) -> StoreTarget {
    if let Some(ref bucket) = config.bucket {
        return StoreTarget::Bucket(bucket.clone());
    }

    let buckets = match api.list_buckets().await {
        Ok(buckets) => buckets,
        Err(e) => {
            warn!(error = %e, "Failed to list buckets, store target unresolved");
            return StoreTarget::Unresolved;
        }
    };

    let mut matching = buckets
        .into_iter()
        .filter(|name| name.contains(&config.bucket_contains));

    match matching.next() {
        Some(bucket) => {
            let others: Vec<String> = matching.collect();
            if !others.is_empty() {
                warn!(
                    selected = %bucket,
                    ignored = ?others,
                    token = %config.bucket_contains,
                    "Several buckets match, using the first"
                );
            }
            StoreTarget::Bucket(bucket)
        }
        None => {
            warn!(
                token = %config.bucket_contains,
                "No bucket matches, store target unresolved"
            );
            StoreTarget::Unresolved
        }
    }
}

/// Build the object key for a message stored at `at`.
///
/// Format: `{prefix}/{YYYY}/{MM}/{DD}/{HH}/{YYYY}-{MM}-{DD}-{HH}-{MM}-{SS}-{ffffff}[-{suffix}].json`
///
/// Partitioning by hour keeps crawler partitions small; the microsecond
/// timestamp orders objects inside a partition.
pub fn object_key(prefix: &str, at: DateTime<Utc>, suffix: Option<&str>) -> String {
    let partition = at.format("%Y/%m/%d/%H");
    let stamp = at.format("%Y-%m-%d-%H-%M-%S-%6f");

    match suffix {
        Some(suffix) => format!("{prefix}/{partition}/{stamp}-{suffix}.json"),
        None => format!("{prefix}/{partition}/{stamp}.json"),
    }
}

/// Durable store client: writes one JSON object per message
pub struct DurableStore {
    api: Arc<dyn ObjectStoreApi>,
    target: StoreTarget,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl DurableStore {
    /// Create a store client, resolving the target bucket
    pub async fn new(
        api: Arc<dyn ObjectStoreApi>,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let target = resolve_bucket(api.as_ref(), config).await;

        match target {
            StoreTarget::Bucket(ref bucket) => {
                info!(bucket = %bucket, prefix = %config.output_prefix, "Durable store initialized")
            }
            StoreTarget::Unresolved => {
                warn!(token = %config.bucket_contains, "Durable store initialized without a bucket")
            }
        }

        Self::with_target(api, target, config, clock)
    }

    /// Create a store client with an already resolved target
    pub fn with_target(
        api: Arc<dyn ObjectStoreApi>,
        target: StoreTarget,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            target,
            config: config.clone(),
            clock,
        }
    }

    /// The bucket this store writes into
    pub fn target(&self) -> &StoreTarget {
        &self.target
    }

    /// Persist one payload as a new object. Returns the object key.
    #[instrument(skip(self, payload))]
    pub async fn upload(&self, payload: &Value) -> Result<String, StoreError> {
        let start = Instant::now();

        let bucket = match self.target {
            StoreTarget::Bucket(ref bucket) => bucket,
            StoreTarget::Unresolved => {
                return Err(StoreError::Unresolved {
                    token: self.config.bucket_contains.clone(),
                })
            }
        };

        let suffix = self
            .config
            .unique_suffix
            .then(|| Uuid::new_v4().simple().to_string()[..8].to_string());
        let key = object_key(&self.config.output_prefix, self.clock.now(), suffix.as_deref());
        let body = payload::render(payload)?;

        debug!(bucket = %bucket, key = %key, size_bytes = body.len(), "Writing object");

        self.api
            .put_object(bucket, &key, body.into_bytes(), "application/json")
            .await
            .map_err(|source| StoreError::Write {
                bucket: bucket.clone(),
                key: key.clone(),
                source,
            })?;

        let elapsed = start.elapsed();
        metrics::histogram!("relay_store_upload_seconds").record(elapsed.as_secs_f64());

        info!(
            bucket = %bucket,
            key = %key,
            upload_secs = elapsed.as_secs_f64(),
            "Message stored"
        );

        Ok(key)
    }
}
