//! AWS SDK implementations of the store, notification and queue seams.

use crate::config::AwsConfig;
use crate::invocation::QueueRecord;
use crate::notifier::NotificationApi;
use crate::queue_consumer::QueueApi;
use crate::store::ObjectStoreApi;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_sqs::types::QueueAttributeName;
use tracing::{debug, info};

/// Load the shared SDK configuration
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    // Custom endpoint for LocalStack/MinIO
    if let Some(ref endpoint_url) = config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    let sdk_config = loader.load().await;

    info!(
        region = %config.region,
        endpoint_url = ?config.endpoint_url,
        "AWS configuration loaded"
    );

    sdk_config
}

/// Object store backed by S3
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &SdkConfig, config: &AwsConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config_builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for S3ObjectStore {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .context("Failed to list buckets")?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(String::from))
            .collect())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }
}

/// Notification service backed by SNS
pub struct SnsNotifications {
    client: aws_sdk_sns::Client,
}

impl SnsNotifications {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl NotificationApi for SnsNotifications {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .context("Failed to list SNS topics")?;

            arns.extend(
                response
                    .topics()
                    .iter()
                    .filter_map(|topic| topic.topic_arn().map(String::from)),
            );

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(arns)
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .create_topic()
            .name(name)
            .send()
            .await
            .context("Failed to create SNS topic")?;

        response
            .topic_arn()
            .map(String::from)
            .context("No topic ARN in response")
    }

    async fn publish(&self, topic_arn: &str, subject: &str, message: &str) -> Result<Option<String>> {
        let response = self
            .client
            .publish()
            .topic_arn(topic_arn)
            .subject(subject)
            .message(message)
            .send()
            .await
            .context("Failed to publish to SNS")?;

        Ok(response.message_id().map(String::from))
    }

    async fn subscribe_email(&self, topic_arn: &str, address: &str) -> Result<()> {
        let response = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .protocol("email")
            .endpoint(address)
            .send()
            .await
            .context("Failed to subscribe to SNS topic")?;

        debug!(subscription_arn = ?response.subscription_arn(), "Subscription created");
        Ok(())
    }
}

/// Queue backed by SQS
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    region: String,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url: queue_url.into(),
            region: region.into(),
        }
    }
}

#[async_trait]
impl QueueApi for SqsQueue {
    #[allow(deprecated)]
    async fn receive(
        &self,
        max_messages: i32,
        wait_time_secs: i32,
        visibility_timeout_secs: i32,
    ) -> Result<Vec<QueueRecord>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_secs)
            .visibility_timeout(visibility_timeout_secs)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .context("Failed to receive from SQS")?;

        Ok(response
            .messages()
            .iter()
            .map(|message| QueueRecord {
                message_id: message.message_id().map(String::from),
                receipt_handle: message.receipt_handle().map(String::from),
                body: message.body().map(String::from),
                attributes: message
                    .attributes()
                    .map(|attributes| {
                        attributes
                            .iter()
                            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
                md5_of_body: message.md5_of_body().map(String::from),
                event_source: Some("aws:sqs".to_string()),
                aws_region: Some(self.region.clone()),
                ..Default::default()
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete SQS message")?;

        Ok(())
    }
}
