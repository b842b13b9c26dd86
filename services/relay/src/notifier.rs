use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::payload;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Notification service operations used by the notifier and the provisioning command
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// ARNs of all topics visible to the current credentials
    async fn list_topics(&self) -> anyhow::Result<Vec<String>>;

    /// Create a topic by name and return its ARN
    async fn create_topic(&self, name: &str) -> anyhow::Result<String>;

    /// Publish a message, returning the service-assigned message id
    async fn publish(
        &self,
        topic_arn: &str,
        subject: &str,
        message: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Subscribe an email address to a topic
    async fn subscribe_email(&self, topic_arn: &str, address: &str) -> anyhow::Result<()>;
}

/// Errors returned by [`Notifier::alert`]
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert topic is unresolved: no topic ARN contains '{name}'")]
    Unresolved { name: String },

    #[error("failed to render alert body: {0}")]
    Render(#[from] serde_json::Error),

    #[error("failed to publish alert to {topic_arn}: {source}")]
    Publish {
        topic_arn: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Topic the notifier publishes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicTarget {
    Topic(String),
    Unresolved,
}

/// Human-readable notification of a message's arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub subject: String,
    pub message: String,
}

impl Alert {
    /// Build the alert for a payload received at `at`
    pub fn compose(subject: &str, payload: &Value, at: DateTime<Utc>) -> serde_json::Result<Self> {
        let rendered = payload::render(payload)?;
        let record = format!(
            "Sending an Alert ... at time: {}\nMessage Body: \n {}",
            at.format("%Y-%m-%d %H:%M:%S%.6f"),
            rendered
        );

        Ok(Self {
            subject: subject.to_string(),
            message: format!("Record Message: \n{record}."),
        })
    }
}

/// Find the first topic whose ARN contains `name`
async fn find_topic(api: &dyn NotificationApi, name: &str) -> anyhow::Result<Option<String>> {
    let topics = api.list_topics().await.context("Failed to list topics")?;
    Ok(topics.into_iter().find(|arn| arn.contains(name)))
}

/// Resolve the alert topic. Never creates topics.
pub async fn resolve_topic(api: &dyn NotificationApi, config: &AlertConfig) -> TopicTarget {
    if let Some(ref arn) = config.topic_arn {
        return TopicTarget::Topic(arn.clone());
    }

    match find_topic(api, &config.topic_name).await {
        Ok(Some(arn)) => TopicTarget::Topic(arn),
        Ok(None) => {
            warn!(topic = %config.topic_name, "No topic matches, alerts are disabled until provisioned");
            TopicTarget::Unresolved
        }
        Err(e) => {
            warn!(error = %e, topic = %config.topic_name, "Topic lookup failed");
            TopicTarget::Unresolved
        }
    }
}

/// Ensure the alert topic exists, creating it if absent. Returns its ARN.
///
/// Run out-of-band at deployment time; concurrent runs are harmless because
/// topic creation is idempotent by name.
pub async fn provision_topic(api: &dyn NotificationApi, name: &str) -> anyhow::Result<String> {
    if let Some(arn) = find_topic(api, name).await? {
        info!(topic_arn = %arn, "Alert topic already present");
        return Ok(arn);
    }

    let arn = api
        .create_topic(name)
        .await
        .with_context(|| format!("Failed to create topic {name}"))?;

    info!(topic_arn = %arn, "Alert topic created");
    Ok(arn)
}

/// Subscribe the operator's email address to the alert topic
pub async fn subscribe_email(
    api: &dyn NotificationApi,
    topic_arn: &str,
    address: &str,
) -> anyhow::Result<()> {
    api.subscribe_email(topic_arn, address)
        .await
        .with_context(|| format!("Failed to subscribe {address} to {topic_arn}"))?;

    info!(topic_arn = %topic_arn, "Email subscription requested, awaiting confirmation");
    Ok(())
}

/// Notification client: publishes one alert per message
pub struct Notifier {
    api: Arc<dyn NotificationApi>,
    target: TopicTarget,
    config: AlertConfig,
    clock: Arc<dyn Clock>,
}

impl Notifier {
    /// Create a notifier, resolving the alert topic
    pub async fn new(
        api: Arc<dyn NotificationApi>,
        config: &AlertConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let target = resolve_topic(api.as_ref(), config).await;

        if let TopicTarget::Topic(ref arn) = target {
            info!(topic_arn = %arn, "Notifier initialized");
        }

        Self::with_target(api, target, config, clock)
    }

    /// Create a notifier with an already resolved topic
    pub fn with_target(
        api: Arc<dyn NotificationApi>,
        target: TopicTarget,
        config: &AlertConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            target,
            config: config.clone(),
            clock,
        }
    }

    /// The topic this notifier publishes to
    pub fn target(&self) -> &TopicTarget {
        &self.target
    }

    /// Publish an alert for one payload
    #[instrument(skip(self, payload))]
    pub async fn alert(&self, payload: &Value) -> Result<Option<String>, AlertError> {
        let start = Instant::now();

        let topic_arn = match self.target {
            TopicTarget::Topic(ref arn) => arn,
            TopicTarget::Unresolved => {
                return Err(AlertError::Unresolved {
                    name: self.config.topic_name.clone(),
                })
            }
        };

        let alert = Alert::compose(&self.config.subject, payload, self.clock.now())?;

        let message_id = self
            .api
            .publish(topic_arn, &alert.subject, &alert.message)
            .await
            .map_err(|source| AlertError::Publish {
                topic_arn: topic_arn.clone(),
                source,
            })?;

        let elapsed = start.elapsed();
        metrics::histogram!("relay_alert_publish_seconds").record(elapsed.as_secs_f64());

        info!(
            topic_arn = %topic_arn,
            message_id = ?message_id,
            alert_secs = elapsed.as_secs_f64(),
            "Alert published"
        );

        Ok(message_id)
    }
}
