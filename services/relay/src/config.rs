use crate::topology::TopologyConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable the deployment uses to hand the alert topic ARN to the relay
pub const EMAIL_TOPIC_ENV: &str = "email_topic";

/// Main configuration for the relay service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Alert configuration
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Queue consumer configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Invoke API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Description of the surrounding managed pipeline
    #[serde(default)]
    pub topology: TopologyConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// AWS client configuration shared by the S3, SNS and SQS clients
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, MinIO, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style S3 access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket to write into. When unset the bucket is looked up by `bucket_contains`.
    pub bucket: Option<String>,
    /// Substring used to find the bucket when `bucket` is unset
    #[serde(default = "default_bucket_contains")]
    pub bucket_contains: String,
    /// Key prefix for stored messages
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Append a random suffix to object keys so same-microsecond writes do not collide
    #[serde(default)]
    pub unique_suffix: bool,
}

/// What the relay reports when the object was stored but the alert failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertFailurePolicy {
    /// Log and count the failure, report success
    #[default]
    Tolerate,
    /// Report the invocation as failed
    Fail,
}

/// Alert configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Topic ARN to publish to. Falls back to the `email_topic` environment variable.
    pub topic_arn: Option<String>,
    /// Topic name used to look up (and provision) the topic when no ARN is configured
    #[serde(default = "default_topic_name")]
    pub topic_name: String,
    /// Alert subject line
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Behaviour when the publish fails after a successful store
    #[serde(default)]
    pub failure_policy: AlertFailurePolicy,
}

/// Queue consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue URL. Without one, only the invoke API is served.
    pub url: Option<String>,
    /// Messages delivered per invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    /// Visibility timeout applied to received messages, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
    /// Long-poll wait time, in seconds
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Pause after a failed receive, in milliseconds
    #[serde(default = "default_poll_error_backoff_ms")]
    pub poll_error_backoff_ms: u64,
}

/// Invoke API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "mqtt-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket_contains() -> String {
    "mqttdata".to_string()
}

fn default_output_prefix() -> String {
    "mqttdata".to_string()
}

fn default_topic_name() -> String {
    "MQTTTopic".to_string()
}

fn default_subject() -> String {
    "Alert Message".to_string()
}

fn default_batch_size() -> i32 {
    1
}

fn default_visibility_timeout_secs() -> i32 {
    30
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_poll_error_backoff_ms() -> u64 {
    1000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/relay").required(false))
            .add_source(config::File::with_name("/etc/mqtt-relay/relay").required(false))
            // Override with environment variables
            // RELAY__STORE__BUCKET -> store.bucket
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_deployment_env(std::env::var(EMAIL_TOPIC_ENV).ok());
        Ok(config)
    }

    /// Adopt the topic ARN injected by the deployment unless one was configured explicitly
    pub fn apply_deployment_env(&mut self, email_topic: Option<String>) {
        if self.alerts.topic_arn.is_none() {
            self.alerts.topic_arn = email_topic.filter(|arn| !arn.is_empty());
        }
    }
}

impl QueueConfig {
    /// Get the consumer's pause after a failed receive as Duration
    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_error_backoff_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            bucket_contains: default_bucket_contains(),
            output_prefix: default_output_prefix(),
            unique_suffix: false,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            topic_arn: None,
            topic_name: default_topic_name(),
            subject: default_subject(),
            failure_policy: AlertFailurePolicy::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            wait_time_secs: default_wait_time_secs(),
            poll_error_backoff_ms: default_poll_error_backoff_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> Config {
        config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = empty_config();
        assert_eq!(config.store.output_prefix, "mqttdata");
        assert_eq!(config.store.bucket_contains, "mqttdata");
        assert_eq!(config.alerts.topic_name, "MQTTTopic");
        assert_eq!(config.alerts.subject, "Alert Message");
        assert_eq!(config.alerts.failure_policy, AlertFailurePolicy::Tolerate);
        assert_eq!(config.queue.batch_size, 1);
        assert_eq!(config.queue.visibility_timeout_secs, 30);
        assert!(config.queue.url.is_none());
    }

    #[test]
    fn test_overrides_from_source() {
        let config: Config = config::Config::builder()
            .set_override("store.bucket", "stack-mqttdata-1a2b")
            .unwrap()
            .set_override("alerts.failure_policy", "fail")
            .unwrap()
            .set_override("queue.visibility_timeout_secs", 45_i64)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.store.bucket.as_deref(), Some("stack-mqttdata-1a2b"));
        assert_eq!(config.alerts.failure_policy, AlertFailurePolicy::Fail);
        assert_eq!(config.queue.visibility_timeout_secs, 45);
    }

    #[test]
    fn test_deployment_env_fills_missing_topic() {
        let mut config = empty_config();
        config.apply_deployment_env(Some("arn:aws:sns:us-east-1:123:MQTTTopic".to_string()));
        assert_eq!(
            config.alerts.topic_arn.as_deref(),
            Some("arn:aws:sns:us-east-1:123:MQTTTopic")
        );
    }

    #[test]
    fn test_deployment_env_does_not_override_explicit_topic() {
        let mut config = empty_config();
        config.alerts.topic_arn = Some("arn:explicit".to_string());
        config.apply_deployment_env(Some("arn:from-env".to_string()));
        assert_eq!(config.alerts.topic_arn.as_deref(), Some("arn:explicit"));

        let mut config = empty_config();
        config.apply_deployment_env(Some(String::new()));
        assert!(config.alerts.topic_arn.is_none());
    }
}
