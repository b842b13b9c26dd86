//! Typed description of the managed pipeline around the relay.
//!
//! ```text
//! device ──▶ broker topic ──▶ routing rule ──▶ fan-out topic ──▶ queue (batch 1) ──▶ relay
//!                                                                                   │
//!                                   email topic ◀───────────────────────────────────┤
//!                                                                                   ▼
//!                                 catalog tables ◀── scheduled crawler ◀── object store
//! ```
//!
//! None of these services are implemented here. The description exists so the
//! relay can check at startup that the deployment it runs in honours the
//! contract it relies on, and so tooling can print the expected wiring.

use crate::config::{QueueConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Ways a topology can violate the relay's contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("routing rule must be a SELECT ... FROM '<topic>' statement, got: {0}")]
    InvalidRoutingRule(String),

    #[error("unsupported routing message format '{0}', expected RAW or JSON")]
    InvalidMessageFormat(String),

    #[error("fan-out to the queue must use raw message delivery")]
    WrappedDelivery,

    #[error("queue batch size must be exactly 1, got {0}")]
    BatchSize(i32),

    #[error("queue visibility timeout must be positive, got {0}s")]
    VisibilityTimeout(i32),

    #[error("crawler schedule must be cron(...) or rate(...), got: {0}")]
    InvalidSchedule(String),

    #[error("crawler target prefix '{target}' does not match the store output prefix '{prefix}'")]
    CrawlerTargetMismatch { target: String, prefix: String },

    #[error("asynchronous invoke retry attempts must be between 0 and 2, got {0}")]
    RetryAttempts(u32),

    #[error("maximum event age must be between 60 and 21600 seconds, got {0}")]
    MaxEventAge(u64),

    #[error("invalid alert email address: {0}")]
    InvalidEmail(String),
}

/// Rule forwarding broker messages to the fan-out topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    /// Selection statement
    #[serde(default = "default_rule_sql")]
    pub sql: String,
    /// Message format forwarded to the fan-out topic
    #[serde(default = "default_message_format")]
    pub message_format: String,
    /// Log group receiving rule errors
    #[serde(default = "default_error_log_group")]
    pub error_log_group: String,
}

/// Fan-out topic delivering to the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Deliver message bodies unwrapped
    #[serde(default = "default_true")]
    pub raw_message_delivery: bool,
}

/// Scheduled crawler cataloging stored objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_crawler_name")]
    pub name: String,
    /// Catalog database tables are registered in
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// Prefix inside the bucket to crawl. Defaults to the store output prefix.
    pub target_prefix: Option<String>,
}

/// Asynchronous invocation settings of the relay function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeConfig {
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,
}

/// Email subscription on the alert topic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Operator address subscribed to alerts
    pub target: Option<String>,
}

/// The managed pipeline around the relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub routing_rule: RoutingRuleConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub invoke: InvokeConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

fn default_rule_sql() -> String {
    "SELECT * FROM 'out/topic'".to_string()
}

fn default_message_format() -> String {
    "RAW".to_string()
}

fn default_error_log_group() -> String {
    "mqtt-iot-rule-errors-log-group".to_string()
}

fn default_true() -> bool {
    true
}

fn default_crawler_name() -> String {
    "mqttdata-crawler".to_string()
}

fn default_database() -> String {
    "mqttdata-db".to_string()
}

fn default_schedule() -> String {
    "cron(0/30 * * * ? *)".to_string()
}

fn default_table_prefix() -> String {
    "mqttdata-table".to_string()
}

fn default_max_event_age_secs() -> u64 {
    600
}

impl Default for RoutingRuleConfig {
    fn default() -> Self {
        Self {
            sql: default_rule_sql(),
            message_format: default_message_format(),
            error_log_group: default_error_log_group(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            raw_message_delivery: true,
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            name: default_crawler_name(),
            database: default_database(),
            schedule: default_schedule(),
            table_prefix: default_table_prefix(),
            target_prefix: None,
        }
    }
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 0,
            max_event_age_secs: default_max_event_age_secs(),
        }
    }
}

impl RoutingRuleConfig {
    /// Broker topic the rule selects from, e.g. `out/topic`
    pub fn source_topic(&self) -> Option<&str> {
        let sql = self.sql.trim();
        if !sql
            .get(..6)
            .is_some_and(|keyword| keyword.eq_ignore_ascii_case("select"))
        {
            return None;
        }

        let upper = sql.to_ascii_uppercase();
        let from = upper.find(" FROM ")?;
        let rest = sql[from + " FROM ".len()..].trim_start();
        let rest = rest.strip_prefix('\'')?;
        let end = rest.find('\'')?;

        Some(&rest[..end]).filter(|topic| !topic.is_empty())
    }
}

impl CrawlerConfig {
    /// Path the crawler scans, `<bucket>/<prefix>`
    pub fn target(&self, bucket: &str, store: &StoreConfig) -> String {
        format!("{}/{}", bucket, self.target_prefix(store))
    }

    fn target_prefix<'a>(&'a self, store: &'a StoreConfig) -> &'a str {
        self.target_prefix
            .as_deref()
            .unwrap_or(&store.output_prefix)
            .trim_matches('/')
    }

    /// Interval between crawls, for the schedule shapes this pipeline uses:
    /// `cron(0/N * * * ? *)`, `cron(M * * * ? *)` and `rate(N minute(s)|hour(s)|day(s))`
    pub fn interval(&self) -> Option<Duration> {
        let schedule = self.schedule.trim();

        if let Some(expr) = schedule.strip_prefix("rate(").and_then(|s| s.strip_suffix(')')) {
            let mut parts = expr.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let unit = parts.next()?;
            let seconds = match unit.trim_end_matches('s') {
                "minute" => 60,
                "hour" => 3600,
                "day" => 86400,
                _ => return None,
            };
            return value
                .checked_mul(seconds)
                .filter(|_| value > 0)
                .map(Duration::from_secs);
        }

        let expr = schedule.strip_prefix("cron(")?.strip_suffix(')')?;
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 || fields[1..4] != ["*", "*", "*"] {
            return None;
        }

        match fields[0].split_once('/') {
            Some((_, step)) => {
                let step: u64 = step.parse().ok()?;
                (step > 0 && step < 60).then(|| Duration::from_secs(step * 60))
            }
            None => {
                let minute: u64 = fields[0].parse().ok()?;
                (minute < 60).then(|| Duration::from_secs(3600))
            }
        }
    }
}

impl TopologyConfig {
    /// Check the topology against the relay's contract
    pub fn validate(&self, store: &StoreConfig, queue: &QueueConfig) -> Result<(), TopologyError> {
        if self.routing_rule.source_topic().is_none() {
            return Err(TopologyError::InvalidRoutingRule(self.routing_rule.sql.clone()));
        }

        let format = self.routing_rule.message_format.to_ascii_uppercase();
        if format != "RAW" && format != "JSON" {
            return Err(TopologyError::InvalidMessageFormat(
                self.routing_rule.message_format.clone(),
            ));
        }

        if !self.fanout.raw_message_delivery {
            return Err(TopologyError::WrappedDelivery);
        }

        if queue.batch_size != 1 {
            return Err(TopologyError::BatchSize(queue.batch_size));
        }

        if queue.visibility_timeout_secs <= 0 {
            return Err(TopologyError::VisibilityTimeout(queue.visibility_timeout_secs));
        }

        let schedule = self.crawler.schedule.trim();
        let well_formed = (schedule.starts_with("cron(") || schedule.starts_with("rate("))
            && schedule.ends_with(')');
        if !well_formed {
            return Err(TopologyError::InvalidSchedule(self.crawler.schedule.clone()));
        }

        let target = self.crawler.target_prefix(store);
        let prefix = store.output_prefix.trim_matches('/');
        if target != prefix && !target.ends_with(&format!("/{prefix}")) {
            return Err(TopologyError::CrawlerTargetMismatch {
                target: target.to_string(),
                prefix: prefix.to_string(),
            });
        }

        if self.invoke.retry_attempts > 2 {
            return Err(TopologyError::RetryAttempts(self.invoke.retry_attempts));
        }

        if !(60..=21600).contains(&self.invoke.max_event_age_secs) {
            return Err(TopologyError::MaxEventAge(self.invoke.max_event_age_secs));
        }

        if let Some(ref address) = self.email.target {
            if !is_plausible_email(address) {
                return Err(TopologyError::InvalidEmail(address.clone()));
            }
        }

        Ok(())
    }
}

fn is_plausible_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !address.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> (TopologyConfig, StoreConfig, QueueConfig) {
        (
            TopologyConfig::default(),
            StoreConfig::default(),
            QueueConfig::default(),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let (topology, store, queue) = valid();
        assert_eq!(topology.validate(&store, &queue), Ok(()));
    }

    #[test]
    fn test_source_topic() {
        let mut rule = RoutingRuleConfig::default();
        assert_eq!(rule.source_topic(), Some("out/topic"));

        rule.sql = "select temperature, device from 'sensors/+/telemetry' where temperature > 50".to_string();
        assert_eq!(rule.source_topic(), Some("sensors/+/telemetry"));

        rule.sql = "DELETE FROM 'out/topic'".to_string();
        assert_eq!(rule.source_topic(), None);

        rule.sql = "SELECT * FROM ''".to_string();
        assert_eq!(rule.source_topic(), None);
    }

    #[test]
    fn test_batch_size_must_be_one() {
        let (topology, store, mut queue) = valid();
        queue.batch_size = 10;
        assert_eq!(
            topology.validate(&store, &queue),
            Err(TopologyError::BatchSize(10))
        );
    }

    #[test]
    fn test_visibility_timeout_must_be_positive() {
        let (topology, store, mut queue) = valid();
        queue.visibility_timeout_secs = 0;
        assert_eq!(
            topology.validate(&store, &queue),
            Err(TopologyError::VisibilityTimeout(0))
        );
    }

    #[test]
    fn test_wrapped_delivery_rejected() {
        let (mut topology, store, queue) = valid();
        topology.fanout.raw_message_delivery = false;
        assert_eq!(
            topology.validate(&store, &queue),
            Err(TopologyError::WrappedDelivery)
        );
    }

    #[test]
    fn test_crawler_target_must_cover_store_prefix() {
        let (mut topology, store, queue) = valid();
        topology.crawler.target_prefix = Some("archive".to_string());
        assert!(matches!(
            topology.validate(&store, &queue),
            Err(TopologyError::CrawlerTargetMismatch { .. })
        ));

        topology.crawler.target_prefix = Some("/mqttdata/".to_string());
        assert_eq!(topology.validate(&store, &queue), Ok(()));
    }

    #[test]
    fn test_crawler_target_path() {
        let (topology, store, _) = valid();
        assert_eq!(
            topology.crawler.target("stack-mqttdata-1a2b", &store),
            "stack-mqttdata-1a2b/mqttdata"
        );
    }

    #[test]
    fn test_crawl_interval() {
        let mut crawler = CrawlerConfig::default();
        assert_eq!(crawler.interval(), Some(Duration::from_secs(30 * 60)));

        crawler.schedule = "cron(15 * * * ? *)".to_string();
        assert_eq!(crawler.interval(), Some(Duration::from_secs(3600)));

        crawler.schedule = "rate(2 hours)".to_string();
        assert_eq!(crawler.interval(), Some(Duration::from_secs(7200)));

        crawler.schedule = "rate(1 minute)".to_string();
        assert_eq!(crawler.interval(), Some(Duration::from_secs(60)));

        crawler.schedule = "cron(0 12 * * ? *)".to_string();
        assert_eq!(crawler.interval(), None);
    }

    #[test]
    fn test_crawl_interval_out_of_range_rate() {
        let mut crawler = CrawlerConfig::default();

        crawler.schedule = format!("rate({} days)", u64::MAX / 86400 + 1);
        assert_eq!(crawler.interval(), None);

        crawler.schedule = "rate(0 minutes)".to_string();
        assert_eq!(crawler.interval(), None);
    }

    #[test]
    fn test_invalid_schedule() {
        let (mut topology, store, queue) = valid();
        topology.crawler.schedule = "every 30 minutes".to_string();
        assert!(matches!(
            topology.validate(&store, &queue),
            Err(TopologyError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_invoke_limits() {
        let (mut topology, store, queue) = valid();
        topology.invoke.retry_attempts = 3;
        assert_eq!(
            topology.validate(&store, &queue),
            Err(TopologyError::RetryAttempts(3))
        );

        topology.invoke.retry_attempts = 0;
        topology.invoke.max_event_age_secs = 30;
        assert_eq!(
            topology.validate(&store, &queue),
            Err(TopologyError::MaxEventAge(30))
        );
    }

    #[test]
    fn test_email_target() {
        let (mut topology, store, queue) = valid();
        topology.email.target = Some("ops@example.com".to_string());
        assert_eq!(topology.validate(&store, &queue), Ok(()));

        topology.email.target = Some("ops@localhost".to_string());
        assert_eq!(topology.validate(&store, &queue), Ok(()));

        for bad in ["ops", "@example.com", "ops@", "ops@@example.com", "o ps@example.com"] {
            topology.email.target = Some(bad.to_string());
            assert!(
                matches!(topology.validate(&store, &queue), Err(TopologyError::InvalidEmail(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_message_format() {
        let (mut topology, store, queue) = valid();
        topology.routing_rule.message_format = "json".to_string();
        assert_eq!(topology.validate(&store, &queue), Ok(()));

        topology.routing_rule.message_format = "XML".to_string();
        assert!(matches!(
            topology.validate(&store, &queue),
            Err(TopologyError::InvalidMessageFormat(_))
        ));
    }
}
