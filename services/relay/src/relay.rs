//! The relay function: one invocation per queued message.
//!
//! Order within an invocation is fixed: extract the body, parse it, store it,
//! then alert. A storage failure fails the invocation before any alert is
//! sent. An alert failure after a successful store is handled according to
//! the configured [`AlertFailurePolicy`].

use crate::config::AlertFailurePolicy;
use crate::invocation::{InvocationFault, InvocationRecord};
use crate::notifier::{AlertError, Notifier};
use crate::store::{DurableStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, field, info, instrument, warn, Span};

/// Errors returned by the relay function
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed invocation: {0}")]
    MalformedInvocation(#[from] InvocationFault),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("storage write failed: {0}")]
    Storage(#[from] StoreError),

    #[error("alert dispatch failed: {0}")]
    AlertDispatch(#[from] AlertError),
}

impl RelayError {
    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedInvocation(_) => "malformed_invocation",
            RelayError::MalformedPayload(_) => "malformed_payload",
            RelayError::Storage(_) => "storage_write_failed",
            RelayError::AlertDispatch(_) => "alert_dispatch_failed",
        }
    }

    /// True when retrying the same input can never succeed
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedInvocation(_) | RelayError::MalformedPayload(_)
        )
    }
}

/// Acknowledgement returned for a relayed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub status_code: u16,
    /// The message body exactly as received
    pub body: String,
}

impl RelayResponse {
    fn ok(body: &str) -> Self {
        Self {
            status_code: 200,
            body: body.to_string(),
        }
    }
}

/// Persists each message and alerts on it
pub struct Relay {
    store: Arc<DurableStore>,
    notifier: Arc<Notifier>,
    policy: AlertFailurePolicy,
}

impl Relay {
    pub fn new(store: Arc<DurableStore>, notifier: Arc<Notifier>, policy: AlertFailurePolicy) -> Self {
        Self {
            store,
            notifier,
            policy,
        }
    }

    /// Relay a raw invocation record
    pub async fn handle_raw(&self, event: &[u8]) -> Result<RelayResponse, RelayError> {
        match InvocationRecord::from_slice(event) {
            Ok(invocation) => self.handle(&invocation).await,
            Err(fault) => {
                let err = RelayError::from(fault);
                record_outcome(err.kind());
                warn!(error = %err, "Rejected invocation");
                Err(err)
            }
        }
    }

    /// Relay one invocation
    #[instrument(skip_all, fields(message_id = field::Empty))]
    pub async fn handle(&self, invocation: &InvocationRecord) -> Result<RelayResponse, RelayError> {
        let result = self.relay(invocation).await;

        match result {
            Ok(_) => record_outcome("success"),
            Err(ref e) => {
                record_outcome(e.kind());
                error!(error = %e, kind = e.kind(), "Relay invocation failed");
            }
        }

        result
    }

    async fn relay(&self, invocation: &InvocationRecord) -> Result<RelayResponse, RelayError> {
        let message = invocation.message()?;
        if let Some(ref id) = message.message_id {
            Span::current().record("message_id", id.as_str());
        }

        let body = invocation.body()?;
        debug!(body = %body, receive_count = ?message.receive_count(), "Received message");

        let payload: Value = serde_json::from_str(body).map_err(RelayError::MalformedPayload)?;

        let key = self.store.upload(&payload).await?;

        if let Err(e) = self.notifier.alert(&payload).await {
            metrics::counter!("relay_alerts_failed_total").increment(1);
            match self.policy {
                AlertFailurePolicy::Tolerate => warn!(
                    error = %e,
                    key = %key,
                    "Message stored but alert was not delivered"
                ),
                AlertFailurePolicy::Fail => return Err(e.into()),
            }
        }

        info!(key = %key, "Message relayed");
        Ok(RelayResponse::ok(body))
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("relay_invocations_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::config::{AlertConfig, StoreConfig};
    use crate::invocation::QueueRecord;
    use crate::notifier::{MockNotificationApi, TopicTarget};
    use crate::store::{MockObjectStoreApi, StoreTarget};
    use chrono::{TimeZone, Utc};
    use mockall::Sequence;
    use std::sync::Mutex;

    const BUCKET: &str = "stack-mqttdata-1a2b";
    const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:123456789012:MQTTTopic";

    fn build_relay(
        store_api: MockObjectStoreApi,
        notify_api: MockNotificationApi,
        policy: AlertFailurePolicy,
    ) -> Relay {
        let clock = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap()
                + chrono::Duration::microseconds(123456),
        ));

        let store = DurableStore::with_target(
            Arc::new(store_api),
            StoreTarget::Bucket(BUCKET.to_string()),
            &StoreConfig::default(),
            clock.clone(),
        );
        let notifier = Notifier::with_target(
            Arc::new(notify_api),
            TopicTarget::Topic(TOPIC_ARN.to_string()),
            &AlertConfig::default(),
            clock,
        );

        Relay::new(Arc::new(store), Arc::new(notifier), policy)
    }

    fn invocation(body: &str) -> InvocationRecord {
        InvocationRecord::single(QueueRecord {
            message_id: Some("059f36b4-87a3-44ab-83d2-661975830a7d".to_string()),
            ..QueueRecord::with_body(body)
        })
    }

    #[tokio::test]
    async fn test_end_to_end_store_then_alert() {
        let input = r#"{"sensor":"temp1","value":21.5}"#;
        let stored = Arc::new(Mutex::new(Vec::new()));
        let captured = stored.clone();
        let mut seq = Sequence::new();

        let mut store_api = MockObjectStoreApi::new();
        store_api
            .expect_put_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |bucket, key, body, _| {
                captured
                    .lock()
                    .unwrap()
                    .push((bucket.to_string(), key.to_string(), body));
                Ok(())
            });

        let mut notify_api = MockNotificationApi::new();
        notify_api
            .expect_publish()
            .withf(|arn, subject, message| {
                arn == TOPIC_ARN
                    && subject == "Alert Message"
                    && message.contains(r#"{"sensor": "temp1", "value": 21.5}"#)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(Some("sns-1".to_string())));

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);
        let response = relay.handle(&invocation(input)).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, input);

        let stored = stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        let (bucket, key, body) = &stored[0];
        assert_eq!(bucket, BUCKET);
        assert_eq!(key, "mqttdata/2024/06/01/13/2024-06-01-13-00-00-123456.json");
        let body: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body, serde_json::from_str::<Value>(input).unwrap());
    }

    #[tokio::test]
    async fn test_missing_body_has_no_side_effects() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().never();
        let mut notify_api = MockNotificationApi::new();
        notify_api.expect_publish().never();

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);
        let record = InvocationRecord::single(QueueRecord::default());

        let err = relay.handle(&record).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_invocation");
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_raw_event_without_records_is_malformed_invocation() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().never();
        let mut notify_api = MockNotificationApi::new();
        notify_api.expect_publish().never();

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);

        for event in [&b"{}"[..], &b"not json"[..], &br#"{"Records": []}"#[..]] {
            let err = relay.handle_raw(event).await.unwrap_err();
            assert!(matches!(err, RelayError::MalformedInvocation(_)));
        }
    }

    #[tokio::test]
    async fn test_invalid_json_body_has_no_side_effects() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().never();
        let mut notify_api = MockNotificationApi::new();
        notify_api.expect_publish().never();

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);

        for body in ["", "{\"sensor\":", "sensor=temp1", "{'single': 'quotes'}"] {
            let err = relay.handle(&invocation(body)).await.unwrap_err();
            assert_eq!(err.kind(), "malformed_payload");
        }
    }

    #[tokio::test]
    async fn test_store_failure_sends_no_alert() {
        let mut store_api = MockObjectStoreApi::new();
        store_api
            .expect_put_object()
            .times(1)
            .returning(|_, _, _, _| Err(anyhow::anyhow!("AccessDenied: Access Denied")));
        let mut notify_api = MockNotificationApi::new();
        notify_api.expect_publish().never();

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);
        let err = relay.handle(&invocation(r#"{"a": 1}"#)).await.unwrap_err();

        assert!(matches!(err, RelayError::Storage(StoreError::Write { .. })));
        assert_eq!(err.kind(), "storage_write_failed");
        assert!(!err.is_malformed());
    }

    #[tokio::test]
    async fn test_alert_failure_tolerated_after_store() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().times(1).returning(|_, _, _, _| Ok(()));
        let mut notify_api = MockNotificationApi::new();
        notify_api
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("Throttling: Rate exceeded")));

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);
        let response = relay.handle(&invocation(r#"{"a": 1}"#)).await.unwrap();

        assert_eq!(response, RelayResponse::ok(r#"{"a": 1}"#));
    }

    #[tokio::test]
    async fn test_alert_failure_reported_under_fail_policy() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().times(1).returning(|_, _, _, _| Ok(()));
        let mut notify_api = MockNotificationApi::new();
        notify_api
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("Throttling: Rate exceeded")));

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Fail);
        let err = relay.handle(&invocation(r#"{"a": 1}"#)).await.unwrap_err();

        assert!(matches!(err, RelayError::AlertDispatch(AlertError::Publish { .. })));
        assert_eq!(err.kind(), "alert_dispatch_failed");
    }

    #[tokio::test]
    async fn test_non_object_payloads_are_relayed() {
        let mut store_api = MockObjectStoreApi::new();
        store_api.expect_put_object().times(3).returning(|_, _, _, _| Ok(()));
        let mut notify_api = MockNotificationApi::new();
        notify_api.expect_publish().times(3).returning(|_, _, _| Ok(None));

        let relay = build_relay(store_api, notify_api, AlertFailurePolicy::Tolerate);

        for body in ["[1, 2, 3]", "\"text\"", "null"] {
            let response = relay.handle(&invocation(body)).await.unwrap();
            assert_eq!(response.body, body);
        }
    }

    #[test]
    fn test_response_serialization() {
        let response = RelayResponse::ok("{}");
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"statusCode":200,"body":"{}"}"#
        );
    }
}
