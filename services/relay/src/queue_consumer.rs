use crate::config::QueueConfig;
use crate::invocation::{InvocationRecord, QueueRecord};
use crate::relay::Relay;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Queue operations used by the consumer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Long-poll for up to `max_messages` messages
    async fn receive(
        &self,
        max_messages: i32,
        wait_time_secs: i32,
        visibility_timeout_secs: i32,
    ) -> Result<Vec<QueueRecord>>;

    /// Acknowledge a message so it is not redelivered
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// What happened to one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Relayed and removed from the queue
    Acknowledged,
    /// Relayed, but the acknowledgement failed; the queue will redeliver it
    AckFailed,
    /// Relay failed; left for the queue's redelivery policy
    Released,
}

impl MessageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Acknowledged => "acknowledged",
            MessageOutcome::AckFailed => "ack_failed",
            MessageOutcome::Released => "released",
        }
    }
}

/// Polls the queue and invokes the relay once per message
pub struct QueueConsumer {
    api: Arc<dyn QueueApi>,
    relay: Arc<Relay>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub fn new(
        api: Arc<dyn QueueApi>,
        relay: Arc<Relay>,
        config: QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            relay,
            config,
            shutdown,
        }
    }

    /// Consume until shutdown is requested
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!(
            queue_url = ?self.config.url,
            batch_size = self.config.batch_size,
            visibility_timeout_secs = self.config.visibility_timeout_secs,
            "Starting queue consumer"
        );

        loop {
            // Only the long-poll races shutdown; received messages are always finished
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Queue consumer received shutdown signal");
                    break;
                }
                received = self.receive() => received,
            };

            match received {
                Ok(records) => {
                    self.process_batch(records).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive from queue");
                    metrics::counter!("relay_queue_receive_errors_total").increment(1);

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_error_backoff()) => {}
                    }
                }
            }
        }

        info!("Queue consumer stopped");
        Ok(())
    }

    /// Receive one batch and relay every message in it. Returns the outcomes in order.
    pub async fn poll_once(&self) -> Result<Vec<MessageOutcome>> {
        let records = self.receive().await?;
        Ok(self.process_batch(records).await)
    }

    async fn receive(&self) -> Result<Vec<QueueRecord>> {
        let records = self
            .api
            .receive(
                self.config.batch_size,
                self.config.wait_time_secs,
                self.config.visibility_timeout_secs,
            )
            .await?;

        if !records.is_empty() {
            debug!(count = records.len(), "Received messages");
        }

        Ok(records)
    }

    /// Relay received messages one by one. Once shutdown is requested the
    /// message in flight completes and the rest stay on the queue.
    async fn process_batch(&self, records: Vec<QueueRecord>) -> Vec<MessageOutcome> {
        let total = records.len();
        let mut outcomes = Vec::with_capacity(total);

        for record in records {
            if self.shutdown.is_cancelled() {
                info!(
                    remaining = total - outcomes.len(),
                    "Shutdown requested, leaving remaining messages for redelivery"
                );
                break;
            }

            let outcome = self.process(record).await;
            metrics::counter!("relay_queue_messages_total", "result" => outcome.as_str()).increment(1);
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Relay a single message and acknowledge it on success
    #[instrument(skip(self, record), fields(message_id = ?record.message_id))]
    async fn process(&self, record: QueueRecord) -> MessageOutcome {
        let receipt_handle = record.receipt_handle.clone();
        let invocation = InvocationRecord::single(record);

        if let Err(e) = self.relay.handle(&invocation).await {
            warn!(
                error = %e,
                kind = e.kind(),
                "Leaving message for redelivery"
            );
            return MessageOutcome::Released;
        }

        let Some(receipt_handle) = receipt_handle else {
            warn!("Message has no receipt handle, cannot acknowledge");
            return MessageOutcome::AckFailed;
        };

        match self.api.delete(&receipt_handle).await {
            Ok(()) => MessageOutcome::Acknowledged,
            Err(e) => {
                warn!(error = %e, "Failed to acknowledge message");
                MessageOutcome::AckFailed
            }
        }
    }
}
