//! Reliable, transaction-aware sending.
//!
//! See [`ReliableSender::send`] for the send path and [`Delivery::run`] for
//! the throttling retry loop shared by immediate and committed sends.

use crate::broker::QueueSender;
use crate::codec;
use crate::error::TransportError;
use crate::message::{Envelope, MessageId, QueueName};
use crate::registry::ClientRegistry;
use crate::retry::{RetryPolicy, RetryState, Sleeper};
use crate::transaction::{PendingOperation, Transaction};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// An encoded envelope bound to a sender handle, delivered with linear
/// backoff while the broker is throttling.
pub struct Delivery {
    sender: Arc<dyn QueueSender>,
    payload: Bytes,
    message_id: MessageId,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Delivery {
    pub fn new(
        sender: Arc<dyn QueueSender>,
        payload: Bytes,
        message_id: MessageId,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            sender,
            payload,
            message_id,
            policy,
            sleeper,
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        self.sender.queue_name()
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Send the payload, backing off `attempts × base` on every busy signal
    ///
    /// # Errors
    ///
    /// - `DeliveryExhausted` once `max_delivery_count` attempts were throttled
    /// - `DestinationNotFound` if the queue disappeared
    /// - `Broker` for any other broker failure, without retry
    pub async fn run(&self) -> Result<(), TransportError> {
        let queue = self.queue_name();
        let mut retry_state = RetryState::new();

        loop {
            match self.sender.send(self.payload.clone()).await {
                Ok(()) => {
                    debug!(
                        queue = %queue,
                        message_id = %self.message_id,
                        throttled_attempts = retry_state.attempts,
                        "Message sent"
                    );
                    return Ok(());
                }
                Err(e) if e.is_busy() => {
                    let attempts = retry_state.record_throttle();
                    if !retry_state.can_retry(&self.policy) {
                        error!(
                            queue = %queue,
                            message_id = %self.message_id,
                            attempts,
                            "Delivery exhausted while broker kept throttling"
                        );
                        return Err(TransportError::DeliveryExhausted {
                            queue: queue.to_string(),
                            attempts,
                        });
                    }

                    let delay = retry_state.get_delay(&self.policy);
                    warn!(
                        queue = %queue,
                        message_id = %self.message_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Broker busy, backing off before retry"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        queue = %queue,
                        message_id = %self.message_id,
                        error = %e,
                        "Send failed"
                    );
                    return Err(TransportError::from_broker(queue.as_str(), e));
                }
            }
        }
    }
}

/// Sends envelopes through cached per-destination handles
pub struct ReliableSender {
    registry: Arc<ClientRegistry>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ReliableSender {
    pub fn new(registry: Arc<ClientRegistry>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            registry,
            policy,
            sleeper,
        }
    }

    /// Send `envelope` to `destination`
    ///
    /// The envelope receives a fresh id and its correlation header is stamped
    /// before encoding. Without an active transaction the send happens now;
    /// under an active transaction it is enlisted and nothing reaches the
    /// broker unless the transaction commits.
    ///
    /// # Returns
    ///
    /// The id assigned to this send attempt.
    ///
    /// # Errors
    ///
    /// - `DestinationNotFound` if the broker does not know the queue (never retried)
    /// - `DeliveryExhausted` / `Broker` from an immediate delivery
    /// - `Decode` if the envelope cannot be encoded
    /// - `TransactionInactive` if the transaction completed concurrently
    pub async fn send(
        &self,
        envelope: &mut Envelope,
        destination: &QueueName,
        transaction: Option<&Transaction>,
    ) -> Result<MessageId, TransportError> {
        let sender = self.registry.get_or_create(destination).await?;

        envelope.id = MessageId::new();
        let payload = codec::encode(envelope)?;
        let delivery = Delivery::new(
            sender,
            payload,
            envelope.id.clone(),
            self.policy.clone(),
            Arc::clone(&self.sleeper),
        );

        match transaction.filter(|tx| tx.is_active()) {
            Some(tx) => {
                tx.enlist_volatile(Box::new(PendingOperation::Send(delivery)))?;
                debug!(
                    queue = %destination,
                    message_id = %envelope.id,
                    transaction_id = %tx.id(),
                    "Send deferred until transaction commits"
                );
            }
            None => delivery.run().await?,
        }

        Ok(envelope.id.clone())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
