//! Throttling-aware, transaction-aware receiving.

use crate::broker::{Acknowledgement, LeasedMessage, QueueReceiver};
use crate::codec;
use crate::error::TransportError;
use crate::message::{Envelope, QueueName};
use crate::retry::Sleeper;
use crate::transaction::{PendingOperation, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Timing of a single receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Longest time to wait for a message
    pub wait: Duration,
    /// Pause after the broker signalled throttling
    pub throttle_backoff: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            throttle_backoff: Duration::from_secs(10),
        }
    }
}

/// Pulls leased messages from one queue and decodes them into envelopes
pub struct ReliableReceiver {
    receiver: Arc<dyn QueueReceiver>,
    settings: ReceiveSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl ReliableReceiver {
    pub fn new(
        receiver: Arc<dyn QueueReceiver>,
        settings: ReceiveSettings,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            receiver,
            settings,
            sleeper,
        }
    }

    pub fn queue_name(&self) -> &QueueName {
        self.receiver.queue_name()
    }

    /// Receive at most one envelope
    ///
    /// Returns `Ok(None)` when nothing arrived within the wait, or when the
    /// broker was throttling (after pausing for the throttle backoff). The
    /// caller is expected to poll again.
    ///
    /// Without an active transaction the message is acknowledged right away;
    /// under an active transaction the acknowledgement is enlisted and the
    /// envelope is returned with the lease still held.
    ///
    /// A payload that cannot be decoded is not acknowledged: its lease expires
    /// and the broker dead-letters it once its delivery limit is exceeded.
    ///
    /// # Errors
    ///
    /// - `Decode` for a structurally invalid payload
    /// - `Broker` for connection or acknowledgement failures other than lease loss
    pub async fn receive(
        &self,
        transaction: Option<&Transaction>,
    ) -> Result<Option<Envelope>, TransportError> {
        let queue = self.queue_name();

        let leased = match self.receiver.receive(self.settings.wait).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(e) if e.is_busy() => {
                warn!(
                    queue = %queue,
                    backoff_ms = self.settings.throttle_backoff.as_millis() as u64,
                    "Broker busy while receiving, backing off"
                );
                self.sleeper.sleep(self.settings.throttle_backoff).await;
                return Ok(None);
            }
            Err(e) => return Err(TransportError::from_broker(queue.as_str(), e)),
        };

        let envelope = match codec::decode(leased.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %queue,
                    lock_token = leased.lock_token(),
                    delivery_count = leased.delivery_count(),
                    error = %e,
                    "Undecodable message left unacknowledged for broker dead-lettering"
                );
                return Err(e.into());
            }
        };

        match transaction.filter(|tx| tx.is_active()) {
            Some(tx) => {
                debug!(
                    queue = %queue,
                    message_id = %envelope.id,
                    transaction_id = %tx.id(),
                    "Acknowledgement deferred until transaction commits"
                );
                tx.enlist_volatile(Box::new(PendingOperation::Ack(leased)))?;
            }
            None => {
                acknowledge(leased.as_ref()).await?;
            }
        }

        Ok(Some(envelope))
    }

    pub fn settings(&self) -> &ReceiveSettings {
        &self.settings
    }
}

/// Acknowledge a leased message, treating lease loss as already finalized
pub(crate) async fn acknowledge(
    message: &dyn LeasedMessage,
) -> Result<Acknowledgement, TransportError> {
    match message.acknowledge().await {
        Ok(Acknowledgement::Completed) => {
            debug!(lock_token = message.lock_token(), "Message acknowledged");
            Ok(Acknowledgement::Completed)
        }
        Ok(Acknowledgement::LeaseLost) => {
            // Another consumer or the lock timeout finalized it first
            warn!(
                lock_token = message.lock_token(),
                delivery_count = message.delivery_count(),
                "Lease already lost when acknowledging"
            );
            Ok(Acknowledgement::LeaseLost)
        }
        Err(e) => Err(TransportError::Broker(e)),
    }
}
