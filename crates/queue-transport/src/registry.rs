//! Destination-keyed cache of sender handles.

use crate::broker::{BrokerClient, QueueSender};
use crate::error::TransportError;
use crate::message::QueueName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

type SenderCell = Arc<OnceCell<Arc<dyn QueueSender>>>;

/// Creates one sender handle per destination, lazily, and keeps it for the
/// lifetime of the registry.
///
/// Each destination owns its own create-once cell, so a slow first access to
/// one queue never holds up first access to another. Failed creations leave
/// the cell empty and the next caller tries again.
pub struct ClientRegistry {
    broker: Arc<dyn BrokerClient>,
    senders: RwLock<HashMap<QueueName, SenderCell>>,
}

impl ClientRegistry {
    /// Create an empty registry backed by `broker`
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Get the cached sender for `queue`, creating it on first access
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DestinationNotFound` if the broker reports the
    /// queue does not exist.
    pub async fn get_or_create(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn QueueSender>, TransportError> {
        let cell = self.cell_for(queue).await;

        let sender = cell
            .get_or_try_init(|| async {
                debug!(queue = %queue, "Creating sender handle");
                self.broker.create_sender(queue).await
            })
            .await
            .map_err(|e| TransportError::from_broker(queue.as_str(), e))?;

        Ok(Arc::clone(sender))
    }

    /// Check whether a live handle is cached for `queue`
    pub async fn contains(&self, queue: &QueueName) -> bool {
        let senders = self.senders.read().await;
        senders
            .get(queue)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Get or insert the create-once cell for a queue (double-checked)
    async fn cell_for(&self, queue: &QueueName) -> SenderCell {
        // First check with read lock
        {
            let senders = self.senders.read().await;
            if let Some(cell) = senders.get(queue) {
                return Arc::clone(cell);
            }
        }

        // Another task may have inserted the cell between the two locks
        let mut senders = self.senders.write().await;
        Arc::clone(
            senders
                .entry(queue.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("provider", &self.broker.provider_type())
            .finish_non_exhaustive()
    }
}
