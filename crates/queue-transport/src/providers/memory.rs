//! In-memory peek-lock broker for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Provisions queues from a [`QueueDescription`]
//! - Hands out messages under a lease of the queue's lock duration
//! - Redelivers messages whose lease expired, counting each delivery
//! - Dead-letters messages past the queue's `max_delivery_count` or TTL
//! - Signals throttling once a queue holds `max_queue_size` messages
//!
//! Time is measured with [`tokio::time::Instant`], so tests running with a
//! paused clock can drive lease expiry deterministically.

use crate::broker::{
    Acknowledgement, BrokerClient, LeasedMessage, ProviderType, QueueCreation, QueueDescription,
    QueueReceiver, QueueSender,
};
use crate::error::BrokerError;
use crate::message::QueueName;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const PROVIDER: &str = "InMemory";

/// In-memory broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Messages (available plus leased) a queue accepts before reporting busy
    pub max_queue_size: usize,
    /// Keep dead-lettered messages for inspection instead of discarding them
    pub enable_dead_letter_queue: bool,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
            enable_dead_letter_queue: true,
        }
    }
}

/// Point-in-time counters for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub active: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// A message moved to the dead-letter sub-queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub body: Bytes,
    pub delivery_count: u32,
    pub reason: String,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
        }
    }

    fn queue_mut(&mut self, queue: &QueueName) -> Result<&mut InMemoryQueue, BrokerError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: queue.to_string(),
            })
    }
}

/// Internal state for a single queue
struct InMemoryQueue {
    description: QueueDescription,
    /// Available messages (FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Leased messages keyed by lock token
    in_flight: HashMap<String, InFlightMessage>,
    dead_letter: VecDeque<DeadLetteredMessage>,
    keep_dead_letters: bool,
    /// Wakes receivers parked on an empty queue
    arrivals: Arc<Notify>,
}

impl InMemoryQueue {
    fn new(description: QueueDescription, keep_dead_letters: bool) -> Self {
        Self {
            description,
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letter: VecDeque::new(),
            keep_dead_letters,
            arrivals: Arc::new(Notify::new()),
        }
    }

    fn depth(&self) -> usize {
        self.messages.len() + self.in_flight.len()
    }

    fn enqueue(&mut self, body: Bytes, now: Instant) {
        let expires_at = now.checked_add(self.description.default_message_ttl);
        self.messages.push_back(StoredMessage {
            body,
            delivery_count: 0,
            expires_at,
        });
        self.arrivals.notify_one();
    }

    /// Lease the next available message, after settling expired state
    fn lease_next(&mut self, now: Instant) -> Option<InMemoryLeaseParts> {
        self.reclaim_expired_leases(now);
        self.purge_expired_messages(now);

        let mut message = self.messages.pop_front()?;
        message.delivery_count += 1;

        let lock_token = uuid::Uuid::new_v4().to_string();
        let parts = InMemoryLeaseParts {
            lock_token: lock_token.clone(),
            body: message.body.clone(),
            delivery_count: message.delivery_count,
        };
        let lock_expires_at = now + self.description.lock_duration;
        self.in_flight.insert(
            lock_token,
            InFlightMessage {
                message,
                lock_expires_at,
            },
        );

        Some(parts)
    }

    /// Remove a leased message; a missing or expired token means the lease is gone
    fn complete(&mut self, lock_token: &str, now: Instant) -> Acknowledgement {
        self.reclaim_expired_leases(now);
        match self.in_flight.remove(lock_token) {
            Some(_) => Acknowledgement::Completed,
            None => Acknowledgement::LeaseLost,
        }
    }

    fn reclaim_expired_leases(&mut self, now: Instant) {
        let mut expired: Vec<(Instant, String)> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.is_expired(now))
            .map(|(token, leased)| (leased.lock_expires_at, token.clone()))
            .collect();

        // Latest first, so the earliest lease ends up at the front
        expired.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, token) in expired {
            let Some(leased) = self.in_flight.remove(&token) else {
                continue;
            };
            let message = leased.message;
            if message.delivery_count >= self.description.max_delivery_count {
                self.dead_letter(message, "MaxDeliveryCountExceeded");
            } else {
                debug!(
                    queue = %self.description.name,
                    delivery_count = message.delivery_count,
                    "Lease expired, message available for redelivery"
                );
                self.messages.push_front(message);
            }
        }
    }

    fn purge_expired_messages(&mut self, now: Instant) {
        if !self.messages.iter().any(|m| m.is_expired(now)) {
            return;
        }

        let (expired, live): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.is_expired(now));
        self.messages = live;

        for message in expired {
            if self.description.dead_lettering_on_message_expiration {
                self.dead_letter(message, "TTLExpiredException");
            }
        }
    }

    fn dead_letter(&mut self, message: StoredMessage, reason: &str) {
        warn!(
            queue = %self.description.name,
            delivery_count = message.delivery_count,
            reason,
            "Message dead-lettered"
        );
        if self.keep_dead_letters {
            self.dead_letter.push_back(DeadLetteredMessage {
                body: message.body,
                delivery_count: message.delivery_count,
                reason: reason.to_string(),
            });
        }
    }

    /// Earliest instant at which an outstanding lease lapses
    fn next_lock_expiry(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .map(|leased| leased.lock_expires_at)
            .min()
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            active: self.messages.len(),
            in_flight: self.in_flight.len(),
            dead_lettered: self.dead_letter.len(),
        }
    }
}

struct StoredMessage {
    body: Bytes,
    delivery_count: u32,
    /// `None` when the TTL is too large to represent
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

struct InFlightMessage {
    message: StoredMessage,
    lock_expires_at: Instant,
}

impl InFlightMessage {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.lock_expires_at
    }
}

struct InMemoryLeaseParts {
    lock_token: String,
    body: Bytes,
    delivery_count: u32,
}

type SharedStorage = Arc<RwLock<QueueStorage>>;

fn write(storage: &SharedStorage) -> RwLockWriteGuard<'_, QueueStorage> {
    storage.write().unwrap_or_else(PoisonError::into_inner)
}

fn read(storage: &SharedStorage) -> RwLockReadGuard<'_, QueueStorage> {
    storage.read().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker shared by every handle it creates
#[derive(Clone)]
pub struct InMemoryBroker {
    storage: SharedStorage,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new(config))),
        }
    }

    /// Names of all provisioned queues, sorted
    pub fn queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = read(&self.storage).queues.keys().cloned().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    /// Description a queue was provisioned with
    pub fn queue_description(&self, queue: &QueueName) -> Option<QueueDescription> {
        read(&self.storage)
            .queues
            .get(queue)
            .map(|q| q.description.clone())
    }

    /// Counters for a queue, after settling expired leases
    pub fn queue_stats(&self, queue: &QueueName) -> Option<QueueStats> {
        let mut storage = write(&self.storage);
        let now = Instant::now();
        storage.queues.get_mut(queue).map(|q| {
            q.reclaim_expired_leases(now);
            q.purge_expired_messages(now);
            q.stats()
        })
    }

    /// Messages currently in a queue's dead-letter sub-queue
    pub fn dead_letters(&self, queue: &QueueName) -> Vec<DeadLetteredMessage> {
        read(&self.storage)
            .queues
            .get(queue)
            .map(|q| q.dead_letter.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("queues", &read(&self.storage).queues.len())
            .finish()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn create_queue(
        &self,
        description: &QueueDescription,
    ) -> Result<QueueCreation, BrokerError> {
        let mut storage = write(&self.storage);
        if storage.queues.contains_key(&description.name) {
            return Ok(QueueCreation::AlreadyExists);
        }

        let keep_dead_letters = storage.config.enable_dead_letter_queue;
        storage.queues.insert(
            description.name.clone(),
            InMemoryQueue::new(description.clone(), keep_dead_letters),
        );
        debug!(queue = %description.name, "Queue created");
        Ok(QueueCreation::Created)
    }

    async fn create_sender(&self, queue: &QueueName) -> Result<Arc<dyn QueueSender>, BrokerError> {
        write(&self.storage).queue_mut(queue)?;
        Ok(Arc::new(InMemorySender {
            storage: Arc::clone(&self.storage),
            queue: queue.clone(),
        }))
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn QueueReceiver>, BrokerError> {
        write(&self.storage).queue_mut(queue)?;
        Ok(Arc::new(InMemoryReceiver {
            storage: Arc::clone(&self.storage),
            queue: queue.clone(),
        }))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

// ============================================================================
// Handles
// ============================================================================

struct InMemorySender {
    storage: SharedStorage,
    queue: QueueName,
}

#[async_trait]
impl QueueSender for InMemorySender {
    async fn send(&self, payload: Bytes) -> Result<(), BrokerError> {
        let max_size = ProviderType::InMemory.max_message_size();
        if payload.len() > max_size {
            return Err(BrokerError::Provider {
                provider: PROVIDER.to_string(),
                code: "MessageSizeExceeded".to_string(),
                message: format!("{} bytes exceeds limit of {}", payload.len(), max_size),
            });
        }

        let mut storage = write(&self.storage);
        let max_queue_size = storage.config.max_queue_size;
        let queue = storage.queue_mut(&self.queue)?;

        if queue.depth() >= max_queue_size {
            return Err(BrokerError::Busy {
                message: format!("queue '{}' holds {} messages", self.queue, queue.depth()),
            });
        }

        queue.enqueue(payload, Instant::now());
        Ok(())
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

struct InMemoryReceiver {
    storage: SharedStorage,
    queue: QueueName,
}

#[async_trait]
impl QueueReceiver for InMemoryReceiver {
    async fn receive(&self, wait: Duration) -> Result<Option<Box<dyn LeasedMessage>>, BrokerError> {
        // A wait too long to represent has no deadline
        let deadline = Instant::now().checked_add(wait);

        loop {
            let (arrivals, wake_at) = {
                let mut storage = write(&self.storage);
                let queue = storage.queue_mut(&self.queue)?;
                let now = Instant::now();

                if let Some(parts) = queue.lease_next(now) {
                    return Ok(Some(Box::new(InMemoryLease {
                        storage: Arc::clone(&self.storage),
                        queue: self.queue.clone(),
                        parts,
                    })));
                }

                if deadline.is_some_and(|deadline| now >= deadline) {
                    return Ok(None);
                }

                // Wake early when a lease lapses so its message can be redelivered
                let wake_at = match (queue.next_lock_expiry(), deadline) {
                    (Some(expiry), Some(deadline)) => Some(expiry.min(deadline)),
                    (expiry, deadline) => expiry.or(deadline),
                };
                (Arc::clone(&queue.arrivals), wake_at)
            };

            match wake_at {
                Some(wake_at) => {
                    let _ = tokio::time::timeout_at(wake_at, arrivals.notified()).await;
                }
                None => arrivals.notified().await,
            }
        }
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

struct InMemoryLease {
    storage: SharedStorage,
    queue: QueueName,
    parts: InMemoryLeaseParts,
}

#[async_trait]
impl LeasedMessage for InMemoryLease {
    fn body(&self) -> &Bytes {
        &self.parts.body
    }

    fn lock_token(&self) -> &str {
        &self.parts.lock_token
    }

    fn delivery_count(&self) -> u32 {
        self.parts.delivery_count
    }

    async fn acknowledge(&self) -> Result<Acknowledgement, BrokerError> {
        let mut storage = write(&self.storage);
        let queue = storage.queue_mut(&self.queue)?;
        Ok(queue.complete(&self.parts.lock_token, Instant::now()))
    }
}
