//! Scripted broker doubles shared by the unit tests.

use crate::broker::{
    Acknowledgement, BrokerClient, LeasedMessage, ProviderType, QueueCreation, QueueDescription,
    QueueReceiver, QueueSender,
};
use crate::error::BrokerError;
use crate::message::QueueName;
use crate::retry::Sleeper;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

pub fn busy() -> BrokerError {
    BrokerError::Busy {
        message: "server busy".to_string(),
    }
}

// ============================================================================
// Sleeper
// ============================================================================

/// Sleeper that records requested durations and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Sender that replays scripted results, then succeeds (or stays busy)
pub struct ScriptedSender {
    queue: QueueName,
    results: Mutex<VecDeque<Result<(), BrokerError>>>,
    always_busy: bool,
    pub send_calls: AtomicU32,
    pub sent: Mutex<Vec<Bytes>>,
}

impl ScriptedSender {
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            results: Mutex::new(VecDeque::new()),
            always_busy: false,
            send_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always_busy(queue: QueueName) -> Self {
        Self {
            always_busy: true,
            ..Self::new(queue)
        }
    }

    pub fn with_results(queue: QueueName, results: Vec<Result<(), BrokerError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Self::new(queue)
        }
    }

    pub fn calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueSender for ScriptedSender {
    async fn send(&self, payload: Bytes) -> Result<(), BrokerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = self.results.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None if self.always_busy => Err(busy()),
            None => Ok(()),
        };

        if result.is_ok() {
            self.sent.lock().unwrap().push(payload);
        }
        result
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

// ============================================================================
// Leased message and receiver
// ============================================================================

/// Leased message with a scripted acknowledgement result
pub struct ScriptedLease {
    body: Bytes,
    token: String,
    delivery_count: u32,
    outcome: Mutex<Option<Result<Acknowledgement, BrokerError>>>,
    ack_calls: Arc<AtomicU32>,
}

impl ScriptedLease {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            token: uuid::Uuid::new_v4().to_string(),
            delivery_count: 1,
            outcome: Mutex::new(None),
            ack_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_outcome(self, outcome: Result<Acknowledgement, BrokerError>) -> Self {
        *self.outcome.lock().unwrap() = Some(outcome);
        self
    }

    /// Counter that stays observable after the lease is handed to a receiver
    pub fn ack_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.ack_calls)
    }
}

#[async_trait]
impl LeasedMessage for ScriptedLease {
    fn body(&self) -> &Bytes {
        &self.body
    }

    fn lock_token(&self) -> &str {
        &self.token
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn acknowledge(&self) -> Result<Acknowledgement, BrokerError> {
        self.ack_calls.fetch_add(1, Ordering::SeqCst);
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(Acknowledgement::Completed))
    }
}

type ReceiveResult = Result<Option<Box<dyn LeasedMessage>>, BrokerError>;

/// Receiver that replays scripted results, then reports an empty queue
pub struct ScriptedReceiver {
    queue: QueueName,
    results: Mutex<VecDeque<ReceiveResult>>,
    pub waits: Mutex<Vec<Duration>>,
}

impl ScriptedReceiver {
    pub fn new(queue: QueueName, results: Vec<ReceiveResult>) -> Self {
        Self {
            queue,
            results: Mutex::new(results.into()),
            waits: Mutex::new(Vec::new()),
        }
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueReceiver for ScriptedReceiver {
    async fn receive(&self, wait: Duration) -> ReceiveResult {
        self.waits.lock().unwrap().push(wait);
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Broker double handing out pre-registered senders and receivers
#[derive(Default)]
pub struct ScriptedBroker {
    senders: Mutex<HashMap<QueueName, Arc<ScriptedSender>>>,
    receivers: Mutex<HashMap<QueueName, Arc<ScriptedReceiver>>>,
    existing_queues: Mutex<HashSet<QueueName>>,
    creation_gates: Mutex<HashMap<QueueName, Arc<Notify>>>,
    creation_delay: Option<Duration>,
    create_queue_error: Mutex<Option<BrokerError>>,
    pub sender_creations: AtomicU32,
    pub created_queues: Mutex<Vec<QueueDescription>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow down sender creation so concurrent callers overlap
    pub fn with_creation_delay(delay: Duration) -> Self {
        Self {
            creation_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn register_sender(&self, sender: ScriptedSender) -> Arc<ScriptedSender> {
        let sender = Arc::new(sender);
        self.senders
            .lock()
            .unwrap()
            .insert(sender.queue.clone(), Arc::clone(&sender));
        sender
    }

    pub fn register_receiver(&self, receiver: ScriptedReceiver) -> Arc<ScriptedReceiver> {
        let receiver = Arc::new(receiver);
        self.receivers
            .lock()
            .unwrap()
            .insert(receiver.queue.clone(), Arc::clone(&receiver));
        receiver
    }

    pub fn mark_existing(&self, queue: QueueName) {
        self.existing_queues.lock().unwrap().insert(queue);
    }

    pub fn fail_queue_creation(&self, error: BrokerError) {
        *self.create_queue_error.lock().unwrap() = Some(error);
    }

    /// Block sender creation for `queue` until the returned notify fires
    pub fn gate_creation(&self, queue: QueueName) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.creation_gates
            .lock()
            .unwrap()
            .insert(queue, Arc::clone(&gate));
        gate
    }

    pub fn creations(&self) -> u32 {
        self.sender_creations.load(Ordering::SeqCst)
    }

    pub fn created_queue_names(&self) -> Vec<String> {
        self.created_queues
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.name.to_string())
            .collect()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn create_queue(
        &self,
        description: &QueueDescription,
    ) -> Result<QueueCreation, BrokerError> {
        if let Some(error) = self.create_queue_error.lock().unwrap().take() {
            return Err(error);
        }

        self.created_queues.lock().unwrap().push(description.clone());
        let inserted = self
            .existing_queues
            .lock()
            .unwrap()
            .insert(description.name.clone());

        Ok(if inserted {
            QueueCreation::Created
        } else {
            QueueCreation::AlreadyExists
        })
    }

    async fn create_sender(&self, queue: &QueueName) -> Result<Arc<dyn QueueSender>, BrokerError> {
        self.sender_creations.fetch_add(1, Ordering::SeqCst);

        let gate = self.creation_gates.lock().unwrap().get(queue).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(delay) = self.creation_delay {
            tokio::time::sleep(delay).await;
        }

        let sender = self.senders.lock().unwrap().get(queue).cloned();
        match sender {
            Some(sender) => Ok(sender as Arc<dyn QueueSender>),
            None => Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            }),
        }
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn QueueReceiver>, BrokerError> {
        let receiver = self.receivers.lock().unwrap().get(queue).cloned();
        match receiver {
            Some(receiver) => Ok(receiver as Arc<dyn QueueReceiver>),
            None => Ok(Arc::new(ScriptedReceiver::new(queue.clone(), Vec::new()))),
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
