//! Transport facade used by the application bus.
//!
//! `QueueTransport` owns the endpoint's input queue and its receiver, the
//! sender registry, and the set of queues this endpoint provisions. Queues the
//! endpoint owns are created once, on first use; queues owned by other
//! endpoints must already exist.

use crate::broker::{BrokerClient, QueueCreation};
use crate::config::{QueueSettings, TransportConfig};
use crate::error::TransportError;
use crate::message::{Envelope, MessageId, QueueName};
use crate::receiver::ReliableReceiver;
use crate::registry::ClientRegistry;
use crate::retry::{Sleeper, TokioSleeper};
use crate::sender::ReliableSender;
use crate::transaction::Transaction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Creates owned queues at most once per transport
struct Provisioner {
    broker: Arc<dyn BrokerClient>,
    settings: QueueSettings,
    provisioned: RwLock<HashMap<QueueName, Arc<OnceCell<()>>>>,
}

impl Provisioner {
    fn new(broker: Arc<dyn BrokerClient>, settings: QueueSettings) -> Self {
        Self {
            broker,
            settings,
            provisioned: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure(&self, queue: &QueueName) -> Result<(), TransportError> {
        let cell = {
            let provisioned = self.provisioned.read().await;
            provisioned.get(queue).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut provisioned = self.provisioned.write().await;
                Arc::clone(
                    provisioned
                        .entry(queue.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        cell.get_or_try_init(|| self.create(queue)).await?;
        Ok(())
    }

    async fn create(&self, queue: &QueueName) -> Result<(), TransportError> {
        let description = self.settings.to_description(queue.clone());

        match self.broker.create_queue(&description).await {
            Ok(QueueCreation::Created) => {
                info!(queue = %queue, "Queue created");
                Ok(())
            }
            Ok(QueueCreation::AlreadyExists) => {
                debug!(queue = %queue, "Queue already exists");
                Ok(())
            }
            Err(source) => Err(TransportError::Provisioning {
                queue: queue.to_string(),
                source,
            }),
        }
    }

    async fn is_provisioned(&self, queue: &QueueName) -> bool {
        let provisioned = self.provisioned.read().await;
        provisioned
            .get(queue)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }
}

/// Reliable send and receive over a leased-queue broker
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use queue_transport::{Envelope, InMemoryBroker, QueueName, QueueTransport, TransportConfig};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let config = TransportConfig {
///     input_queue: "orders".to_string(),
///     ..Default::default()
/// };
/// let transport = QueueTransport::start(Arc::new(InMemoryBroker::default()), config)
///     .await
///     .unwrap();
///
/// let orders = QueueName::new("orders".to_string()).unwrap();
/// let mut envelope = Envelope::new(Bytes::from("hello"));
/// let id = transport.send(&mut envelope, &orders, None).await.unwrap();
///
/// let received = transport.receive(None).await.unwrap().unwrap();
/// assert_eq!(received.correlation(), Some(id.as_str()));
/// # });
/// ```
pub struct QueueTransport {
    config: TransportConfig,
    input_queue: QueueName,
    owned_queues: HashSet<QueueName>,
    provisioner: Provisioner,
    sender: ReliableSender,
    receiver: ReliableReceiver,
}

impl QueueTransport {
    /// Start the transport with tokio-backed sleeps
    ///
    /// # Errors
    ///
    /// See [`QueueTransport::with_sleeper`].
    pub async fn start(
        broker: Arc<dyn BrokerClient>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Self::with_sleeper(broker, config, Arc::new(TokioSleeper)).await
    }

    /// Start the transport, sleeping through `sleeper` during backoff
    ///
    /// Validates `config`, provisions the input queue and opens its receiver.
    ///
    /// # Errors
    ///
    /// - `Configuration` / `Validation` for an unusable configuration
    /// - `Provisioning` if the input queue cannot be created
    /// - `Broker` if the receiver cannot be opened
    pub async fn with_sleeper(
        broker: Arc<dyn BrokerClient>,
        config: TransportConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let owned = config.owned_queue_names()?;
        let input_queue = config.effective_input_queue()?;

        let provisioner = Provisioner::new(Arc::clone(&broker), config.queue.clone());
        provisioner.ensure(&input_queue).await?;

        let receiver = broker
            .create_receiver(&input_queue)
            .await
            .map_err(|e| TransportError::from_broker(input_queue.as_str(), e))?;

        let registry = Arc::new(ClientRegistry::new(Arc::clone(&broker)));
        let sender = ReliableSender::new(registry, config.retry.policy(), Arc::clone(&sleeper));
        let receiver = ReliableReceiver::new(receiver, config.receive.settings(), sleeper);

        info!(
            input_queue = %input_queue,
            provider = ?broker.provider_type(),
            "Queue transport started"
        );

        Ok(Self {
            input_queue,
            owned_queues: owned.into_iter().collect(),
            provisioner,
            sender,
            receiver,
            config,
        })
    }

    /// Send `envelope` to `destination`, provisioning it first if this
    /// endpoint owns it
    ///
    /// # Errors
    ///
    /// `Provisioning` for an owned queue that cannot be created, otherwise
    /// the errors of [`ReliableSender::send`].
    pub async fn send(
        &self,
        envelope: &mut Envelope,
        destination: &QueueName,
        transaction: Option<&Transaction>,
    ) -> Result<MessageId, TransportError> {
        if self.owned_queues.contains(destination) {
            self.provisioner.ensure(destination).await?;
        }

        self.sender.send(envelope, destination, transaction).await
    }

    /// Receive at most one envelope from the input queue
    pub async fn receive(
        &self,
        transaction: Option<&Transaction>,
    ) -> Result<Option<Envelope>, TransportError> {
        self.receiver.receive(transaction).await
    }

    /// Create `queue` with the configured settings unless this transport
    /// already did
    pub async fn ensure_queue(&self, queue: &QueueName) -> Result<(), TransportError> {
        self.provisioner.ensure(queue).await
    }

    /// Check whether this transport has provisioned `queue`
    pub async fn is_provisioned(&self, queue: &QueueName) -> bool {
        self.provisioner.is_provisioned(queue).await
    }

    pub fn input_queue(&self) -> &QueueName {
        &self.input_queue
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl std::fmt::Debug for QueueTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTransport")
            .field("input_queue", &self.input_queue)
            .field("owned_queues", &self.owned_queues)
            .finish_non_exhaustive()
    }
}
