//! Tests for the transport facade.

use super::*;
use crate::broker::LeasedMessage;
use crate::codec;
use crate::error::BrokerError;
use crate::providers::{InMemoryBroker, InMemoryConfig};
use crate::test_support::{
    queue, RecordingSleeper, ScriptedBroker, ScriptedLease, ScriptedReceiver, ScriptedSender,
};
use bytes::Bytes;

fn config_for(input: &str) -> TransportConfig {
    TransportConfig {
        input_queue: input.to_string(),
        ..Default::default()
    }
}

async fn start_scripted(
    broker: Arc<ScriptedBroker>,
    config: TransportConfig,
) -> Result<QueueTransport, TransportError> {
    QueueTransport::with_sleeper(broker, config, Arc::new(RecordingSleeper::default())).await
}

// ============================================================================
// Startup
// ============================================================================

mod startup {
    use super::*;

    /// Verify start provisions the input queue with the configured settings.
    #[tokio::test]
    async fn test_start_provisions_input_queue() {
        let broker = Arc::new(ScriptedBroker::new());
        let transport = start_scripted(broker.clone(), config_for("orders"))
            .await
            .unwrap();

        assert_eq!(transport.input_queue(), &queue("orders"));
        assert_eq!(broker.created_queue_names(), vec!["orders".to_string()]);
        assert!(transport.is_provisioned(&queue("orders")).await);
    }

    /// Verify an existing input queue is not a startup failure.
    #[tokio::test]
    async fn test_start_with_existing_input_queue() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.mark_existing(queue("orders"));

        let transport = start_scripted(broker.clone(), config_for("orders")).await;

        assert!(transport.is_ok());
    }

    /// Verify a failed input queue creation stops startup.
    #[tokio::test]
    async fn test_start_fails_when_provisioning_fails() {
        let broker = Arc::new(ScriptedBroker::new());
        broker.fail_queue_creation(BrokerError::AuthenticationFailed {
            message: "Manage claim required".to_string(),
        });

        let result = start_scripted(broker, config_for("orders")).await;

        match result {
            Err(TransportError::Provisioning { queue, source }) => {
                assert_eq!(queue, "orders");
                assert!(matches!(source, BrokerError::AuthenticationFailed { .. }));
            }
            other => panic!("Expected Provisioning, got: {:?}", other.map(|_| ())),
        }
    }

    /// Verify an invalid configuration is rejected before touching the broker.
    #[tokio::test]
    async fn test_start_rejects_invalid_configuration() {
        let broker = Arc::new(ScriptedBroker::new());
        let mut config = config_for("orders");
        config.receive.wait_secs = 0;

        let result = start_scripted(broker.clone(), config).await;

        assert!(matches!(result, Err(TransportError::Validation(_))));
        assert!(broker.created_queue_names().is_empty());
    }

    /// Verify per-instance endpoints receive from an individualized queue.
    #[tokio::test]
    async fn test_start_with_queue_per_instance() {
        let broker = Arc::new(ScriptedBroker::new());
        let config = TransportConfig {
            input_queue: "orders".to_string(),
            queue_per_instance: true,
            instance_id: Some("node-2".to_string()),
            ..Default::default()
        };

        let transport = start_scripted(broker.clone(), config).await.unwrap();

        assert_eq!(transport.input_queue(), &queue("orders-node-2"));
        assert_eq!(broker.created_queue_names(), vec!["orders-node-2".to_string()]);
    }
}

// ============================================================================
// Provisioning
// ============================================================================

mod provisioning {
    use super::*;

    /// Verify owned destinations are created once on first send.
    #[tokio::test]
    async fn test_owned_destination_provisioned_once() {
        let broker = Arc::new(ScriptedBroker::new());
        let handle = broker.register_sender(ScriptedSender::new(queue("billing")));
        let mut config = config_for("orders");
        config.owned_queues = vec!["billing".to_string()];
        let transport = start_scripted(broker.clone(), config).await.unwrap();

        assert!(!transport.is_provisioned(&queue("billing")).await);

        for _ in 0..3 {
            let mut envelope = Envelope::new(Bytes::from("invoice"));
            transport
                .send(&mut envelope, &queue("billing"), None)
                .await
                .unwrap();
        }

        assert_eq!(
            broker.created_queue_names(),
            vec!["orders".to_string(), "billing".to_string()]
        );
        assert_eq!(handle.calls(), 3);
        assert!(transport.is_provisioned(&queue("billing")).await);
    }

    /// Verify foreign destinations are never created by the sender.
    #[tokio::test]
    async fn test_foreign_destination_not_provisioned() {
        let broker = Arc::new(ScriptedBroker::new());
        let transport = start_scripted(broker.clone(), config_for("orders")).await.unwrap();

        let mut envelope = Envelope::new(Bytes::from("lost"));
        let result = transport
            .send(&mut envelope, &queue("elsewhere"), None)
            .await;

        match result {
            Err(TransportError::DestinationNotFound { queue }) => assert_eq!(queue, "elsewhere"),
            other => panic!("Expected DestinationNotFound, got: {:?}", other),
        }
        assert_eq!(broker.created_queue_names(), vec!["orders".to_string()]);
    }

    /// Verify ensure_queue only asks the broker once per queue.
    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let broker = Arc::new(ScriptedBroker::new());
        let transport = start_scripted(broker.clone(), config_for("orders")).await.unwrap();

        transport.ensure_queue(&queue("audit")).await.unwrap();
        transport.ensure_queue(&queue("audit")).await.unwrap();
        transport.ensure_queue(&queue("orders")).await.unwrap();

        assert_eq!(
            broker.created_queue_names(),
            vec!["orders".to_string(), "audit".to_string()]
        );
    }

    /// Verify a failed provisioning attempt is retried on the next call.
    #[tokio::test]
    async fn test_failed_provisioning_is_retried() {
        let broker = Arc::new(ScriptedBroker::new());
        let transport = start_scripted(broker.clone(), config_for("orders")).await.unwrap();

        broker.fail_queue_creation(BrokerError::ConnectionFailed {
            message: "reset".to_string(),
        });
        assert!(matches!(
            transport.ensure_queue(&queue("audit")).await,
            Err(TransportError::Provisioning { .. })
        ));
        assert!(!transport.is_provisioned(&queue("audit")).await);

        transport.ensure_queue(&queue("audit")).await.unwrap();
        assert!(transport.is_provisioned(&queue("audit")).await);
    }
}

// ============================================================================
// Receiving
// ============================================================================

mod receiving {
    use super::*;

    /// Verify receive reads from the input queue receiver.
    #[tokio::test]
    async fn test_receive_delegates_to_input_queue() {
        let broker = Arc::new(ScriptedBroker::new());
        let mut envelope = Envelope::new(Bytes::from("hello"));
        let payload = codec::encode(&mut envelope).unwrap();
        let lease = ScriptedLease::new(payload);
        let acks = lease.ack_counter();
        let lease: Box<dyn LeasedMessage> = Box::new(lease);
        let receiver = broker.register_receiver(ScriptedReceiver::new(
            queue("orders"),
            vec![Ok(Some(lease))],
        ));
        let mut config = config_for("orders");
        config.receive.wait_secs = 5;
        let transport = start_scripted(broker, config).await.unwrap();

        let received = transport.receive(None).await.unwrap().unwrap();

        assert_eq!(received.id, envelope.id);
        assert_eq!(received.body, Bytes::from("hello"));
        assert_eq!(acks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(receiver.waits(), vec![std::time::Duration::from_secs(5)]);
    }
}

// ============================================================================
// End to end over the in-memory broker
// ============================================================================

mod end_to_end {
    use super::*;

    async fn start_in_memory(broker: &InMemoryBroker) -> QueueTransport {
        let mut config = config_for("orders");
        config.receive.wait_secs = 1;
        QueueTransport::start(Arc::new(broker.clone()), config)
            .await
            .unwrap()
    }

    /// Verify a message sent with an empty correlation id is received with
    /// the assigned id as its correlation id.
    #[tokio::test]
    async fn test_send_then_receive() {
        let broker = InMemoryBroker::new(InMemoryConfig::default());
        let transport = start_in_memory(&broker).await;

        let mut envelope = Envelope::new(Bytes::from("hello")).with_correlation_id(String::new());
        let id = transport
            .send(&mut envelope, &queue("orders"), None)
            .await
            .unwrap();

        assert_eq!(broker.queue_stats(&queue("orders")).unwrap().active, 1);

        let received = transport.receive(None).await.unwrap().unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.correlation(), Some(id.as_str()));
        assert_eq!(received.body, Bytes::from("hello"));

        let stats = broker.queue_stats(&queue("orders")).unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.in_flight, 0);
    }

    /// Verify an undecodable payload fails every delivery and is
    /// dead-lettered once the queue's delivery limit is reached.
    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_is_dead_lettered() {
        let broker = InMemoryBroker::default();
        let mut config = config_for("orders");
        config.queue.max_delivery_count = 3;
        config.queue.lock_duration_ms = 1_000;
        config.receive.wait_secs = 5;
        let transport = QueueTransport::start(Arc::new(broker.clone()), config)
            .await
            .unwrap();

        let raw = broker.create_sender(&queue("orders")).await.unwrap();
        raw.send(Bytes::from("not an envelope")).await.unwrap();

        for _ in 0..3 {
            let result = transport.receive(None).await;
            assert!(
                matches!(result, Err(TransportError::Decode(_))),
                "Expected a decode error, got: {:?}",
                result
            );
        }

        assert!(transport.receive(None).await.unwrap().is_none());

        let dead = broker.dead_letters(&queue("orders"));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, Bytes::from("not an envelope"));
        assert_eq!(dead[0].delivery_count, 3);
        assert_eq!(dead[0].reason, "MaxDeliveryCountExceeded");

        let stats = broker.queue_stats(&queue("orders")).unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_lettered, 1);
    }

    /// Verify an empty input queue yields nothing after the wait.
    #[tokio::test(start_paused = true)]
    async fn test_receive_from_empty_queue() {
        let broker = InMemoryBroker::default();
        let transport = start_in_memory(&broker).await;

        let received = transport.receive(None).await.unwrap();

        assert!(received.is_none());
    }

    /// Verify sends and acknowledgments inside a transaction only take
    /// effect on commit.
    #[tokio::test]
    async fn test_transactional_send_and_receive() {
        let broker = InMemoryBroker::default();
        let transport = start_in_memory(&broker).await;

        let send_tx = Transaction::new();
        let mut envelope = Envelope::new(Bytes::from("hello"));
        transport
            .send(&mut envelope, &queue("orders"), Some(&send_tx))
            .await
            .unwrap();
        assert_eq!(broker.queue_stats(&queue("orders")).unwrap().active, 0);

        send_tx.commit().await.unwrap();
        assert_eq!(broker.queue_stats(&queue("orders")).unwrap().active, 1);

        let receive_tx = Transaction::new();
        let received = transport.receive(Some(&receive_tx)).await.unwrap();
        assert!(received.is_some());
        assert_eq!(broker.queue_stats(&queue("orders")).unwrap().in_flight, 1);

        receive_tx.commit().await.unwrap();
        let stats = broker.queue_stats(&queue("orders")).unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.in_flight, 0);
    }

    /// Verify a rolled back receive leaves the message leased for redelivery.
    #[tokio::test]
    async fn test_rolled_back_receive_keeps_lease() {
        let broker = InMemoryBroker::default();
        let transport = start_in_memory(&broker).await;

        let mut envelope = Envelope::new(Bytes::from("hello"));
        transport
            .send(&mut envelope, &queue("orders"), None)
            .await
            .unwrap();

        let tx = Transaction::new();
        assert!(transport.receive(Some(&tx)).await.unwrap().is_some());
        tx.rollback().await.unwrap();

        assert_eq!(broker.queue_stats(&queue("orders")).unwrap().in_flight, 1);
    }
}
