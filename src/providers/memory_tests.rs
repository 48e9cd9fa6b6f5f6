//! Tests for the in-memory broker.

use super::*;
use crate::message::EntityName;

fn queue(name: &str) -> EntityAddress {
    EntityAddress::Queue(EntityName::new(name.to_string()).unwrap())
}

fn payload(text: &str) -> WirePayload {
    WirePayload {
        body: bytes::Bytes::from(text.to_string()),
        content_type: crate::message::CONTENT_TYPE_JSON.to_string(),
        label: "test".to_string(),
    }
}

async fn queue_handles(
    broker: &InMemoryBroker,
    name: &str,
) -> (Arc<dyn BrokerSender>, Arc<dyn BrokerReceiver>) {
    let address = queue(name);
    broker.ensure_entity(&address).await.unwrap();
    let sender = broker.create_sender(&address).await.unwrap();
    let receiver = broker.create_receiver(&address).await.unwrap();
    (sender, receiver)
}

// ============================================================================
// Send and Peek-Lock Receive
// ============================================================================

mod send_receive {
    use super::*;

    /// Verify that a sent message is received intact with a usable receipt.
    #[tokio::test]
    async fn test_send_receive_round_trip() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let deliveries = receiver.receive(10).await.unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, payload("hello"));
        assert_eq!(deliveries[0].delivery_count, 1);
        assert!(!deliveries[0].receipt.handle().is_empty());
        assert!(!deliveries[0].receipt.is_expired());
    }

    /// Verify that an empty entity yields an empty batch, not an error.
    #[tokio::test]
    async fn test_receive_from_empty_entity() {
        let broker = InMemoryBroker::default();
        let (_, receiver) = queue_handles(&broker, "orders").await;

        let deliveries = receiver.receive(10).await.unwrap();
        assert!(deliveries.is_empty());
    }

    /// Verify that sends to an unprovisioned entity fail.
    #[tokio::test]
    async fn test_send_to_missing_entity() {
        let broker = InMemoryBroker::default();
        let sender = broker.create_sender(&queue("never-ensured")).await.unwrap();

        let result = sender.send(&payload("x")).await;
        assert!(matches!(result, Err(BrokerError::EntityNotFound { .. })));
    }

    /// Verify batch limits are honored.
    #[tokio::test]
    async fn test_receive_respects_batch_limit() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        for i in 0..5 {
            sender.send(&payload(&format!("m{}", i))).await.unwrap();
        }
        let first = receiver.receive(3).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = receiver.receive(10).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    /// Verify that a peek-locked message is invisible to further receives.
    #[tokio::test]
    async fn test_locked_message_is_invisible() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let first = receiver.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = receiver.receive(10).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(broker.in_flight_len(&queue("orders")), 1);
    }

    /// Verify a closed sender rejects further sends.
    #[tokio::test]
    async fn test_closed_sender_fails() {
        let broker = InMemoryBroker::default();
        let (sender, _) = queue_handles(&broker, "orders").await;

        sender.close().await.unwrap();
        let result = sender.send(&payload("x")).await;
        assert!(matches!(result, Err(BrokerError::ConnectionFailed { .. })));
    }
}

// ============================================================================
// Terminal Operations
// ============================================================================

mod terminal_operations {
    use super::*;

    /// Verify that completing removes the message for good.
    #[tokio::test]
    async fn test_complete_removes_message() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let delivery = receiver.receive(1).await.unwrap().remove(0);
        receiver.complete(&delivery.receipt).await.unwrap();

        assert_eq!(broker.in_flight_len(&queue("orders")), 0);
        assert_eq!(broker.queued_len(&queue("orders")), 0);
    }

    /// Verify that abandoning makes the message available again with an
    /// incremented delivery count.
    #[tokio::test]
    async fn test_abandon_redelivers() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let first = receiver.receive(1).await.unwrap().remove(0);
        receiver.abandon(&first.receipt).await.unwrap();

        let second = receiver.receive(1).await.unwrap().remove(0);
        assert_eq!(second.payload, payload("hello"));
        assert_eq!(second.delivery_count, 2);
    }

    /// Verify that dead-lettering moves the message aside.
    #[tokio::test]
    async fn test_dead_letter_moves_message() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("poison")).await.unwrap();
        let delivery = receiver.receive(1).await.unwrap().remove(0);
        receiver
            .dead_letter(&delivery.receipt, "handler rejected")
            .await
            .unwrap();

        assert_eq!(broker.dead_letter_len(&queue("orders")), 1);
        assert_eq!(broker.queued_len(&queue("orders")), 0);
        assert!(receiver.receive(1).await.unwrap().is_empty());
    }

    /// Verify that a terminal call on an unknown receipt fails.
    #[tokio::test]
    async fn test_unknown_receipt_fails() {
        let broker = InMemoryBroker::default();
        let (_, receiver) = queue_handles(&broker, "orders").await;

        let bogus = ReceiptHandle::new(
            "missing".to_string(),
            "orders".to_string(),
            Timestamp::now(),
        );
        assert!(matches!(
            receiver.complete(&bogus).await,
            Err(BrokerError::ReceiptNotFound { .. })
        ));
        assert!(matches!(
            receiver.abandon(&bogus).await,
            Err(BrokerError::ReceiptNotFound { .. })
        ));
    }
}

// ============================================================================
// Lease Expiry and Renewal
// ============================================================================

mod leases {
    use super::*;
    use std::time::Duration as StdDuration;

    fn short_lease_broker(lease_ms: i64) -> InMemoryBroker {
        InMemoryBroker::new(InMemoryBrokerConfig {
            lease: Duration::milliseconds(lease_ms),
            ..InMemoryBrokerConfig::default()
        })
    }

    /// Verify that an expired lock makes the message visible again.
    #[tokio::test]
    async fn test_expired_lock_redelivers() {
        let broker = short_lease_broker(80);
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let first = receiver.receive(1).await.unwrap().remove(0);
        assert_eq!(first.delivery_count, 1);

        tokio::time::sleep(StdDuration::from_millis(150)).await;
        let second = receiver.receive(1).await.unwrap().remove(0);
        assert_eq!(second.delivery_count, 2);
    }

    /// Verify that renewing the lock keeps the message invisible past the
    /// original lease.
    #[tokio::test]
    async fn test_renew_extends_lock() {
        let broker = short_lease_broker(150);
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("hello")).await.unwrap();
        let delivery = receiver.receive(1).await.unwrap().remove(0);

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        receiver.renew_lock(&delivery.receipt).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        // Past the original lease but inside the renewed one.
        assert!(receiver.receive(1).await.unwrap().is_empty());
        receiver.complete(&delivery.receipt).await.unwrap();
    }

    /// Verify the broker dead-letters messages past the delivery count cap.
    #[tokio::test]
    async fn test_max_delivery_count_dead_letters() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            lease: Duration::seconds(30),
            max_delivery_count: 1,
        });
        let (sender, receiver) = queue_handles(&broker, "orders").await;

        sender.send(&payload("flaky")).await.unwrap();
        let first = receiver.receive(1).await.unwrap().remove(0);
        receiver.abandon(&first.receipt).await.unwrap();

        // The cap of one delivery is already spent.
        assert!(receiver.receive(1).await.unwrap().is_empty());
        assert_eq!(broker.dead_letter_len(&queue("orders")), 1);
    }
}

// ============================================================================
// Topic Fan-Out
// ============================================================================

mod topics {
    use super::*;

    fn subscription(topic: &str, name: &str) -> EntityAddress {
        EntityAddress::Subscription {
            topic: EntityName::new(topic.to_string()).unwrap(),
            subscription: EntityName::new(name.to_string()).unwrap(),
        }
    }

    /// Verify that a topic send reaches every registered subscription.
    #[tokio::test]
    async fn test_topic_fans_out_to_subscriptions() {
        let broker = InMemoryBroker::default();
        let topic = EntityAddress::Topic(EntityName::new("events".to_string()).unwrap());
        let sub_a = subscription("events", "worker-a");
        let sub_b = subscription("events", "worker-b");

        broker.ensure_entity(&sub_a).await.unwrap();
        broker.ensure_entity(&sub_b).await.unwrap();
        let sender = broker.create_sender(&topic).await.unwrap();
        sender.send(&payload("broadcast")).await.unwrap();

        for address in [&sub_a, &sub_b] {
            let receiver = broker.create_receiver(address).await.unwrap();
            let deliveries = receiver.receive(10).await.unwrap();
            assert_eq!(deliveries.len(), 1);
            assert_eq!(deliveries[0].payload, payload("broadcast"));
        }
    }

    /// Verify that sends to an unregistered topic fail.
    #[tokio::test]
    async fn test_send_to_unregistered_topic() {
        let broker = InMemoryBroker::default();
        let topic = EntityAddress::Topic(EntityName::new("ghost".to_string()).unwrap());
        let sender = broker.create_sender(&topic).await.unwrap();

        let result = sender.send(&payload("x")).await;
        assert!(matches!(result, Err(BrokerError::EntityNotFound { .. })));
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

mod fault_injection {
    use super::*;

    /// Verify armed send faults fail transiently and then clear.
    #[tokio::test]
    async fn test_send_faults_clear_after_tripping() {
        let broker = InMemoryBroker::default();
        let (sender, _) = queue_handles(&broker, "orders").await;

        broker.fail_next_sends(2);
        for _ in 0..2 {
            let err = sender.send(&payload("x")).await.unwrap_err();
            assert!(err.is_transient());
        }
        sender.send(&payload("x")).await.unwrap();
        assert_eq!(broker.queued_len(&queue("orders")), 1);
    }

    /// Verify armed complete and abandon faults trip once each, leaving the
    /// message locked for the retry.
    #[tokio::test]
    async fn test_complete_and_abandon_faults() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;
        sender.send(&payload("x")).await.unwrap();
        let delivery = receiver.receive(1).await.unwrap().remove(0);

        broker.fail_next_completes(1);
        let err = receiver.complete(&delivery.receipt).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(broker.in_flight_len(&queue("orders")), 1);

        broker.fail_next_abandons(1);
        let err = receiver.abandon(&delivery.receipt).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(broker.in_flight_len(&queue("orders")), 1);

        receiver.complete(&delivery.receipt).await.unwrap();
        assert_eq!(broker.in_flight_len(&queue("orders")), 0);
    }

    /// Verify armed receive and dead-letter faults trip once each.
    #[tokio::test]
    async fn test_receive_and_dead_letter_faults() {
        let broker = InMemoryBroker::default();
        let (sender, receiver) = queue_handles(&broker, "orders").await;
        sender.send(&payload("x")).await.unwrap();

        broker.fail_next_receives(1);
        assert!(receiver.receive(1).await.is_err());
        let delivery = receiver.receive(1).await.unwrap().remove(0);

        broker.fail_next_dead_letters(1);
        assert!(receiver.dead_letter(&delivery.receipt, "r").await.is_err());
        // The failed call left the message locked; the retry succeeds.
        receiver.dead_letter(&delivery.receipt, "r").await.unwrap();
        assert_eq!(broker.dead_letter_len(&queue("orders")), 1);
    }
}
