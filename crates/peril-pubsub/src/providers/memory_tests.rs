//! Tests for the in-memory broker.

use super::*;
use crate::broker::QueueArguments;
use std::time::Duration;

fn durable_options() -> QueueOptions {
    QueueOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        arguments: QueueArguments {
            dead_letter_exchange: Some("dlx".to_string()),
        },
    }
}

fn transient_options() -> QueueOptions {
    QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
        arguments: QueueArguments::default(),
    }
}

/// Broker with a topic, a direct and a fanout dead-letter exchange
async fn setup() -> (InMemoryBroker, InMemoryConnection, Arc<dyn BrokerChannel>) {
    let broker = InMemoryBroker::new();
    let connection = broker.connect();
    let channel = connection.open_channel().await.unwrap();

    channel
        .declare_exchange("topic", ExchangeKind::Topic, true)
        .await
        .unwrap();
    channel
        .declare_exchange("direct", ExchangeKind::Direct, true)
        .await
        .unwrap();
    channel
        .declare_exchange("dlx", ExchangeKind::Fanout, true)
        .await
        .unwrap();

    (broker, connection, channel)
}

async fn publish(channel: &Arc<dyn BrokerChannel>, exchange: &str, key: &str, body: &'static str) {
    channel
        .publish(
            exchange,
            key,
            Bytes::from_static(body.as_bytes()),
            &MessageProperties::new("text/plain"),
        )
        .await
        .unwrap();
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery should arrive")
        .expect("stream should be open")
        .expect("delivery should not be an error")
}

// ============================================================================
// Topic Matching Tests
// ============================================================================

mod topic_matching {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("pause", "pause"));
        assert!(!topic_matches("pause", "pause.alice"));
    }

    #[test]
    fn test_star_matches_exactly_one_segment() {
        assert!(topic_matches("pause.*", "pause.alice"));
        assert!(!topic_matches("pause.*", "pause"));
        assert!(!topic_matches("pause.*", "pause.alice.bob"));
        assert!(topic_matches("*.alice", "army_moves.alice"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_segments() {
        assert!(topic_matches("game_logs.#", "game_logs"));
        assert!(topic_matches("game_logs.#", "game_logs.alice"));
        assert!(topic_matches("game_logs.#", "game_logs.alice.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.alice", "war.alice"));
        assert!(!topic_matches("game_logs.#", "war.alice"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(topic_matches("*.#.end", "a.end"));
        assert!(topic_matches("*.#.end", "a.b.c.end"));
        assert!(!topic_matches("*.#.end", "end"));
    }
}

// ============================================================================
// Declaration Tests
// ============================================================================

mod declaration {
    use super::*;

    /// Verify that re-declaring a queue with the same options is a no-op.
    #[tokio::test]
    async fn test_queue_declare_is_idempotent() {
        let (broker, _connection, channel) = setup().await;

        channel.declare_queue("war", &durable_options()).await.unwrap();
        publish(&channel, "", "war", "hello").await;

        let declared = channel.declare_queue("war", &durable_options()).await.unwrap();
        assert_eq!(declared.message_count, 1);
        assert_eq!(broker.queue_depth("war"), Some(1));
    }

    /// Verify that a durability mismatch against an existing queue fails.
    #[tokio::test]
    async fn test_queue_declare_mismatch_fails() {
        let (_broker, _connection, channel) = setup().await;

        channel.declare_queue("war", &durable_options()).await.unwrap();
        let mut other = durable_options();
        other.durable = false;

        let result = channel.declare_queue("war", &other).await;
        assert!(matches!(result, Err(BrokerError::PreconditionFailed { .. })));
    }

    /// Verify that exclusive queues are locked to their connection.
    #[tokio::test]
    async fn test_exclusive_queue_is_locked_to_connection() {
        let (broker, _connection, channel) = setup().await;
        channel
            .declare_queue("pause.alice", &transient_options())
            .await
            .unwrap();

        let intruder = broker.connect().open_channel().await.unwrap();
        let result = intruder.declare_queue("pause.alice", &transient_options()).await;
        assert!(matches!(result, Err(BrokerError::ResourceLocked { .. })));

        let result = intruder.consume("pause.alice", "intruder").await;
        assert!(matches!(result, Err(BrokerError::ResourceLocked { .. })));
    }

    /// Verify that binding to a missing exchange fails.
    #[tokio::test]
    async fn test_bind_to_missing_exchange_fails() {
        let (_broker, _connection, channel) = setup().await;
        channel.declare_queue("war", &durable_options()).await.unwrap();

        let result = channel.bind_queue("war", "nope", "war.*").await;
        assert_eq!(
            result,
            Err(BrokerError::ExchangeNotFound {
                exchange: "nope".to_string()
            })
        );
    }

    /// Verify that an exchange cannot be re-declared with another kind.
    #[tokio::test]
    async fn test_exchange_kind_mismatch_fails() {
        let (_broker, _connection, channel) = setup().await;
        let result = channel
            .declare_exchange("topic", ExchangeKind::Direct, true)
            .await;
        assert!(matches!(result, Err(BrokerError::PreconditionFailed { .. })));
    }
}

// ============================================================================
// Routing Tests
// ============================================================================

mod routing {
    use super::*;

    #[tokio::test]
    async fn test_topic_exchange_routes_by_pattern() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("moves", &durable_options()).await.unwrap();
        channel.bind_queue("moves", "topic", "army_moves.*").await.unwrap();

        publish(&channel, "topic", "army_moves.alice", "m1").await;
        publish(&channel, "topic", "war.alice", "w1").await;

        assert_eq!(broker.peek_messages("moves"), vec![Bytes::from("m1")]);
    }

    #[tokio::test]
    async fn test_direct_exchange_requires_exact_key() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("pause", &durable_options()).await.unwrap();
        channel.bind_queue("pause", "direct", "pause").await.unwrap();

        publish(&channel, "direct", "pause", "p1").await;
        publish(&channel, "direct", "pause.alice", "p2").await;

        assert_eq!(broker.queue_depth("pause"), Some(1));
    }

    #[tokio::test]
    async fn test_queue_bound_twice_receives_once() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("logs", &durable_options()).await.unwrap();
        channel.bind_queue("logs", "topic", "game_logs.*").await.unwrap();
        channel.bind_queue("logs", "topic", "game_logs.#").await.unwrap();

        publish(&channel, "topic", "game_logs.alice", "l1").await;

        assert_eq!(broker.queue_depth("logs"), Some(1));
    }

    #[tokio::test]
    async fn test_unmatched_publish_is_dropped() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("moves", &durable_options()).await.unwrap();
        channel.bind_queue("moves", "topic", "army_moves.*").await.unwrap();

        publish(&channel, "topic", "nobody.listens", "x").await;

        assert_eq!(broker.queue_depth("moves"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let (_broker, _connection, channel) = setup().await;
        let result = channel
            .publish("nope", "key", Bytes::new(), &MessageProperties::default())
            .await;
        assert!(matches!(result, Err(BrokerError::ExchangeNotFound { .. })));
    }
}

// ============================================================================
// Consumption Tests
// ============================================================================

mod consumption {
    use super::*;

    #[tokio::test]
    async fn test_ack_removes_message() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        publish(&channel, "", "q", "one").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.body, Bytes::from("one"));
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("q"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let (_broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        publish(&channel, "", "q", "one").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        delivery.ack().await.unwrap();

        let result = delivery.ack().await;
        assert!(matches!(result, Err(BrokerError::UnknownDeliveryTag { .. })));
    }

    #[tokio::test]
    async fn test_prefetch_limits_outstanding_deliveries() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        channel.set_prefetch(2).await.unwrap();
        for _ in 0..5 {
            publish(&channel, "", "q", "m").await;
        }

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let first = next_delivery(&mut stream).await;
        let _second = next_delivery(&mut stream).await;

        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.queue_depth("q"), Some(3));

        first.ack().await.unwrap();
        let _third = next_delivery(&mut stream).await;
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.queue_depth("q"), Some(2));
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_at_head() {
        let (_broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        publish(&channel, "", "q", "first").await;
        publish(&channel, "", "q", "second").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        delivery.nack(true).await.unwrap();

        let again = next_delivery(&mut stream).await;
        assert_eq!(again.body, Bytes::from("first"));
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_nack_discard_dead_letters() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        channel
            .declare_queue("dead", &QueueOptions::default())
            .await
            .unwrap();
        channel.bind_queue("dead", "dlx", "").await.unwrap();
        publish(&channel, "", "q", "poison").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.peek_messages("dead"), vec![Bytes::from("poison")]);
        assert_eq!(broker.dead_lettered_count(), 1);
    }

    #[tokio::test]
    async fn test_nack_discard_without_dlx_drops() {
        let (broker, _connection, channel) = setup().await;
        channel.declare_queue("q", &QueueOptions::default()).await.unwrap();
        publish(&channel, "", "q", "gone").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        next_delivery(&mut stream).await.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.dead_lettered_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_discard_to_missing_dlx_is_not_counted() {
        let (broker, _connection, channel) = setup().await;
        let options = QueueOptions {
            arguments: QueueArguments {
                dead_letter_exchange: Some("no_such_dlx".to_string()),
            },
            ..durable_options()
        };
        channel.declare_queue("q", &options).await.unwrap();
        publish(&channel, "", "q", "poison").await;

        let mut stream = channel.consume("q", "c1").await.unwrap();
        next_delivery(&mut stream).await.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.dead_lettered_count(), 0);
    }

    #[tokio::test]
    async fn test_open_channel_count_tracks_close() {
        let (broker, connection, channel) = setup().await;
        let second = connection.open_channel().await.unwrap();
        assert_eq!(broker.open_channel_count(), 2);

        second.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_deliveries_round_robin_between_consumers() {
        let (broker, connection, channel) = setup().await;
        channel.declare_queue("q", &durable_options()).await.unwrap();
        let other = connection.open_channel().await.unwrap();

        let mut first = channel.consume("q", "c1").await.unwrap();
        let mut second = other.consume("q", "c2").await.unwrap();
        publish(&channel, "", "q", "a").await;
        publish(&channel, "", "q", "b").await;

        let a = next_delivery(&mut first).await;
        let b = next_delivery(&mut second).await;
        assert_eq!(a.body, Bytes::from("a"));
        assert_eq!(b.body, Bytes::from("b"));
        assert_eq!(broker.consumer_count("q"), Some(2));
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_channel_close_requeues_and_ends_stream() {
        let (broker, connection, setup_channel) = setup().await;
        setup_channel.declare_queue("q", &durable_options()).await.unwrap();
        publish(&setup_channel, "", "q", "pending").await;

        let channel = connection.open_channel().await.unwrap();
        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = next_delivery(&mut stream).await;

        channel.close().await.unwrap();
        assert!(!channel.is_open());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), Some(1));

        let result = delivery.ack().await;
        assert_eq!(result, Err(BrokerError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_operations() {
        let (_broker, _connection, channel) = setup().await;
        channel.close().await.unwrap();

        let result = channel.declare_queue("q", &durable_options()).await;
        assert_eq!(result, Err(BrokerError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_auto_delete_queue_removed_with_last_consumer() {
        let (broker, connection, _channel) = setup().await;
        let channel = connection.open_channel().await.unwrap();
        let options = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        channel.declare_queue("temp", &options).await.unwrap();
        let _stream = channel.consume("temp", "c1").await.unwrap();

        channel.close().await.unwrap();
        assert!(!broker.queue_exists("temp"));
    }

    #[tokio::test]
    async fn test_connection_close_removes_exclusive_queues() {
        let (broker, connection, channel) = setup().await;
        channel
            .declare_queue("pause.alice", &transient_options())
            .await
            .unwrap();
        channel.declare_queue("war", &durable_options()).await.unwrap();

        connection.close();

        assert!(!connection.is_open());
        assert!(!broker.queue_exists("pause.alice"));
        assert!(broker.queue_exists("war"));
        assert!(matches!(
            connection.open_channel().await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_restart_keeps_only_durable_queues() {
        let (broker, connection, channel) = setup().await;
        channel.declare_queue("war", &durable_options()).await.unwrap();
        channel
            .declare_queue("scratch", &QueueOptions::default())
            .await
            .unwrap();
        publish(&channel, "", "war", "kept").await;
        publish(&channel, "", "scratch", "lost").await;

        broker.restart();

        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert_eq!(broker.peek_messages("war"), vec![Bytes::from("kept")]);
        assert!(!broker.queue_exists("scratch"));
        assert!(broker.exchange_exists("topic"));
    }
}
