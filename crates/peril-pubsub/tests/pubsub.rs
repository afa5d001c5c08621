//! End-to-end publish/subscribe tests against the in-process broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use peril_broker::memory::{ExchangeKind, MemoryBroker, MemoryConnection};
use peril_broker::{
    BrokerError, Channel, Connection, OutboundMessage, QueueArguments,
    QueueOptions,
};
use peril_codec::{BincodeCodec, JsonCodec};
use peril_pubsub::{
    AckType, PubSubError, Publisher, QueueDescriptor, SimpleQueueType,
    SubscribeOptions, declare_and_bind, publish_bincode, publish_json,
    subscribe, subscribe_auto_ack, subscribe_bincode, subscribe_json,
    subscribe_with_options,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};

const DIRECT: &str = "peril_direct";
const TOPIC: &str = "peril_topic";
const DLX: &str = "peril_dlx";
const DEAD_LETTERS: &str = "dead_letters";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GameLog {
    current_time: u64,
    message: String,
    username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct PlayingState {
    is_paused: bool,
}

fn game_log(message: &str) -> GameLog {
    GameLog {
        current_time: 1_700_000_000,
        message: message.to_string(),
        username: "alice".to_string(),
    }
}

/// A broker with the three Peril exchanges and a queue collecting
/// everything dead-lettered.
async fn setup() -> (MemoryBroker, MemoryConnection) {
    let broker = MemoryBroker::new();
    broker.declare_exchange(DIRECT, ExchangeKind::Direct).unwrap();
    broker.declare_exchange(TOPIC, ExchangeKind::Topic).unwrap();
    broker.declare_exchange(DLX, ExchangeKind::Fanout).unwrap();

    let conn = broker.connect();
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_declare(
            DEAD_LETTERS,
            QueueOptions {
                durable: true,
                ..QueueOptions::default()
            },
            &QueueArguments::default(),
        )
        .await
        .unwrap();
    channel.queue_bind(DEAD_LETTERS, DLX, "").await.unwrap();
    (broker, conn)
}

fn dead_lettered(broker: &MemoryBroker) -> usize {
    broker.queue_info(DEAD_LETTERS).unwrap().ready
}

/// Polls `condition` until it holds, failing the test after a second.
async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold within a second");
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("message should arrive")
        .expect("sender should be alive")
}

#[tokio::test]
async fn test_bincode_round_trip_through_topic_exchange() {
    let (broker, conn) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = subscribe_bincode(
        &conn,
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
        move |log: GameLog| {
            let tx = tx.clone();
            async move {
                tx.send(log).unwrap();
                AckType::Ack
            }
        },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    let sent = game_log("alice won a war against bob");
    publish_bincode(&publisher, TOPIC, "game_logs.alice", &sent)
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, sent);

    eventually(|| broker.queue_info("game_logs").unwrap().unacked == 0).await;
    let info = broker.queue_info("game_logs").unwrap();
    assert!(info.durable);
    assert!(!info.exclusive);
    assert!(!info.auto_delete);
    assert_eq!(info.dead_letter_exchange.as_deref(), Some(DLX));
    assert_eq!(info.ready, 0);

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
async fn test_unmatched_routing_key_is_not_delivered() {
    let (broker, conn) = setup().await;
    let subscription = subscribe_bincode(
        &conn,
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
        |_: GameLog| async { AckType::Ack },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    publish_bincode(&publisher, TOPIC, "army_moves.alice", &game_log("moved"))
        .await
        .unwrap();

    let info = broker.queue_info("game_logs").unwrap();
    assert_eq!(info.ready + info.unacked, 0);
    assert_eq!(subscription.shutdown().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_malformed_json_is_discarded_without_calling_handler() {
    let (broker, conn) = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let subscription = subscribe_json(
        &conn,
        DIRECT,
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        move |_: PlayingState| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { AckType::Ack }
        },
    )
    .await
    .unwrap();

    broker
        .inject(
            DIRECT,
            "pause",
            OutboundMessage {
                content_type: "application/json".into(),
                body: b"{not json".to_vec(),
            },
        )
        .unwrap();

    eventually(|| dead_lettered(&broker) == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let info = broker.queue_info("pause.alice").unwrap();
    assert_eq!(info.ready, 0);
    assert_eq!(info.unacked, 0);

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.acked, 0);
}

#[tokio::test]
async fn test_content_type_mismatch_is_a_decode_failure() {
    let (broker, conn) = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    let subscription = subscribe_bincode(
        &conn,
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
        move |_: GameLog| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { AckType::Ack }
        },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    publish_json(&publisher, TOPIC, "game_logs.alice", &game_log("json"))
        .await
        .unwrap();

    eventually(|| dead_lettered(&broker) == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.decode_failures, 1);
}

#[tokio::test]
async fn test_nack_requeue_redelivers() {
    let (broker, conn) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut attempts = 0;

    let subscription = subscribe_json(
        &conn,
        DIRECT,
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        move |state: PlayingState| {
            attempts += 1;
            tx.send((attempts, state)).unwrap();
            let decision = if attempts == 1 {
                AckType::NackRequeue
            } else {
                AckType::Ack
            };
            async move { decision }
        },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    publish_json(&publisher, DIRECT, "pause", &PlayingState { is_paused: true })
        .await
        .unwrap();

    let paused = PlayingState { is_paused: true };
    assert_eq!(recv(&mut rx).await, (1, paused));
    assert_eq!(recv(&mut rx).await, (2, paused));

    eventually(|| {
        let info = broker.queue_info("pause.alice").unwrap();
        info.ready == 0 && info.unacked == 0
    })
    .await;
    assert_eq!(dead_lettered(&broker), 0);

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_nack_discard_dead_letters() {
    let (broker, conn) = setup().await;
    let subscription = subscribe_json(
        &conn,
        DIRECT,
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        |_: PlayingState| async { AckType::NackDiscard },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    let state = PlayingState { is_paused: false };
    publish_json(&publisher, DIRECT, "pause", &state)
        .await
        .unwrap();

    eventually(|| dead_lettered(&broker) == 1).await;
    let info = broker.queue_info("pause.alice").unwrap();
    assert_eq!(info.ready + info.unacked, 0);

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.decode_failures, 0);
}

#[tokio::test]
async fn test_prefetch_bounds_unacked_deliveries() {
    let (broker, conn) = setup().await;
    let gate = Arc::new(Semaphore::new(0));
    let permits = Arc::clone(&gate);

    let subscription = subscribe_bincode(
        &conn,
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
        move |_: GameLog| {
            let permits = Arc::clone(&permits);
            async move {
                permits.acquire().await.unwrap().forget();
                AckType::Ack
            }
        },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    for i in 0..25 {
        publish_bincode(
            &publisher,
            TOPIC,
            "game_logs.alice",
            &game_log(&format!("log {i}")),
        )
        .await
        .unwrap();
    }

    eventually(|| broker.queue_info("game_logs").unwrap().unacked == 10).await;
    let info = broker.queue_info("game_logs").unwrap();
    assert_eq!(info.ready, 15);

    gate.add_permits(25);
    eventually(|| {
        let info = broker.queue_info("game_logs").unwrap();
        info.ready == 0 && info.unacked == 0
    })
    .await;

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.acked, 25);
}

#[tokio::test]
async fn test_custom_prefetch_count() {
    let (broker, conn) = setup().await;
    let gate = Arc::new(Semaphore::new(0));
    let permits = Arc::clone(&gate);
    let descriptor = QueueDescriptor::new(
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
    );
    let options = SubscribeOptions {
        prefetch_count: 3,
        ..SubscribeOptions::default()
    };

    let subscription = subscribe_with_options(
        &conn,
        &descriptor,
        options,
        BincodeCodec,
        move |_: GameLog| {
            let permits = Arc::clone(&permits);
            async move {
                permits.acquire().await.unwrap().forget();
                AckType::Ack
            }
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn, BincodeCodec).await.unwrap();
    for i in 0..5 {
        publisher
            .publish(TOPIC, "game_logs.bob", &game_log(&format!("log {i}")))
            .await
            .unwrap();
    }

    eventually(|| broker.queue_info("game_logs").unwrap().unacked == 3).await;
    assert_eq!(broker.queue_info("game_logs").unwrap().ready, 2);

    gate.add_permits(5);
    eventually(|| broker.queue_info("game_logs").unwrap().unacked == 0).await;
    assert_eq!(subscription.shutdown().await.unwrap().acked, 5);
}

#[tokio::test]
async fn test_transient_queue_is_exclusive_and_auto_deleted() {
    let (broker, conn) = setup().await;
    let subscription = subscribe_json(
        &conn,
        DIRECT,
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        |_: PlayingState| async { AckType::Ack },
    )
    .await
    .unwrap();

    let info = broker.queue_info("pause.alice").unwrap();
    assert!(!info.durable);
    assert!(info.exclusive);
    assert!(info.auto_delete);
    assert_eq!(info.consumers, 1);

    // Another connection may not touch an exclusive queue.
    let other = broker.connect();
    let err = subscribe_json(
        &other,
        DIRECT,
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        |_: PlayingState| async { AckType::Ack },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        PubSubError::Topology {
            source: BrokerError::ResourceLocked(_),
            ..
        }
    ));

    subscription.shutdown().await.unwrap();
    assert!(broker.queue_info("pause.alice").is_none());
}

#[tokio::test]
async fn test_missing_exchange_fails_before_spawning() {
    let (_broker, conn) = setup().await;
    let err = subscribe_json(
        &conn,
        "no_such_exchange",
        "pause.alice",
        "pause",
        SimpleQueueType::Transient,
        |_: PlayingState| async { AckType::Ack },
    )
    .await
    .unwrap_err();

    match err {
        PubSubError::Topology {
            queue,
            exchange,
            source,
        } => {
            assert_eq!(queue, "pause.alice");
            assert_eq!(exchange, "no_such_exchange");
            assert!(matches!(source, BrokerError::NotFound(_)));
        }
        other => panic!("expected topology error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_redeclare_with_other_type_is_rejected() {
    let (_broker, conn) = setup().await;
    let durable = QueueDescriptor::new(
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
    );
    let (_channel, queue) = declare_and_bind(&conn, &durable).await.unwrap();
    assert_eq!(queue.name, "game_logs");

    // Same flags again is fine.
    declare_and_bind(&conn, &durable).await.unwrap();

    let transient = QueueDescriptor {
        queue_type: SimpleQueueType::Transient,
        ..durable
    };
    let err = declare_and_bind(&conn, &transient).await.unwrap_err();
    assert!(matches!(
        err,
        PubSubError::Topology {
            source: BrokerError::PreconditionFailed(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_closed_connection_reports_connection_error() {
    let (_broker, conn) = setup().await;
    conn.close().await.unwrap();

    let err = Publisher::open(&conn, JsonCodec).await.err().unwrap();
    assert!(matches!(err, PubSubError::Connection(_)));
}

#[tokio::test]
async fn test_auto_ack_acknowledges_every_decoded_message() {
    let (broker, conn) = setup().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let descriptor = QueueDescriptor::new(
        DIRECT,
        "pause.bob",
        "pause",
        SimpleQueueType::Transient,
    );

    let subscription = subscribe_auto_ack(
        &conn,
        &descriptor,
        SubscribeOptions::default(),
        JsonCodec,
        move |state: PlayingState| {
            let tx = tx.clone();
            async move {
                tx.send(state).unwrap();
            }
        },
    )
    .await
    .unwrap();

    let publisher = Publisher::open(&conn, JsonCodec).await.unwrap();
    assert_eq!(publisher.content_type(), "application/json");
    publisher
        .publish(DIRECT, "pause", &PlayingState { is_paused: true })
        .await
        .unwrap();
    publisher
        .publish(DIRECT, "pause", &PlayingState { is_paused: false })
        .await
        .unwrap();

    assert!(recv(&mut rx).await.is_paused);
    assert!(!recv(&mut rx).await.is_paused);

    eventually(|| broker.queue_info("pause.bob").unwrap().unacked == 0).await;
    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.acked, 2);
    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_subscription_reports_queue_and_consumer_tag() {
    let (_broker, conn) = setup().await;
    let descriptor =
        QueueDescriptor::new(DIRECT, "", "pause", SimpleQueueType::Transient);
    let options = SubscribeOptions {
        consumer_tag: "peril-pause-test".into(),
        ..SubscribeOptions::default()
    };

    let subscription = subscribe_with_options(
        &conn,
        &descriptor,
        options,
        JsonCodec,
        |_: PlayingState| async { AckType::Ack },
    )
    .await
    .unwrap();

    assert!(!subscription.queue().is_empty());
    assert_eq!(subscription.consumer_tag(), "peril-pause-test");
    subscription.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_loop_and_returns_prefetched_messages() {
    let (broker, conn) = setup().await;
    let gate = Arc::new(Semaphore::new(0));
    let permits = Arc::clone(&gate);
    let (started_tx, mut started) = mpsc::unbounded_channel();

    let subscription = subscribe(
        &conn,
        &QueueDescriptor::new(
            TOPIC,
            "game_logs",
            "game_logs.*",
            SimpleQueueType::Durable,
        ),
        BincodeCodec,
        move |_: GameLog| {
            let permits = Arc::clone(&permits);
            started_tx.send(()).unwrap();
            async move {
                permits.acquire().await.unwrap().forget();
                AckType::Ack
            }
        },
    )
    .await
    .unwrap();

    let publisher = conn.create_channel().await.unwrap();
    for i in 0..4 {
        publish_bincode(
            &publisher,
            TOPIC,
            "game_logs.alice",
            &game_log(&format!("log {i}")),
        )
        .await
        .unwrap();
    }
    eventually(|| broker.queue_info("game_logs").unwrap().unacked == 4).await;
    recv(&mut started).await;

    // The first delivery is in the handler; let it finish after cancel.
    subscription.cancel();
    gate.add_permits(1);
    eventually(|| subscription.is_finished()).await;

    let stats = subscription.shutdown().await.unwrap();
    assert_eq!(stats.acked, 1);

    let info = broker.queue_info("game_logs").unwrap();
    assert_eq!(info.ready, 3);
    assert_eq!(info.unacked, 0);
    assert_eq!(info.consumers, 0);
}

#[tokio::test]
async fn test_loop_ends_when_broker_restarts() {
    let (broker, conn) = setup().await;
    let subscription = subscribe_bincode(
        &conn,
        TOPIC,
        "game_logs",
        "game_logs.*",
        SimpleQueueType::Durable,
        |_: GameLog| async { AckType::Ack },
    )
    .await
    .unwrap();

    broker.restart();
    eventually(|| subscription.is_finished()).await;

    assert_eq!(subscription.join().await.unwrap().total(), 0);
    assert!(broker.queue_info("game_logs").is_some());
}
