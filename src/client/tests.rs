use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::broker::{AckMode, Broker, ExchangeKind};
use crate::client::{Channel, IncomingDelivery, RemoteConsumer};
use crate::transport::message::ClientMessage;
use crate::transport::websocket::start_websocket_server;
use crate::utils::BrokerError;

async fn setup_server(broker: Broker) -> String {
    let addr = format!(
        "127.0.0.1:{}",
        portpicker::pick_unused_port().expect("No free ports")
    );

    let server_addr = addr.clone();
    tokio::spawn(async move { start_websocket_server(&server_addr, broker).await });

    // Give the server a moment to start up
    sleep(Duration::from_millis(100)).await;
    format!("ws://{addr}")
}

async fn next(consumer: &mut RemoteConsumer) -> IncomingDelivery {
    timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("consumer closed")
}

/// Waits until the server has processed everything sent before it.
async fn barrier(channel: &Channel, queue: &str) {
    channel.declare_queue(queue, false).await.unwrap();
}

#[tokio::test]
async fn test_connect_failure() {
    let port = portpicker::pick_unused_port().expect("No free ports");
    let result = Channel::connect(&format!("ws://127.0.0.1:{port}")).await;
    assert!(matches!(result, Err(BrokerError::Connection(_))));
}

#[tokio::test]
async fn test_publish_consume_ack() {
    let broker = Broker::default();
    let url = setup_server(broker.clone()).await;
    let channel = Channel::connect(&url).await.unwrap();

    assert_eq!(channel.declare_queue("hello", false).await.unwrap(), "hello");
    channel.publish("", "hello", "Hello World!", false).unwrap();

    let mut consumer = channel
        .consume("hello", AckMode::Manual, Some(1))
        .await
        .unwrap();
    let delivery = next(&mut consumer).await;
    assert_eq!(delivery.payload_str(), "Hello World!");
    assert_eq!(delivery.consumer_tag, consumer.tag());
    assert_eq!(delivery.routing_key, "hello");
    assert!(!delivery.redelivered);

    let queue = broker.queue("hello").unwrap();
    assert_eq!(queue.unacked_len(), 1);

    channel.ack(delivery.delivery_tag).unwrap();
    barrier(&channel, "hello").await;
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.pending_len(), 0);

    channel.close().await;
}

#[tokio::test]
async fn test_reply_and_fire_and_forget_frames_are_not_mixed_up() {
    let url = setup_server(Broker::default()).await;
    let channel = Channel::connect(&url).await.unwrap();

    let declare = ClientMessage::DeclareQueue {
        name: "jobs".to_string(),
        durable: false,
    };
    let err = channel.send(&declare).unwrap_err();
    assert!(matches!(err, BrokerError::Protocol(_)));

    let err = channel
        .request(ClientMessage::Ack { delivery_tag: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Protocol(_)));

    // Nothing was sent, so the next reply still lines up with its request.
    assert_eq!(channel.declare_queue("jobs", false).await.unwrap(), "jobs");
    channel.publish("", "jobs", "task", false).unwrap();
    let mut consumer = channel.consume("jobs", AckMode::Auto, None).await.unwrap();
    assert_eq!(next(&mut consumer).await.payload_str(), "task");

    channel.close().await;
}

#[tokio::test]
async fn test_remote_errors() {
    let url = setup_server(Broker::default()).await;
    let channel = Channel::connect(&url).await.unwrap();

    channel
        .declare_exchange("logs", ExchangeKind::Fanout)
        .await
        .unwrap();
    let err = channel
        .declare_exchange("logs", ExchangeKind::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Remote(_)));

    let err = channel.bind("logs", "missing", "").await.unwrap_err();
    assert!(matches!(err, BrokerError::Remote(_)));

    assert!(channel.consume("missing", AckMode::Auto, None).await.is_err());

    // the channel is still usable after errors
    assert_eq!(channel.declare_queue("ok", false).await.unwrap(), "ok");
}

#[tokio::test]
async fn test_fanout_over_websocket() {
    let url = setup_server(Broker::default()).await;
    let channel = Channel::connect(&url).await.unwrap();

    channel
        .declare_exchange("logs", ExchangeKind::Fanout)
        .await
        .unwrap();
    let mut consumers = Vec::new();
    for _ in 0..2 {
        let queue = channel.declare_queue("", false).await.unwrap();
        assert!(queue.starts_with("amq.gen-"));
        channel.bind("logs", &queue, "").await.unwrap();
        consumers.push(channel.consume(&queue, AckMode::Auto, None).await.unwrap());
    }

    channel.publish("logs", "", "info: hello", false).unwrap();

    for consumer in &mut consumers {
        let delivery = next(consumer).await;
        assert_eq!(delivery.exchange, "logs");
        assert_eq!(delivery.payload_str(), "info: hello");
    }
}

#[tokio::test]
async fn test_direct_routing_over_websocket() {
    let url = setup_server(Broker::default()).await;
    let channel = Channel::connect(&url).await.unwrap();

    channel
        .declare_exchange("direct_logs", ExchangeKind::Direct)
        .await
        .unwrap();
    let errors = channel.declare_queue("errors", false).await.unwrap();
    channel.bind("direct_logs", &errors, "error").await.unwrap();
    let mut consumer = channel.consume(&errors, AckMode::Auto, None).await.unwrap();

    channel.publish("direct_logs", "info", "ignored", false).unwrap();
    channel.publish("direct_logs", "error", "disk full", false).unwrap();

    assert_eq!(next(&mut consumer).await.payload_str(), "disk full");
}

#[tokio::test]
async fn test_cancel_requeues_for_next_consumer() {
    let broker = Broker::default();
    let url = setup_server(broker.clone()).await;
    let channel = Channel::connect(&url).await.unwrap();

    channel.declare_queue("tasks", false).await.unwrap();
    channel.publish("", "tasks", "job", false).unwrap();

    let mut first = channel
        .consume("tasks", AckMode::Manual, Some(1))
        .await
        .unwrap();
    let delivery = next(&mut first).await;
    channel.cancel(first.tag()).await.unwrap();
    assert!(first.recv().await.is_none());
    assert_eq!(broker.queue("tasks").unwrap().pending_len(), 1);

    let mut second = channel
        .consume("tasks", AckMode::Manual, Some(1))
        .await
        .unwrap();
    let again = next(&mut second).await;
    assert_eq!(again.payload, delivery.payload);
    assert!(again.redelivered);
    assert_ne!(again.delivery_tag, delivery.delivery_tag);
}

#[tokio::test]
async fn test_disconnect_requeues_unacked() {
    let broker = Broker::default();
    let url = setup_server(broker.clone()).await;

    let worker = Channel::connect(&url).await.unwrap();
    worker.declare_queue("tasks", false).await.unwrap();
    worker.publish("", "tasks", "crash test", false).unwrap();
    let mut consumer = worker
        .consume("tasks", AckMode::Manual, Some(1))
        .await
        .unwrap();
    next(&mut consumer).await;

    let queue = broker.queue("tasks").unwrap();
    assert_eq!(queue.unacked_len(), 1);

    worker.close().await;
    timeout(Duration::from_secs(2), async {
        while queue.pending_len() != 1 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was not requeued");

    let survivor = Channel::connect(&url).await.unwrap();
    let mut consumer = survivor
        .consume("tasks", AckMode::Manual, Some(1))
        .await
        .unwrap();
    let delivery = next(&mut consumer).await;
    assert_eq!(delivery.payload_str(), "crash test");
    assert!(delivery.redelivered);
}

#[tokio::test]
async fn test_work_shared_between_workers() {
    let url = setup_server(Broker::default()).await;
    let producer = Channel::connect(&url).await.unwrap();
    producer.declare_queue("task_queue", true).await.unwrap();

    let worker_a = Channel::connect(&url).await.unwrap();
    let worker_b = Channel::connect(&url).await.unwrap();
    let mut a = worker_a
        .consume("task_queue", AckMode::Manual, Some(1))
        .await
        .unwrap();
    let mut b = worker_b
        .consume("task_queue", AckMode::Manual, Some(1))
        .await
        .unwrap();

    for i in 0..4 {
        producer
            .publish("", "task_queue", format!("task {i}"), true)
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        let delivery = next(&mut a).await;
        seen.push(delivery.payload_str());
        worker_a.ack(delivery.delivery_tag).unwrap();

        let delivery = next(&mut b).await;
        seen.push(delivery.payload_str());
        worker_b.ack(delivery.delivery_tag).unwrap();
    }
    seen.sort();
    assert_eq!(seen, vec!["task 0", "task 1", "task 2", "task 3"]);
}
