use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{AckMode, Broker, Durability, Target};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::{AcceptBackoff, Connection};

fn connection(broker: &Broker) -> (Connection, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection::new(broker.clone(), tx), rx)
}

fn decode(frame: WsMessage) -> ServerMessage {
    match frame {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

/// A reply sent synchronously by `handle`.
fn reply(rx: &mut UnboundedReceiver<WsMessage>) -> ServerMessage {
    decode(rx.try_recv().expect("no reply"))
}

/// A frame sent by a forwarder task.
async fn next_frame(rx: &mut UnboundedReceiver<WsMessage>) -> ServerMessage {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outgoing channel closed");
    decode(frame)
}

fn consume(queue: &str, tag: &str) -> ClientMessage {
    ClientMessage::Consume {
        queue: queue.to_string(),
        ack_mode: AckMode::Manual,
        prefetch: Some(1),
        consumer_tag: Some(tag.to_string()),
    }
}

#[test]
fn test_wire_format() {
    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "publish",
        "routing_key": "tasks",
        "payload": [104, 105]
    }))
    .unwrap();
    assert_eq!(
        msg,
        ClientMessage::Publish {
            exchange: String::new(),
            routing_key: "tasks".to_string(),
            payload: b"hi".to_vec(),
            persistent: false,
        }
    );
    assert!(!msg.expects_reply());

    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "consume",
        "queue": "tasks"
    }))
    .unwrap();
    assert!(msg.expects_reply());
    assert!(matches!(
        msg,
        ClientMessage::Consume {
            ack_mode: AckMode::Manual,
            prefetch: None,
            consumer_tag: None,
            ..
        }
    ));

    let value = serde_json::to_value(ServerMessage::ConsumeOk {
        consumer_tag: "c1".to_string(),
    })
    .unwrap();
    assert_eq!(value, json!({"type": "consume_ok", "consumer_tag": "c1"}));
}

#[test]
fn test_accept_backoff_doubles_up_to_cap_and_resets() {
    let mut backoff = AcceptBackoff::new();
    assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    assert_eq!(backoff.next_delay(), Duration::from_millis(40));

    for _ in 0..10 {
        backoff.next_delay();
    }
    assert_eq!(backoff.next_delay(), AcceptBackoff::MAX);

    backoff.reset();
    assert_eq!(backoff.next_delay(), AcceptBackoff::MIN);
}

#[tokio::test]
async fn test_declare_queue_replies_with_name() {
    let broker = Broker::default();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle_text(&json!({"type": "declare_queue", "name": "tasks", "durable": false}).to_string());
    assert_eq!(
        reply(&mut rx),
        ServerMessage::QueueDeclared {
            name: "tasks".to_string()
        }
    );

    conn.handle_text(&json!({"type": "declare_queue", "name": ""}).to_string());
    match reply(&mut rx) {
        ServerMessage::QueueDeclared { name } => assert!(name.starts_with("amq.gen-")),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_request_replies_error() {
    let broker = Broker::default();
    broker.declare_queue("tasks", true).unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(ClientMessage::DeclareQueue {
        name: "tasks".to_string(),
        durable: false,
    });
    assert!(matches!(reply(&mut rx), ServerMessage::Error { .. }));

    conn.handle(consume("missing", "c1"));
    assert!(matches!(reply(&mut rx), ServerMessage::Error { .. }));

    conn.handle(ClientMessage::Cancel {
        consumer_tag: "nobody".to_string(),
    });
    assert!(matches!(reply(&mut rx), ServerMessage::Error { .. }));
}

#[tokio::test]
async fn test_fire_and_forget_messages_get_no_reply() {
    let broker = Broker::default();
    broker.declare_queue("tasks", false).unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(ClientMessage::Publish {
        exchange: String::new(),
        routing_key: "tasks".to_string(),
        payload: b"hello".to_vec(),
        persistent: false,
    });
    // unknown exchange and unknown delivery are only logged
    conn.handle(ClientMessage::Publish {
        exchange: "nope".to_string(),
        routing_key: String::new(),
        payload: b"lost".to_vec(),
        persistent: false,
    });
    conn.handle(ClientMessage::Ack { delivery_tag: 42 });
    conn.handle(ClientMessage::Nack { delivery_tag: 42 });
    conn.handle_text("not json");

    assert!(rx.try_recv().is_err());
    assert_eq!(broker.queue("tasks").unwrap().pending_payloads(), vec![b"hello".to_vec()]);
}

#[tokio::test]
async fn test_consume_then_ack() {
    let broker = Broker::default();
    let queue = broker.declare_queue("tasks", false).unwrap();
    broker
        .publish(&Target::queue("tasks"), "hello", Durability::Transient)
        .unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(consume("tasks", "c1"));
    assert_eq!(
        reply(&mut rx),
        ServerMessage::ConsumeOk {
            consumer_tag: "c1".to_string()
        }
    );

    let delivery_tag = match next_frame(&mut rx).await {
        ServerMessage::Deliver {
            consumer_tag,
            delivery_tag,
            routing_key,
            payload,
            redelivered,
            ..
        } => {
            assert_eq!(consumer_tag, "c1");
            assert_eq!(routing_key, "tasks");
            assert_eq!(payload, b"hello".to_vec());
            assert!(!redelivered);
            delivery_tag
        }
        other => panic!("unexpected frame: {other:?}"),
    };
    assert_eq!(queue.unacked_len(), 1);

    conn.handle(ClientMessage::Ack { delivery_tag });
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.pending_len(), 0);
}

#[tokio::test]
async fn test_nack_redelivers_with_flag() {
    let broker = Broker::default();
    broker.declare_queue("tasks", false).unwrap();
    broker
        .publish(&Target::queue("tasks"), "retry me", Durability::Transient)
        .unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(consume("tasks", "c1"));
    reply(&mut rx);

    let ServerMessage::Deliver { delivery_tag: first, .. } = next_frame(&mut rx).await else {
        panic!("expected a delivery");
    };
    conn.handle(ClientMessage::Nack { delivery_tag: first });

    match next_frame(&mut rx).await {
        ServerMessage::Deliver {
            delivery_tag,
            payload,
            redelivered,
            ..
        } => {
            assert_ne!(delivery_tag, first);
            assert_eq!(payload, b"retry me".to_vec());
            assert!(redelivered);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_consumer_tag_on_connection() {
    let broker = Broker::default();
    broker.declare_queue("a", false).unwrap();
    broker.declare_queue("b", false).unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(consume("a", "c1"));
    assert!(matches!(reply(&mut rx), ServerMessage::ConsumeOk { .. }));
    conn.handle(consume("b", "c1"));
    assert!(matches!(reply(&mut rx), ServerMessage::Error { .. }));
    assert_eq!(broker.queue("b").unwrap().consumer_count(), 0);
}

#[tokio::test]
async fn test_cancel_requeues_unacked() {
    let broker = Broker::default();
    let queue = broker.declare_queue("tasks", false).unwrap();
    broker
        .publish(&Target::queue("tasks"), "work", Durability::Transient)
        .unwrap();
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(consume("tasks", "c1"));
    reply(&mut rx);
    let ServerMessage::Deliver { delivery_tag, .. } = next_frame(&mut rx).await else {
        panic!("expected a delivery");
    };

    conn.handle(ClientMessage::Cancel {
        consumer_tag: "c1".to_string(),
    });
    assert_eq!(
        reply(&mut rx),
        ServerMessage::CancelOk {
            consumer_tag: "c1".to_string()
        }
    );
    assert_eq!(queue.consumer_count(), 0);
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.pending_payloads(), vec![b"work".to_vec()]);

    // too late, the message is back in the queue
    conn.handle(ClientMessage::Ack { delivery_tag });
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn test_dropping_connection_requeues_unacked() {
    let broker = Broker::default();
    let queue = broker.declare_queue("tasks", false).unwrap();
    for payload in ["one", "two"] {
        broker
            .publish(&Target::queue("tasks"), payload, Durability::Transient)
            .unwrap();
    }
    let (mut conn, mut rx) = connection(&broker);

    conn.handle(consume("tasks", "c1"));
    reply(&mut rx);
    next_frame(&mut rx).await;
    assert_eq!(queue.pending_len(), 1);

    drop(conn);
    assert_eq!(queue.consumer_count(), 0);
    assert_eq!(
        queue.pending_payloads(),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
}
