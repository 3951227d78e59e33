//! WebSocket transport
//!
//! This file implements the websocket server that translates protocol JSON
//! frames into broker operations. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Keep per-connection state: the consumers the client started and the
//!   manual-ack deliveries it has not settled yet
//! - Forward each consumer's deliveries to the client as `deliver` frames
//! - Cancel every consumer of a connection when it closes, which requeues
//!   whatever the client had not acknowledged

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::{
    AckMode, Broker, ConsumeOptions, Consumer, Delivery, DeliveryTag, Durability, QueueHandle,
    Target,
};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{BrokerError, Result};

/// Binds `addr` and serves until the listener fails.
pub async fn start_websocket_server(addr: &str, broker: Broker) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BrokerError::Connection(format!("cannot bind {addr}: {e}")))?;
    serve(listener, broker).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: Broker) -> Result<()> {
    if let Ok(local) = listener.local_addr() {
        info!("WebSocket server listening on ws://{local}");
    }

    let mut backoff = AcceptBackoff::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                backoff.reset();
                spawn(handle_connection(stream, peer, broker.clone()));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "failed to accept connection");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Delay between failed accepts, doubling up to a cap. Errors such as
/// running out of file descriptors repeat until something else closes.
pub(crate) struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub(crate) const MIN: Duration = Duration::from_millis(10);
    pub(crate) const MAX: Duration = Duration::from_secs(1);

    pub(crate) fn new() -> Self {
        Self { delay: Self::MIN }
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Self::MIN;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (current * 2).min(Self::MAX);
        current
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Broker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let mut connection = Connection::new(broker, tx);
    let id = connection.id.clone();
    info!(connection = %id, %peer, "client connected");

    let send_loop = {
        let id = id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(connection = %id, error = %e, "failed to send frame");
                    break;
                }
            }
            debug!(connection = %id, "send loop closed");
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => connection.handle_text(text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %id, error = %e, "read failed");
                break;
            }
        }
    }

    drop(connection);
    send_loop.abort();
    info!(connection = %id, "client disconnected");
}

struct ActiveConsumer {
    queue: QueueHandle,
    forwarder: JoinHandle<()>,
}

/// Per-connection protocol state.
pub(crate) struct Connection {
    id: String,
    broker: Broker,
    outgoing: UnboundedSender<WsMessage>,
    consumers: HashMap<String, ActiveConsumer>,
    deliveries: Arc<Mutex<HashMap<DeliveryTag, Delivery>>>,
}

impl Connection {
    pub(crate) fn new(broker: Broker, outgoing: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            broker,
            outgoing,
            consumers: HashMap::new(),
            deliveries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg),
            Err(err) => warn!(
                connection = %self.id,
                error = %err,
                "invalid client message: {}",
                text.chars().take(100).collect::<String>()
            ),
        }
    }

    /// Applies one request. Replies, if any, go out through `outgoing`
    /// before this returns.
    pub(crate) fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::DeclareQueue { name, durable } => {
                let reply = self
                    .broker
                    .declare_queue(&name, durable)
                    .map(|queue| ServerMessage::QueueDeclared {
                        name: queue.name().to_string(),
                    });
                self.reply(reply);
            }
            ClientMessage::DeclareExchange { name, kind } => {
                let reply = self
                    .broker
                    .declare_exchange(&name, kind)
                    .map(|exchange| ServerMessage::ExchangeDeclared {
                        name: exchange.name,
                    });
                self.reply(reply);
            }
            ClientMessage::Bind {
                exchange,
                queue,
                routing_key,
            } => {
                let reply = self
                    .broker
                    .bind(&exchange, &queue, &routing_key)
                    .map(|()| ServerMessage::Bound {});
                self.reply(reply);
            }
            ClientMessage::Publish {
                exchange,
                routing_key,
                payload,
                persistent,
            } => {
                let target = Target::exchange(&exchange, &routing_key);
                if let Err(e) = self
                    .broker
                    .publish(&target, payload, Durability::from(persistent))
                {
                    warn!(connection = %self.id, %exchange, %routing_key, error = %e, "publish failed");
                }
            }
            ClientMessage::Consume {
                queue,
                ack_mode,
                prefetch,
                consumer_tag,
            } => {
                // On success `consume` has already sent `consume_ok`.
                if let Err(e) = self.consume(&queue, ack_mode, prefetch, consumer_tag) {
                    self.reply(Err(e));
                }
            }
            ClientMessage::Cancel { consumer_tag } => {
                let reply = if self.cancel(&consumer_tag) {
                    Ok(ServerMessage::CancelOk { consumer_tag })
                } else {
                    Err(BrokerError::Protocol(format!(
                        "no consumer `{consumer_tag}` on this connection"
                    )))
                };
                self.reply(reply);
            }
            ClientMessage::Ack { delivery_tag } => self.settle(delivery_tag, true),
            ClientMessage::Nack { delivery_tag } => self.settle(delivery_tag, false),
        }
    }

    fn consume(
        &mut self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: Option<u16>,
        consumer_tag: Option<String>,
    ) -> Result<()> {
        if let Some(tag) = &consumer_tag {
            if self.consumers.contains_key(tag) {
                return Err(BrokerError::DuplicateConsumer(tag.clone()));
            }
        }

        let consumer = self.broker.subscribe(
            queue,
            ConsumeOptions {
                ack_mode,
                prefetch,
                consumer_tag,
            },
        )?;
        let tag = consumer.tag().to_string();

        // The reply must precede the first `deliver` frame of this consumer.
        self.send(&ServerMessage::ConsumeOk {
            consumer_tag: tag.clone(),
        });

        let queue = consumer.queue().clone();
        let forwarder = spawn(forward(
            consumer,
            self.outgoing.clone(),
            self.deliveries.clone(),
        ));
        self.consumers
            .insert(tag.clone(), ActiveConsumer { queue, forwarder });
        debug!(connection = %self.id, consumer = %tag, "consumer started");
        Ok(())
    }

    /// Detaches a consumer synchronously; its unsettled deliveries are back
    /// in the queue when this returns.
    fn cancel(&mut self, consumer_tag: &str) -> bool {
        let Some(active) = self.consumers.remove(consumer_tag) else {
            return false;
        };
        active.forwarder.abort();
        active.queue.detach(consumer_tag);
        self.deliveries
            .lock()
            .retain(|_, delivery| delivery.consumer_tag() != consumer_tag);
        debug!(connection = %self.id, consumer = %consumer_tag, "consumer cancelled");
        true
    }

    fn settle(&mut self, delivery_tag: DeliveryTag, positive: bool) {
        let Some(delivery) = self.deliveries.lock().remove(&delivery_tag) else {
            warn!(connection = %self.id, delivery_tag, "settlement for unknown delivery");
            return;
        };
        let result = if positive {
            delivery.ack()
        } else {
            delivery.nack()
        };
        if let Err(e) = result {
            warn!(connection = %self.id, delivery_tag, error = %e, "failed to settle delivery");
        }
    }

    fn reply(&self, reply: Result<ServerMessage>) {
        let msg = reply.unwrap_or_else(|e| ServerMessage::Error {
            message: e.to_string(),
        });
        self.send(&msg);
    }

    fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                if self.outgoing.send(WsMessage::text(json)).is_err() {
                    debug!(connection = %self.id, "outgoing channel closed");
                }
            }
            Err(e) => warn!(connection = %self.id, error = %e, "failed to serialize reply"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let tags: Vec<String> = self.consumers.keys().cloned().collect();
        for tag in tags {
            self.cancel(&tag);
        }
    }
}

/// Streams a consumer's deliveries to the client until either side closes.
async fn forward(
    mut consumer: Consumer,
    outgoing: UnboundedSender<WsMessage>,
    deliveries: Arc<Mutex<HashMap<DeliveryTag, Delivery>>>,
) {
    while let Some(delivery) = consumer.recv().await {
        let message = delivery.message();
        let frame = ServerMessage::Deliver {
            consumer_tag: consumer.tag().to_string(),
            delivery_tag: delivery.tag(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            payload: message.payload.clone(),
            redelivered: delivery.redelivered(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(consumer = %consumer.tag(), error = %e, "failed to serialize delivery");
                let _ = delivery.nack();
                continue;
            }
        };

        // Registered before the frame leaves so an immediate ack finds it.
        if delivery.ack_mode() == AckMode::Manual {
            deliveries.lock().insert(delivery.tag(), delivery);
        }
        if outgoing.send(WsMessage::text(json)).is_err() {
            break;
        }
    }
    debug!(consumer = %consumer.tag(), "forwarder stopped");
}
