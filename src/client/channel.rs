use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::{AckMode, DeliveryTag, ExchangeKind};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{BrokerError, Result};

/// A message pushed to one of this channel's consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDelivery {
    pub consumer_tag: String,
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl IncomingDelivery {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct Shared {
    /// Reply slots in request order.
    replies: Mutex<Replies>,
    consumers: Mutex<HashMap<String, UnboundedSender<IncomingDelivery>>>,
}

#[derive(Default)]
struct Replies {
    waiting: VecDeque<oneshot::Sender<ServerMessage>>,
    closed: bool,
}

/// A client connection to a broker server.
///
/// Requests that expect a reply are matched with replies in order, so any
/// number of tasks may share one channel behind an `Arc`.
pub struct Channel {
    outgoing: UnboundedSender<WsMessage>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl Channel {
    /// Connects to a server at `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Connection(format!("{url}: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => shared.dispatch(text.as_str()),
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "read failed");
                            break;
                        }
                    }
                }
                shared.shutdown();
            })
        };

        debug!(%url, "connected");
        Ok(Self {
            outgoing,
            shared,
            reader,
            writer: Some(writer),
        })
    }

    /// Declares a queue and returns its name, which is generated by the
    /// server when `name` is empty.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<String> {
        let reply = self
            .request(ClientMessage::DeclareQueue {
                name: name.to_string(),
                durable,
            })
            .await?;
        match reply {
            ServerMessage::QueueDeclared { name } => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let reply = self
            .request(ClientMessage::DeclareExchange {
                name: name.to_string(),
                kind,
            })
            .await?;
        match reply {
            ServerMessage::ExchangeDeclared { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let reply = self
            .request(ClientMessage::Bind {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            })
            .await?;
        match reply {
            ServerMessage::Bound {} => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Publishes through `exchange` (`""` for the default exchange, where the
    /// routing key is the queue name). The server does not confirm publishes.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        persistent: bool,
    ) -> Result<()> {
        self.send(&ClientMessage::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            persistent,
        })
    }

    /// Starts consuming `queue`. `prefetch` of `None` takes the server's
    /// default.
    pub async fn consume(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: Option<u16>,
    ) -> Result<RemoteConsumer> {
        // The tag is chosen here so deliveries that beat `consume_ok` to the
        // client already have somewhere to go.
        let tag = format!("ctag-{}", Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.consumers.lock().insert(tag.clone(), sender);

        let reply = self
            .request(ClientMessage::Consume {
                queue: queue.to_string(),
                ack_mode,
                prefetch,
                consumer_tag: Some(tag.clone()),
            })
            .await;
        match reply {
            Ok(ServerMessage::ConsumeOk { .. }) => Ok(RemoteConsumer { tag, receiver }),
            Ok(other) => {
                self.shared.consumers.lock().remove(&tag);
                Err(unexpected(other))
            }
            Err(e) => {
                self.shared.consumers.lock().remove(&tag);
                Err(e)
            }
        }
    }

    /// Stops a consumer. Deliveries it had not acknowledged are requeued by
    /// the server.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let reply = self
            .request(ClientMessage::Cancel {
                consumer_tag: consumer_tag.to_string(),
            })
            .await?;
        self.shared.consumers.lock().remove(consumer_tag);
        match reply {
            ServerMessage::CancelOk { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.send(&ClientMessage::Ack { delivery_tag })
    }

    pub fn nack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.send(&ClientMessage::Nack { delivery_tag })
    }

    /// Sends a close frame and waits for it to be written.
    pub async fn close(mut self) {
        let _ = self.outgoing.send(WsMessage::Close(None));
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }

    /// Sends a frame the server answers and waits for that answer.
    pub(crate) async fn request(&self, msg: ClientMessage) -> Result<ServerMessage> {
        if !msg.expects_reply() {
            return Err(BrokerError::Protocol(
                "the server does not reply to publish, ack or nack".to_string(),
            ));
        }
        let json = serde_json::to_string(&msg)?;
        let (tx, rx) = oneshot::channel();
        {
            // Slot and frame are queued under one lock to keep them in the
            // same order.
            let mut replies = self.shared.replies.lock();
            if replies.closed {
                return Err(BrokerError::ConnectionClosed);
            }
            replies.waiting.push_back(tx);
            if self.outgoing.send(WsMessage::text(json)).is_err() {
                replies.waiting.pop_back();
                return Err(BrokerError::ConnectionClosed);
            }
        }

        match rx.await.map_err(|_| BrokerError::ConnectionClosed)? {
            ServerMessage::Error { message } => Err(BrokerError::Remote(message)),
            reply => Ok(reply),
        }
    }

    /// Sends a frame the server does not answer.
    pub(crate) fn send(&self, msg: &ClientMessage) -> Result<()> {
        // An unmatched reply would shift every later one onto the wrong request.
        if msg.expects_reply() {
            return Err(BrokerError::Protocol(
                "a message the server replies to must be sent as a request".to_string(),
            ));
        }
        let json = serde_json::to_string(msg)?;
        self.outgoing
            .send(WsMessage::text(json))
            .map_err(|_| BrokerError::ConnectionClosed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl Shared {
    fn dispatch(&self, text: &str) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "invalid server message");
                return;
            }
        };

        match msg {
            ServerMessage::Deliver {
                consumer_tag,
                delivery_tag,
                exchange,
                routing_key,
                payload,
                redelivered,
            } => {
                let consumers = self.consumers.lock();
                match consumers.get(&consumer_tag) {
                    Some(sender) => {
                        let _ = sender.send(IncomingDelivery {
                            consumer_tag,
                            delivery_tag,
                            exchange,
                            routing_key,
                            payload,
                            redelivered,
                        });
                    }
                    None => {
                        debug!(consumer = %consumer_tag, delivery_tag, "delivery for cancelled consumer")
                    }
                }
            }
            reply => match self.replies.lock().waiting.pop_front() {
                Some(slot) => {
                    let _ = slot.send(reply);
                }
                None => warn!(?reply, "reply without a request"),
            },
        }
    }

    fn shutdown(&self) {
        let mut replies = self.replies.lock();
        replies.closed = true;
        replies.waiting.clear();
        drop(replies);
        self.consumers.lock().clear();
        debug!("connection closed");
    }
}

fn unexpected(reply: ServerMessage) -> BrokerError {
    BrokerError::Protocol(format!("unexpected reply: {reply:?}"))
}

/// Deliveries for one consumer started with [`Channel::consume`]. Ends when
/// the consumer is cancelled or the connection closes.
pub struct RemoteConsumer {
    tag: String,
    receiver: UnboundedReceiver<IncomingDelivery>,
}

impl RemoteConsumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn recv(&mut self) -> Option<IncomingDelivery> {
        self.receiver.recv().await
    }
}

impl Stream for RemoteConsumer {
    type Item = IncomingDelivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
