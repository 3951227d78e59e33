//! Consumers and deliveries
//!
//! A `Consumer` is a pull-based subscription to one queue: deliveries are
//! read with `recv().await` or as a `futures::Stream`. Dropping the consumer
//! (or calling `unsubscribe`) detaches it, and every delivery it had not
//! settled goes back to the head of the queue.
//!
//! A `Delivery` is one message assigned to one consumer. Under
//! `AckMode::Manual` it stays outstanding until `ack` or `nack`; under
//! `AckMode::Auto` it was settled at handoff and both calls are no-ops.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::dispatcher::Attached;
use crate::broker::engine::Broker;
use crate::broker::message::{AckMode, ConsumerTag, DeliveryTag, Message};
use crate::broker::queue::{Queue, QueueHandle, unknown_queue};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub ack_mode: AckMode,
    /// Maximum unacknowledged deliveries; `None` takes the broker default,
    /// `Some(0)` is unlimited.
    pub prefetch: Option<u16>,
    /// Generated when absent.
    pub consumer_tag: Option<ConsumerTag>,
}

impl ConsumeOptions {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto() -> Self {
        Self {
            ack_mode: AckMode::Auto,
            ..Self::default()
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_string());
        self
    }
}

pub struct Delivery {
    tag: DeliveryTag,
    consumer_tag: ConsumerTag,
    ack_mode: AckMode,
    message: Message,
    redelivered: bool,
    queue: Weak<Queue>,
}

impl Delivery {
    pub(crate) fn new(
        tag: DeliveryTag,
        consumer_tag: ConsumerTag,
        ack_mode: AckMode,
        message: Message,
        redelivered: bool,
        queue: Weak<Queue>,
    ) -> Self {
        Self {
            tag,
            consumer_tag,
            ack_mode,
            message,
            redelivered,
            queue,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// True if this message was handed out before and requeued.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Removes the message from the queue for good.
    ///
    /// Fails with `UnknownDelivery` if the delivery was already requeued
    /// because its consumer detached.
    pub fn ack(self) -> Result<()> {
        if self.ack_mode == AckMode::Auto {
            return Ok(());
        }
        self.queue()?.ack(self.tag)
    }

    /// Puts the message back at the head of the queue.
    pub fn nack(self) -> Result<()> {
        if self.ack_mode == AckMode::Auto {
            debug!(delivery_tag = self.tag, "nack on auto-ack delivery ignored");
            return Ok(());
        }
        self.queue()?.nack(self.tag)
    }

    fn queue(&self) -> Result<QueueHandle> {
        self.queue
            .upgrade()
            .ok_or(BrokerError::UnknownDelivery(self.tag))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("consumer_tag", &self.consumer_tag)
            .field("ack_mode", &self.ack_mode)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message.message_id)
            .finish()
    }
}

pub struct Consumer {
    tag: ConsumerTag,
    ack_mode: AckMode,
    queue: QueueHandle,
    receiver: UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Waits for the next delivery assigned to this consumer.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// The next delivery if one is already assigned.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    /// Detaches from the queue; unsettled deliveries are requeued.
    pub fn unsubscribe(self) {}

    /// Feeds deliveries to `handler` one at a time, until the task running
    /// this future is cancelled.
    ///
    /// In manual mode a handler returning `Ok` acks the delivery and `Err`
    /// nacks it, so a failing handler never loses the message. In auto mode
    /// the outcome is only logged.
    pub async fn run<F, Fut, E>(mut self, mut handler: F)
    where
        F: FnMut(Message) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        while let Some(delivery) = self.recv().await {
            let tag = delivery.tag();
            let outcome = handler(delivery.message().clone()).await;

            let settled = match outcome {
                Ok(()) => delivery.ack(),
                Err(e) => {
                    warn!(consumer = %self.tag, delivery_tag = tag, error = %e, "handler failed");
                    delivery.nack()
                }
            };
            if let Err(e) = settled {
                warn!(consumer = %self.tag, delivery_tag = tag, error = %e, "failed to settle delivery");
            }
        }
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.receiver.close();
        self.queue.detach(&self.tag);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue.name())
            .field("ack_mode", &self.ack_mode)
            .finish()
    }
}

impl Broker {
    /// Attaches a new consumer to `queue`.
    ///
    /// Pending messages are dispatched to it right away, subject to its
    /// prefetch limit.
    pub fn subscribe(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        let queue = self.queue(queue).ok_or_else(|| unknown_queue(queue))?;

        let tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));
        let prefetch = options.prefetch.unwrap_or(self.default_prefetch());
        let (sender, receiver) = mpsc::unbounded_channel();

        queue.attach(Attached {
            tag: tag.clone(),
            ack_mode: options.ack_mode,
            prefetch,
            outstanding: 0,
            sender,
        })?;
        debug!(queue = %queue.name(), consumer = %tag, ack_mode = %options.ack_mode, prefetch, "consumer attached");

        Ok(Consumer {
            tag,
            ack_mode: options.ack_mode,
            queue,
            receiver,
        })
    }
}
