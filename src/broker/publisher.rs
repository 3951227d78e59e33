//! Publishing
//!
//! A publish resolves its target to a set of queues and appends one copy of
//! the message to each. It never waits for consumers. Publishing to a
//! target that resolves to no queue drops the message without an error.

use std::borrow::Borrow;

use tracing::{debug, warn};

use crate::broker::engine::Broker;
use crate::broker::message::{Durability, Message};
use crate::broker::queue::Queue;
use crate::broker::registry::DEFAULT_EXCHANGE;
use crate::utils::Result;

/// Where a message is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Straight to a named queue, through the default exchange.
    Queue(String),
    Exchange { name: String, routing_key: String },
}

impl Target {
    pub fn queue(name: &str) -> Self {
        Target::Queue(name.to_string())
    }

    pub fn exchange(name: &str, routing_key: &str) -> Self {
        Target::Exchange {
            name: name.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    /// The (exchange, routing key) pair this target is routed through.
    pub fn route(&self) -> (&str, &str) {
        match self {
            Target::Queue(name) => (DEFAULT_EXCHANGE, name),
            Target::Exchange { name, routing_key } => (name, routing_key),
        }
    }
}

impl Broker {
    /// Publishes `payload` and returns how many queues received it.
    ///
    /// With `Durability::Persistent`, every durable queue among the targets
    /// has the message on disk before this returns. A queue whose storage
    /// fails is skipped and not counted. Fails for an undeclared named
    /// exchange, or when storage failed for every target.
    pub fn publish(
        &self,
        target: &Target,
        payload: impl Into<Vec<u8>>,
        durability: Durability,
    ) -> Result<usize> {
        let (exchange, routing_key) = target.route();
        let queues = self.resolve_route(exchange, routing_key)?;

        if queues.is_empty() {
            debug!(exchange, routing_key, "no queue bound, message dropped");
            return Ok(0);
        }

        let message = Message::new(exchange, routing_key, payload, durability);
        let routed = fan_out(&queues, |queue| queue.enqueue(message.clone()))?;
        debug!(
            exchange,
            routing_key,
            message_id = %message.message_id,
            queues = routed,
            "message published"
        );
        Ok(routed)
    }
}

/// Appends to every target, skipping the ones that fail.
///
/// A queue that rejects the message (storage failure) is logged and left
/// out, so the queues that did take it are not handed a duplicate when the
/// caller retries. Only when no queue took the message is it an error.
pub(crate) fn fan_out<Q: Borrow<Queue>>(
    queues: &[Q],
    mut append: impl FnMut(&Q) -> Result<()>,
) -> Result<usize> {
    let mut routed = 0;
    let mut first_error = None;

    for queue in queues {
        match append(queue) {
            Ok(()) => routed += 1,
            Err(e) => {
                warn!(queue = %queue.borrow().name(), error = %e, "queue skipped, message not stored");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if routed == 0 => Err(e),
        _ => Ok(routed),
    }
}
