//! Queue registry
//!
//! Tracks the named queues and exchanges of one broker and resolves routes.
//! The unnamed exchange `""` is never stored: it is an implicit direct
//! exchange in which every queue is bound under its own name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::exchange::{Exchange, ExchangeKind};
use crate::broker::queue::Queue;
use crate::utils::{BrokerError, Result};

pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Default)]
pub struct Registry {
    queues: HashMap<String, Arc<Queue>>,
    exchanges: HashMap<String, Exchange>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<Queue>> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &Arc<Queue>> {
        self.queues.values()
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.get(name)
    }

    /// Looks up an existing queue for a redeclaration.
    ///
    /// `Ok(None)` means the name is free; a queue with a different durability
    /// flag is a `ParameterConflict`.
    pub fn existing_queue(&self, name: &str, durable: bool) -> Result<Option<Arc<Queue>>> {
        match self.queues.get(name) {
            None => Ok(None),
            Some(queue) if queue.durable() == durable => Ok(Some(queue.clone())),
            Some(queue) => Err(BrokerError::ParameterConflict {
                kind: "queue",
                name: name.to_string(),
                existing: durability_label(queue.durable()).to_string(),
                requested: durability_label(durable).to_string(),
            }),
        }
    }

    pub fn insert_queue(&mut self, queue: Arc<Queue>) {
        self.queues.insert(queue.name().to_string(), queue);
    }

    /// Idempotent; a different kind under the same name is a `ParameterConflict`.
    pub fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<&Exchange> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::ReservedName("(default exchange)".to_string()));
        }

        if let Some(existing) = self.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::ParameterConflict {
                    kind: "exchange",
                    name: name.to_string(),
                    existing: existing.kind.to_string(),
                    requested: kind.to_string(),
                });
            }
        }

        Ok(self
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange::new(name, kind)))
    }

    /// Returns `false` when the binding already existed.
    pub fn bind(&mut self, exchange: &str, queue: &str, routing_key: &str) -> Result<bool> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::ReservedName("(default exchange)".to_string()));
        }
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let exchange = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        Ok(exchange.bind(queue, routing_key))
    }

    /// Queues a message published to `exchange` with `routing_key` goes to.
    ///
    /// An empty result is not an error: the publisher's message is dropped.
    /// Publishing to a named exchange that was never declared is.
    pub fn resolve_route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<Queue>>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self.queues.get(routing_key).cloned().into_iter().collect());
        }

        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        Ok(exchange
            .route(routing_key)
            .into_iter()
            .filter_map(|name| self.queues.get(name).cloned())
            .collect())
    }
}

fn durability_label(durable: bool) -> &'static str {
    if durable { "durable" } else { "transient" }
}
