//! Exchange management
//!
//! An `Exchange` holds the bindings that decide which queues receive a
//! published message. Bindings are kept in insertion order so that routing
//! (and therefore fanout delivery) is deterministic; duplicate bindings are a
//! no-op.
//!
//! Concurrency note: callers must synchronize access to `Exchange` (the
//! broker keeps all exchanges behind the registry lock).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Every bound queue receives every message; the routing key is ignored.
    Fanout,
    /// Queues bound under exactly the message's routing key receive it.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            other => Err(format!(
                "unknown exchange type `{other}` (expected fanout|direct)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bindings: Vec::new(),
        }
    }

    /// Add a binding. Returns `false` if it already existed.
    pub fn bind(&mut self, queue: &str, routing_key: &str) -> bool {
        let exists = self
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            self.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        !exists
    }

    /// Names of the queues a message with `routing_key` goes to, each at most
    /// once, in binding order.
    pub fn route(&self, routing_key: &str) -> Vec<&str> {
        let mut queues: Vec<&str> = Vec::new();
        for binding in &self.bindings {
            let matches = match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
            };
            if matches && !queues.contains(&binding.queue.as_str()) {
                queues.push(&binding.queue);
            }
        }
        queues
    }

    pub fn handle(&self) -> ExchangeHandle {
        ExchangeHandle {
            name: self.name.clone(),
            kind: self.kind,
            bindings: self.bindings.clone(),
        }
    }
}

/// Snapshot of an exchange as returned by declarations and lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    pub name: String,
    pub kind: ExchangeKind,
    pub bindings: Vec<Binding>,
}
