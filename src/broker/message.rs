//! Message definitions for the broker
//!
//! `Message` is the canonical internal representation, shared by the queues,
//! the persistence layer and the wire protocol. A message is immutable once
//! published; per-attempt facts (delivery tag, redelivered flag) live on the
//! `Delivery` instead.
//!
//! Notes on fields:
//! - `exchange` / `routing_key`: how the publisher addressed it (`""` is the
//!   default exchange, where the routing key is the queue name)
//! - `payload`: opaque bytes
//! - `durability`: whether a durable queue should write it to storage
//! - `timestamp`: milliseconds since UNIX epoch; set by the broker on publish

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker-assigned delivery tag. Monotonically increasing per broker, never
/// reused, so a redelivery always carries a fresh tag.
pub type DeliveryTag = u64;

pub type ConsumerTag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Persistent,
    #[default]
    Transient,
}

impl Durability {
    pub fn is_persistent(self) -> bool {
        matches!(self, Durability::Persistent)
    }
}

impl From<bool> for Durability {
    fn from(durable: bool) -> Self {
        if durable {
            Durability::Persistent
        } else {
            Durability::Transient
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub durability: Durability,
    pub timestamp: i64,
}

impl Message {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        durability: Durability,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            durability,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// How a consumer settles its deliveries.
///
/// `Auto` acknowledges at handoff: the message is gone from the broker before
/// the handler sees it, so a crash mid-processing loses it. `Manual` keeps the
/// message outstanding until `ack`/`nack`, and requeues it if the consumer
/// goes away first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    Auto,
    #[default]
    Manual,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => f.write_str("auto"),
            AckMode::Manual => f.write_str("manual"),
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" => Ok(AckMode::Manual),
            other => Err(format!("unknown ack mode `{other}` (expected auto|manual)")),
        }
    }
}
