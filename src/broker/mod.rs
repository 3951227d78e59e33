//! The broker core: queue registry, publishing, per-queue dispatch with
//! acknowledgments, and consumers.
//!
//! Data flows publisher -> registry (route resolution) -> queue dispatcher
//! -> consumer -> ack/nack back to the queue.

pub mod consumer;
mod dispatcher;
pub mod engine;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod registry;

pub use consumer::{ConsumeOptions, Consumer, Delivery};
pub use engine::Broker;
pub use exchange::{Binding, ExchangeHandle, ExchangeKind};
pub use message::{AckMode, ConsumerTag, DeliveryTag, Durability, Message};
pub use publisher::Target;
pub use queue::{Queue, QueueHandle};
