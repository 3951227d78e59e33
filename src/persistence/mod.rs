//! The `persistence` module makes durable queues and persistent messages
//! survive a broker restart.
//!
//! It uses `sled` as an embedded key-value store: one tree records the
//! durable queue declarations, and one tree per durable queue holds its
//! stored messages in publish order.

pub mod sled_store;

pub use sled_store::{Persistence, StoredMessage};
