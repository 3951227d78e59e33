//! The `client` module is the remote side of the websocket transport.
//!
//! A `Channel` owns one connection to a broker server and exposes the same
//! operations as the in-process `Broker`: declarations, bindings, publishing
//! and consuming with acknowledgments.

pub mod channel;
pub use channel::{Channel, IncomingDelivery, RemoteConsumer};

#[cfg(test)]
mod tests;
