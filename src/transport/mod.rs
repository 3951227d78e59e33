//! The `transport` module carries the broker over websockets.
//!
//! It defines the JSON protocol spoken between clients and the server, and
//! implements the server side: accepting connections, translating frames into
//! broker operations and streaming deliveries back.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;

pub use message::{ClientMessage, ServerMessage};
pub use websocket::start_websocket_server;
