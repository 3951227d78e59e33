//! # popq
//!
//! `popq` is a work-queue broker: publishers hand messages to exchanges or
//! named queues, and competing consumers receive them with acknowledgment
//! based, at-least-once delivery. A message that is nacked, or whose
//! consumer goes away before acking, is put back at the head of its queue.
//!
//! ## Core Modules
//!
//! - `broker`: queues, exchanges and bindings, publishing, and the per-queue dispatcher with prefetch and acks.
//! - `client`: a `Channel` that talks to a remote broker over WebSockets.
//! - `config`: layered settings (defaults, file, `POPQ_` environment).
//! - `persistence`: sled-backed storage for durable queues and persistent messages.
//! - `transport`: the WebSocket server and its JSON protocol.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
