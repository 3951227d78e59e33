//! The `error` module defines the error type shared by the broker, the
//! persistence layer, the websocket transport and the client channel.
//!
//! Two failure classes have no variant: a publish that routes to no
//! queue is not an error (the message is dropped), and a consumer that crashes
//! or rejects a delivery is handled inside the queue by requeueing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker could not be reached, or the handshake failed.
    #[error("failure to connect: {0}")]
    Connection(String),

    /// The connection went away while a request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A redeclaration disagreed with the existing entity. Nothing was changed.
    #[error("{kind} `{name}` already declared as {existing}, requested {requested}")]
    ParameterConflict {
        kind: &'static str,
        name: String,
        existing: String,
        requested: String,
    },

    #[error("queue `{0}` not found")]
    UnknownQueue(String),

    #[error("exchange `{0}` not found")]
    UnknownExchange(String),

    /// The tag was never issued, was already settled, or was requeued when its
    /// consumer went away.
    #[error("delivery `{0}` is not outstanding")]
    UnknownDelivery(u64),

    #[error("consumer tag `{0}` already in use")]
    DuplicateConsumer(String),

    #[error("`{0}` is reserved")]
    ReservedName(String),

    #[error("storage failure: {0}")]
    Persistence(#[from] sled::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The peer sent a frame that does not fit the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The broker answered a request with an error frame.
    #[error("broker refused request: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
