//! Wire protocol
//!
//! One JSON object per websocket text frame, tagged by `type`.
//!
//! Every `ClientMessage` except `publish`, `ack` and `nack` gets exactly one
//! reply, and replies come back in request order. Those three are
//! fire-and-forget: the server logs failures but never answers them, so a
//! client can match replies to requests with a simple FIFO. `deliver` frames
//! are unsolicited and may arrive between replies.

use serde::{Deserialize, Serialize};

use crate::broker::{AckMode, DeliveryTag, ExchangeKind};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "declare_queue")]
    DeclareQueue {
        name: String,
        #[serde(default)]
        durable: bool,
    },
    #[serde(rename = "declare_exchange")]
    DeclareExchange { name: String, kind: ExchangeKind },
    #[serde(rename = "bind")]
    Bind {
        exchange: String,
        queue: String,
        #[serde(default)]
        routing_key: String,
    },
    #[serde(rename = "publish")]
    Publish {
        #[serde(default)]
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        #[serde(default)]
        persistent: bool,
    },
    #[serde(rename = "consume")]
    Consume {
        queue: String,
        #[serde(default)]
        ack_mode: AckMode,
        prefetch: Option<u16>,
        consumer_tag: Option<String>,
    },
    #[serde(rename = "cancel")]
    Cancel { consumer_tag: String },
    #[serde(rename = "ack")]
    Ack { delivery_tag: DeliveryTag },
    #[serde(rename = "nack")]
    Nack { delivery_tag: DeliveryTag },
}

impl ClientMessage {
    /// Whether the server answers this request.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            ClientMessage::Publish { .. } | ClientMessage::Ack { .. } | ClientMessage::Nack { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "queue_declared")]
    QueueDeclared { name: String },
    #[serde(rename = "exchange_declared")]
    ExchangeDeclared { name: String },
    #[serde(rename = "bound")]
    Bound {},
    #[serde(rename = "consume_ok")]
    ConsumeOk { consumer_tag: String },
    #[serde(rename = "cancel_ok")]
    CancelOk { consumer_tag: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "deliver")]
    Deliver {
        consumer_tag: String,
        delivery_tag: DeliveryTag,
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
    },
}
