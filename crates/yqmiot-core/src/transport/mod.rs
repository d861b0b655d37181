//! Pub/sub transport interface.
//!
//! The protocol core only needs to publish bytes on a topic, subscribe to
//! topic filters, and be told about inbound messages and (re)connects.
//! Connection management, keep-alive and delivery belong to the transport.

use async_trait::async_trait;

use crate::codec::PayloadCodec;
use crate::command::Command;
use crate::error::{ProtocolResult, TransportResult};
use crate::topic::Address;

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryConnection, MemoryTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnection, MqttTransport};

/// Outbound side of a transport connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Subscribe to a topic filter (`+` and `#` wildcards).
    async fn subscribe(&self, filter: &str) -> TransportResult<()>;
}

/// Receiver of inbound transport activity.
///
/// Calls arrive in delivery order from a single task per connection.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// The connection was established or re-established.
    async fn on_connected(&self);

    /// A message arrived on `topic`.
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Last-will message registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl LastWill {
    /// Will publishing `command` as if sent by `address`.
    pub fn from_command(
        address: Address,
        command: &Command,
        codec: &dyn PayloadCodec,
    ) -> ProtocolResult<Self> {
        let command = command.clone().with_sender(address.node_id());
        let topic = address.outbound(command.receiver(), command.kind()).encode();
        let payload = command.encode_payload(codec)?;
        Ok(Self { topic, payload })
    }
}
