//! Connection bookkeeping shared by every endpoint role.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, Span};

use crate::codec::PayloadCodec;
use crate::command::Command;
use crate::error::ProtocolResult;
use crate::topic::Address;
use crate::transport::Transport;

/// An endpoint's view of its transport: who it is, how it encodes
/// payloads, and which filters it has subscribed to.
pub struct Session {
    address: Address,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    subscriptions: Mutex<BTreeSet<String>>,
    span: Span,
}

impl Session {
    pub fn new(
        address: Address,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
        span: Span,
    ) -> Self {
        Self {
            address,
            transport,
            codec,
            subscriptions: Mutex::new(BTreeSet::new()),
            span,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    pub(crate) fn set_codec(&mut self, codec: Arc<dyn PayloadCodec>) {
        self.codec = codec;
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Subscribe to `filter`. Always forwarded to the transport so a
    /// reconnect restores every subscription.
    pub async fn subscribe(&self, filter: &str) -> ProtocolResult<()> {
        self.transport.subscribe(filter).await?;
        let added = self.subscriptions.lock().insert(filter.to_string());
        if added {
            debug!(parent: &self.span, "Subscribed to {}", filter);
        }
        Ok(())
    }

    /// Filters subscribed so far.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Topic and payload bytes for sending `command` from this endpoint.
    pub fn encode(&self, command: &Command) -> ProtocolResult<(String, Vec<u8>)> {
        let topic = self.address.outbound(command.receiver(), command.kind()).encode();
        let payload = command.encode_payload(self.codec.as_ref())?;
        Ok((topic, payload))
    }

    /// Stamp this endpoint as sender and publish.
    pub async fn send(&self, command: Command) -> ProtocolResult<()> {
        let command = command.with_sender(self.address.node_id());
        let (topic, payload) = self.encode(&command)?;
        debug!(parent: &self.span, "Sending {} on {}", command, topic);
        self.transport.publish(&topic, payload).await?;
        Ok(())
    }
}
