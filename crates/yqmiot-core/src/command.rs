//! Command model.
//!
//! A command is the unit exchanged between endpoints: a property report,
//! an event report, a method call, or the ack of a call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Params, Payload, PayloadCodec};
use crate::error::{ProtocolError, ProtocolResult};
use crate::topic::{Topic, BROADCAST};

/// Reserved action names.
pub mod actions {
    /// Liveness check, serviced by every endpoint.
    pub const PING: &str = "yqmiot.method.ping";
    /// Liveness check name used by older clients.
    pub const LEGACY_PING: &str = "ping";
    /// Emitted by a node when it connects.
    pub const ONLINE: &str = "yqmiot.event.online";
    /// Emitted on orderly shutdown and registered as the MQTT last will.
    pub const OFFLINE: &str = "yqmiot.event.offline";
    /// Diagnostic event.
    pub const TEST: &str = "yqmiot.event.test";
}

/// Command kind, the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Property,
    Event,
    Call,
    Ack,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [Self::Property, Self::Event, Self::Call, Self::Ack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Property => "property",
            Self::Event => "event",
            Self::Call => "call",
            Self::Ack => "ack",
        }
    }

    /// Property and event reports go to the broadcast receiver.
    pub fn is_report(&self) -> bool {
        matches!(self, Self::Property | Self::Event)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "property" => Ok(Self::Property),
            "event" => Ok(Self::Event),
            "call" => Ok(Self::Call),
            "ack" => Ok(Self::Ack),
            other => Err(ProtocolError::Decode(format!("unknown command kind: {}", other))),
        }
    }
}

/// A protocol command.
///
/// Fields are fixed; extension data lives in `params`. Locally built
/// commands carry sender `0` until the sending endpoint stamps its own id.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    action: Option<String>,
    receiver: u64,
    sender: u64,
    call_seq: Option<u64>,
    params: Option<Params>,
}

impl Command {
    /// Property report to the broadcast receiver.
    pub fn property(params: Params) -> Self {
        Self {
            kind: CommandKind::Property,
            action: None,
            receiver: BROADCAST,
            sender: 0,
            call_seq: None,
            params: Some(params),
        }
    }

    /// Event report to the broadcast receiver.
    pub fn event(action: impl Into<String>, params: Option<Params>) -> ProtocolResult<Self> {
        let action = non_empty_action(action.into())?;
        Ok(Self {
            kind: CommandKind::Event,
            action: Some(action),
            receiver: BROADCAST,
            sender: 0,
            call_seq: None,
            params,
        })
    }

    /// Method call to a specific node.
    pub fn call(
        receiver: u64,
        action: impl Into<String>,
        call_seq: u64,
        params: Option<Params>,
    ) -> ProtocolResult<Self> {
        if receiver == BROADCAST {
            return Err(ProtocolError::BroadcastCall);
        }
        let action = non_empty_action(action.into())?;
        Ok(Self {
            kind: CommandKind::Call,
            action: Some(action),
            receiver,
            sender: 0,
            call_seq: Some(call_seq),
            params,
        })
    }

    /// Build the ack for this call, addressed back to the caller.
    ///
    /// Only calls can be replied to; anything else is a programming error.
    pub fn reply(&self, params: Option<Params>) -> ProtocolResult<Command> {
        if self.kind != CommandKind::Call {
            return Err(ProtocolError::ReplyNotSupported(self.kind));
        }
        let call_seq = self.call_seq.ok_or(ProtocolError::MissingField("callseq"))?;
        let action = self.action.clone().ok_or(ProtocolError::MissingField("action"))?;
        Ok(Self {
            kind: CommandKind::Ack,
            action: Some(action),
            receiver: self.sender,
            sender: 0,
            call_seq: Some(call_seq),
            params,
        })
    }

    /// Assemble a command from a decoded topic and payload.
    ///
    /// Inbound data that breaks the command invariants is a decode error.
    pub fn from_parts(topic: Topic, payload: Payload) -> ProtocolResult<Self> {
        let Payload {
            action,
            call_seq,
            params,
        } = payload;

        match topic.kind {
            CommandKind::Call | CommandKind::Ack => {
                if call_seq.is_none() {
                    return Err(ProtocolError::Decode(format!("{} without callseq", topic.kind)));
                }
                if action.as_deref().map_or(true, str::is_empty) {
                    return Err(ProtocolError::Decode(format!("{} without action", topic.kind)));
                }
                if topic.is_broadcast() {
                    return Err(ProtocolError::Decode(format!(
                        "{} to broadcast receiver",
                        topic.kind
                    )));
                }
            }
            CommandKind::Event => {
                if action.as_deref().map_or(true, str::is_empty) {
                    return Err(ProtocolError::Decode("event without action".to_string()));
                }
            }
            CommandKind::Property => {}
        }

        if topic.kind.is_report() && !topic.is_broadcast() {
            return Err(ProtocolError::Decode(format!(
                "{} report addressed to node {}",
                topic.kind, topic.receiver
            )));
        }

        Ok(Self {
            kind: topic.kind,
            action: if topic.kind == CommandKind::Property { None } else { action },
            receiver: topic.receiver,
            sender: topic.sender,
            call_seq: if topic.kind.is_report() { None } else { call_seq },
            params,
        })
    }

    /// Decode a command from a transport message.
    pub fn from_wire(topic: &str, payload: &[u8], codec: &dyn PayloadCodec) -> ProtocolResult<Self> {
        let topic = Topic::decode(topic)?;
        let payload = codec.decode(payload)?;
        Self::from_parts(topic, payload)
    }

    /// Payload body of this command.
    pub fn to_payload(&self) -> Payload {
        Payload {
            action: self.action.clone(),
            call_seq: self.call_seq,
            params: self.params.clone(),
        }
    }

    /// Encode the payload body with `codec`.
    pub fn encode_payload(&self, codec: &dyn PayloadCodec) -> ProtocolResult<Vec<u8>> {
        codec.encode(&self.to_payload())
    }

    /// Set the sender id. Done by the endpoint at send time.
    pub fn with_sender(mut self, sender: u64) -> Self {
        self.sender = sender;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn receiver(&self) -> u64 {
        self.receiver
    }

    pub fn sender(&self) -> u64 {
        self.sender
    }

    pub fn call_seq(&self) -> Option<u64> {
        self.call_seq
    }

    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    /// Look up a single parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.kind, self.sender, self.receiver)?;
        if let Some(action) = &self.action {
            write!(f, " {}", action)?;
        }
        if let Some(seq) = self.call_seq {
            write!(f, " #{}", seq)?;
        }
        Ok(())
    }
}

fn non_empty_action(action: String) -> ProtocolResult<String> {
    if action.is_empty() {
        Err(ProtocolError::MissingField("action"))
    } else {
        Ok(action)
    }
}
