//! Topic codec.
//!
//! Every command travels on a five segment topic:
//!
//! ```text
//! yqmiot/<channel_id>/<receiver_id>/<sender_id>/<kind>
//! ```
//!
//! Receiver `0` is the channel broadcast address used for property and
//! event reports. Channel and sender ids are always positive.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::error::{ProtocolError, ProtocolResult};

/// Fixed first segment of every topic.
pub const NAMESPACE: &str = "yqmiot";

/// Reserved receiver id for channel-wide reports.
pub const BROADCAST: u64 = 0;

/// Address of an endpoint inside a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    channel_id: u64,
    node_id: u64,
}

impl Address {
    /// Create an address. Both ids must be positive; node id `0` is the
    /// broadcast receiver and never names a real endpoint.
    pub fn new(channel_id: u64, node_id: u64) -> ProtocolResult<Self> {
        if channel_id == 0 {
            return Err(ProtocolError::InvalidAddress(
                "channel id must be positive".to_string(),
            ));
        }
        if node_id == BROADCAST {
            return Err(ProtocolError::InvalidAddress(
                "node id must be positive".to_string(),
            ));
        }
        Ok(Self {
            channel_id,
            node_id,
        })
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Filter covering every command addressed to this endpoint.
    pub fn inbox_filter(&self) -> String {
        node_filter(self.channel_id, self.node_id)
    }

    /// Filter covering every report broadcast in this endpoint's channel.
    pub fn broadcast_filter(&self) -> String {
        broadcast_filter(self.channel_id)
    }

    /// Topic for a command sent from this endpoint.
    pub fn outbound(&self, receiver: u64, kind: CommandKind) -> Topic {
        Topic {
            channel_id: self.channel_id,
            receiver,
            sender: self.node_id,
            kind,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.node_id)
    }
}

/// Decoded address fields of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    pub channel_id: u64,
    pub receiver: u64,
    pub sender: u64,
    pub kind: CommandKind,
}

impl Topic {
    /// Build a topic, rejecting ids that could not be decoded again.
    pub fn new(channel_id: u64, receiver: u64, sender: u64, kind: CommandKind) -> ProtocolResult<Self> {
        if channel_id == 0 || sender == 0 {
            return Err(ProtocolError::InvalidAddress(format!(
                "channel {} / sender {} must be positive",
                channel_id, sender
            )));
        }
        Ok(Self {
            channel_id,
            receiver,
            sender,
            kind,
        })
    }

    /// Encode as the transport topic string.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decode a transport topic string.
    pub fn decode(topic: &str) -> ProtocolResult<Self> {
        let malformed = |reason: &str| ProtocolError::MalformedTopic(format!("{} ({})", topic, reason));

        let parts: Vec<&str> = topic.split('/').collect();
        let [namespace, channel, receiver, sender, kind] = parts.as_slice() else {
            return Err(malformed("expected 5 segments"));
        };

        if *namespace != NAMESPACE {
            return Err(malformed("unknown namespace"));
        }

        let channel_id = parse_id(channel).ok_or_else(|| malformed("bad channel id"))?;
        let receiver = parse_id(receiver).ok_or_else(|| malformed("bad receiver id"))?;
        let sender = parse_id(sender).ok_or_else(|| malformed("bad sender id"))?;
        if channel_id == 0 {
            return Err(malformed("channel id must be positive"));
        }
        if sender == 0 {
            return Err(malformed("sender id must be positive"));
        }
        let kind = kind
            .parse::<CommandKind>()
            .map_err(|_| malformed("unknown command kind"))?;

        Ok(Self {
            channel_id,
            receiver,
            sender,
            kind,
        })
    }

    /// Whether this topic targets the channel broadcast receiver.
    pub fn is_broadcast(&self) -> bool {
        self.receiver == BROADCAST
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            NAMESPACE, self.channel_id, self.receiver, self.sender, self.kind
        )
    }
}

impl FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Canonical decimal only: no sign, no leading zeros.
fn parse_id(segment: &str) -> Option<u64> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}

/// Subscription filter for everything addressed to `node_id`.
pub fn node_filter(channel_id: u64, node_id: u64) -> String {
    format!("{}/{}/{}/#", NAMESPACE, channel_id, node_id)
}

/// Subscription filter for every broadcast report in a channel.
pub fn broadcast_filter(channel_id: u64) -> String {
    node_filter(channel_id, BROADCAST)
}

/// Subscription filter for the broadcast reports of a single sender.
pub fn sender_broadcast_filter(channel_id: u64, sender: u64) -> String {
    format!("{}/{}/{}/{}/+", NAMESPACE, channel_id, BROADCAST, sender)
}

/// Filter covering all yqmiot traffic on the broker.
pub fn all_traffic_filter() -> String {
    format!("{}/#", NAMESPACE)
}

/// Match a topic against an MQTT style filter (`+` one level, `#` the rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
