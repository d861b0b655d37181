//! Error types for the yqmiot protocol core.
//!
//! Runtime faults (`MalformedTopic`, `Decode`, `UnknownAction`,
//! `StaleOrUnknownAck`, `HandlerFault`) are caught where they occur, logged,
//! and cost only the offending message. The remaining variants are contract
//! violations returned straight to the caller.

use thiserror::Error;

use crate::command::CommandKind;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Topic does not follow `yqmiot/<channel>/<receiver>/<sender>/<kind>`
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    /// Payload bytes are not valid under the payload codec
    #[error("Decode error: {0}")]
    Decode(String),

    /// No handler registered for a call action
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Ack whose call sequence is not pending
    #[error("Stale or unknown ack: callseq {0}")]
    StaleOrUnknownAck(u64),

    /// Action handler returned an error or panicked
    #[error("Handler fault in {action}: {reason}")]
    HandlerFault { action: String, reason: String },

    /// Channel or node id out of range
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// `reply()` called on something other than a call
    #[error("Reply not supported for {0} commands")]
    ReplyNotSupported(CommandKind),

    /// A call addressed to the broadcast receiver
    #[error("Calls must target a node, not the broadcast receiver")]
    BroadcastCall,

    /// Required command field absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Operation not available for this endpoint role
    #[error("Operation {operation} is not supported by the {role} role")]
    RoleMismatch {
        operation: &'static str,
        role: &'static str,
    },

    /// Call sequence already pending
    #[error("Call sequence {0} is already pending")]
    DuplicateCallSeq(u64),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for the pub/sub transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failed
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failed
    #[error("Subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },

    /// Transport has been shut down
    #[error("Transport is closed")]
    Closed,
}

impl ProtocolError {
    /// Whether this error is a caller-side contract violation rather than
    /// a per-message runtime fault.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_)
                | Self::ReplyNotSupported(_)
                | Self::BroadcastCall
                | Self::MissingField(_)
                | Self::RoleMismatch { .. }
        )
    }
}
