//! yqmiot protocol core
//!
//! Nodes and controllers exchange commands over a shared pub/sub broker.
//! The topic carries the addressing, the payload carries the command body:
//!
//! ```text
//! yqmiot/<channel_id>/<receiver_id>/<sender_id>/<kind>
//! { "action": ..., "callseq": ..., "params": ... }
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT transport via `rumqttc` |
//!
//! ## Architecture
//!
//! - **Topic** / **Command**: addressing and the command value object
//! - **CallRegistry**: correlates acks with outstanding calls, expires the rest
//! - **Dispatcher**: routes calls to action handlers, acks to the registry,
//!   reports to the role
//! - **Role**: `NodeRole` (reports state, serves calls) or `ControllerRole`
//!   (observes the channel broadcast, issues calls)
//! - **Endpoint**: composes the above over a `Transport`

pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod reporter;
pub mod role;
pub mod session;
pub mod topic;
pub mod transport;

pub use codec::{JsonCodec, Params, Payload, PayloadCodec};
pub use command::{actions, Command, CommandKind};
pub use config::{Credential, EndpointConfig};
pub use dispatcher::{handler_fn, ActionHandler, Dispatcher, HandlerResult, Outcome, PingHandler};
pub use endpoint::Endpoint;
pub use error::{ProtocolError, ProtocolResult, TransportError, TransportResult};
pub use registry::{
    CallCallback, CallRegistry, CallReply, CallStatus, PendingCall, Resolution,
    DEFAULT_CALL_TIMEOUT,
};
pub use reporter::{PropertyReporter, ReportState, DEFAULT_REPORT_MIN_INTERVAL};
pub use role::{ControllerRole, LoggingObserver, NodeRole, ReportObserver, Role};
pub use session::Session;
pub use topic::{Address, Topic, BROADCAST, NAMESPACE};
pub use transport::{InboundHandler, LastWill, MemoryBroker, MemoryConnection, MemoryTransport, Transport};

#[cfg(feature = "mqtt")]
pub use transport::{MqttConnection, MqttTransport};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
