//! Endpoint - a node or controller attached to a transport.
//!
//! ```text
//! transport (topic, bytes)
//!     │
//!     ▼
//! Topic::decode + PayloadCodec::decode ──→ Command
//!     │
//!     ▼
//! Dispatcher ──┬─→ call:   ActionHandler ──→ ack ──→ transport
//!              ├─→ ack:    CallRegistry::resolve ──→ callback
//!              └─→ report: Role::on_report
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::{JsonCodec, Params, PayloadCodec};
use crate::command::Command;
use crate::config::EndpointConfig;
use crate::dispatcher::{ActionHandler, Dispatcher, Outcome};
use crate::error::{ProtocolError, ProtocolResult, TransportError};
use crate::registry::{CallCallback, CallRegistry, CallReply, CallStatus};
use crate::role::{ControllerRole, NodeRole, ReportObserver, Role};
use crate::session::Session;
use crate::topic::{Address, Topic, BROADCAST};
use crate::transport::{InboundHandler, LastWill, Transport};

/// A protocol endpoint.
pub struct Endpoint {
    config: EndpointConfig,
    session: Session,
    registry: Arc<CallRegistry>,
    dispatcher: Dispatcher,
    role: Arc<dyn Role>,
}

impl Endpoint {
    /// Build an endpoint with an explicit role.
    pub fn new(
        config: EndpointConfig,
        role: Arc<dyn Role>,
        transport: Arc<dyn Transport>,
    ) -> ProtocolResult<Self> {
        config.validate()?;
        let address = config.address()?;

        let span = info_span!(
            "endpoint",
            channel = address.channel_id(),
            node = address.node_id(),
            role = role.name()
        );
        let registry = Arc::new(CallRegistry::new(config.call_timeout()));
        let dispatcher = Dispatcher::new(registry.clone());
        for (action, handler) in role.default_action_handlers() {
            dispatcher.register(action, handler);
        }
        let session = Session::new(address, transport, Arc::new(JsonCodec), span);

        Ok(Self {
            config,
            session,
            registry,
            dispatcher,
            role,
        })
    }

    /// Build a node endpoint.
    pub fn node(config: EndpointConfig, transport: Arc<dyn Transport>) -> ProtocolResult<Self> {
        let role = NodeRole::new(config.report_min_interval());
        Self::new(config, Arc::new(role), transport)
    }

    /// Build a controller endpoint reporting to `observer`.
    pub fn controller(
        config: EndpointConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn ReportObserver>,
    ) -> ProtocolResult<Self> {
        Self::new(config, Arc::new(ControllerRole::new(observer)), transport)
    }

    /// Use `codec` for payloads instead of JSON.
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.session.set_codec(codec);
        self
    }

    pub fn address(&self) -> Address {
        self.session.address()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn role_name(&self) -> &'static str {
        self.role.name()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register the handler for calls to `action`.
    pub fn register_action(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action = action.into();
        if self.dispatcher.register(action.clone(), handler).is_some() {
            debug!(parent: self.session.span(), "Replaced handler for {}", action);
        }
    }

    /// Subscribe to this endpoint's inbox and run the role's connect hook.
    pub async fn connected(&self) -> ProtocolResult<()> {
        async {
            info!("Connected");
            self.session.subscribe(&self.address().inbox_filter()).await?;
            self.role.on_connected(&self.session).await?;
            debug!(
                "Subscribed to {:?}, serving {:?}",
                self.session.subscriptions(),
                self.dispatcher.actions()
            );
            Ok(())
        }
        .instrument(self.session.span().clone())
        .await
    }

    /// Decode and dispatch one inbound message. Never fails: faults are
    /// logged and reported in the returned outcome.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Outcome {
        self.handle_message_inner(topic, payload)
            .instrument(self.session.span().clone())
            .await
    }

    async fn handle_message_inner(&self, topic: &str, payload: &[u8]) -> Outcome {
        let decoded = Topic::decode(topic).and_then(|fields| {
            let body = self.session.codec().decode(payload)?;
            Ok((fields, Command::from_parts(fields, body)?))
        });
        let (fields, command) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping message on {}: {}", topic, e);
                return Outcome::Dropped(e);
            }
        };

        if !self.accepts(&fields) {
            debug!("Ignoring {} not addressed to us", command);
            return Outcome::Ignored;
        }

        debug!("Received {}", command);
        let outcome = self.dispatcher.dispatch(command, self.role.as_ref()).await;
        if let Outcome::Reply(ack) = &outcome {
            if let Err(e) = self.session.send(ack.clone()).await {
                error!("Failed to send {}: {}", ack, e);
            }
        }
        outcome
    }

    fn accepts(&self, topic: &Topic) -> bool {
        let address = self.address();
        if topic.channel_id != address.channel_id() {
            return false;
        }
        // Only reports travel on the broadcast receiver
        topic.receiver == address.node_id() || (topic.is_broadcast() && topic.kind.is_report())
    }

    /// Call `action` on node `receiver`.
    ///
    /// Returns the call sequence once the call is registered and published.
    /// The outcome arrives later through `callback`: [`CallStatus::Ok`] with
    /// the ack, or [`CallStatus::Timeout`] from a sweep or a late ack.
    pub async fn call_method(
        &self,
        receiver: u64,
        action: &str,
        params: Option<Params>,
        callback: Option<CallCallback>,
    ) -> ProtocolResult<u64> {
        if receiver == BROADCAST {
            return Err(ProtocolError::BroadcastCall);
        }
        if action.is_empty() {
            return Err(ProtocolError::MissingField("action"));
        }

        // Registered before publishing so the ack cannot outrun it
        let call_seq = self.registry.issue(action, callback);
        let sent = match Command::call(receiver, action, call_seq, params) {
            Ok(call) => {
                self.session
                    .send(call)
                    .instrument(self.session.span().clone())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            self.registry.withdraw(call_seq);
            return Err(e);
        }
        Ok(call_seq)
    }

    /// Call `action` on node `receiver` and wait for the outcome.
    ///
    /// Resolves with [`CallStatus::Timeout`] after the call timeout even if
    /// no sweeper is running.
    pub async fn call(
        &self,
        receiver: u64,
        action: &str,
        params: Option<Params>,
    ) -> ProtocolResult<CallReply> {
        let (tx, mut rx) = oneshot::channel();
        let callback: CallCallback = Box::new(move |reply| {
            let _ = tx.send(reply);
        });
        let call_seq = self.call_method(receiver, action, params, Some(callback)).await?;

        match tokio::time::timeout(self.registry.timeout(), &mut rx).await {
            Ok(reply) => reply.map_err(|_| TransportError::Closed.into()),
            Err(_) => {
                if let Some(pending) = self.registry.withdraw(call_seq) {
                    let elapsed = pending.elapsed(Instant::now());
                    pending.complete(CallStatus::Timeout, elapsed, None);
                }
                rx.await.map_err(|_| TransportError::Closed.into())
            }
        }
    }

    /// Send an event report. Events are never throttled.
    pub async fn report_event(&self, action: &str, params: Option<Params>) -> ProtocolResult<()> {
        let event = Command::event(action, params)?;
        self.session
            .send(event)
            .instrument(self.session.span().clone())
            .await
    }

    /// Send a property report if the values changed or the minimum report
    /// interval has passed. Returns whether a report was sent.
    pub async fn report_property(&self, params: Params) -> ProtocolResult<bool> {
        let reporter = self.role.reporter().ok_or(ProtocolError::RoleMismatch {
            operation: "report_property",
            role: self.role.name(),
        })?;

        if !reporter.admit(&params, Instant::now()) {
            return Ok(false);
        }
        let sent = self
            .session
            .send(Command::property(params))
            .instrument(self.session.span().clone())
            .await;
        if let Err(e) = sent {
            reporter.invalidate();
            return Err(e);
        }
        Ok(true)
    }

    /// Expire calls that have waited longer than the call timeout and
    /// notify their callbacks. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let _enter = self.session.span().enter();
        let expired = self.registry.sweep(now);
        let count = expired.len();
        for call in expired {
            let elapsed = call.elapsed(now);
            warn!("Call #{} ({}) timed out after {:?}", call.call_seq(), call.action(), elapsed);
            call.complete(CallStatus::Timeout, elapsed, None);
        }
        count
    }

    /// Sweep expired calls every `sweep_interval_ms` until the endpoint is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let endpoint = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                endpoint.sweep_expired();
            }
        })
    }

    /// Last will to register with the broker, if the role has one.
    pub fn last_will(&self) -> ProtocolResult<Option<LastWill>> {
        self.role
            .farewell()
            .map(|command| LastWill::from_command(self.address(), &command, self.session.codec()))
            .transpose()
    }

    /// Publish the role's farewell event before an orderly shutdown.
    pub async fn go_offline(&self) -> ProtocolResult<()> {
        match self.role.farewell() {
            Some(command) => {
                self.session
                    .send(command)
                    .instrument(self.session.span().clone())
                    .await
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InboundHandler for Endpoint {
    async fn on_connected(&self) {
        if let Err(e) = self.connected().await {
            error!(parent: self.session.span(), "Connect hook failed: {}", e);
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle_message(topic, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::LoggingObserver;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn test_construction_validates_config() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        assert!(matches!(
            Endpoint::node(EndpointConfig::new(1, 0), conn.transport()),
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_builtin_handlers_registered() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::node(EndpointConfig::new(1, 5), broker.connect().transport()).unwrap();
        assert!(endpoint.dispatcher().has_handler(crate::command::actions::PING));
        assert_eq!(endpoint.role_name(), "node");
    }

    #[tokio::test]
    async fn test_controller_cannot_report_properties() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::controller(
            EndpointConfig::new(1, 9),
            broker.connect().transport(),
            Arc::new(LoggingObserver),
        )
        .unwrap();
        assert!(matches!(
            endpoint.report_property(Params::new()).await,
            Err(ProtocolError::RoleMismatch { role: "controller", .. })
        ));
        assert!(endpoint.last_will().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_call_method_contract() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::node(EndpointConfig::new(1, 5), broker.connect().transport()).unwrap();
        assert!(matches!(
            endpoint.call_method(0, "x", None, None).await,
            Err(ProtocolError::BroadcastCall)
        ));
        assert!(matches!(
            endpoint.call_method(9, "", None, None).await,
            Err(ProtocolError::MissingField("action"))
        ));
        assert!(endpoint.registry().is_empty());
        assert!(broker.history().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_withdraws_call() {
        let broker = MemoryBroker::new();
        let conn = broker.connect();
        let transport = conn.transport();
        let endpoint = Endpoint::node(EndpointConfig::new(1, 5), transport.clone()).unwrap();
        transport.close();

        assert!(matches!(
            endpoint.call_method(9, "x", None, None).await,
            Err(ProtocolError::Transport(TransportError::Closed))
        ));
        assert!(endpoint.registry().is_empty());
    }

    #[tokio::test]
    async fn test_connected_subscriptions() {
        let broker = MemoryBroker::new();
        let controller = Endpoint::controller(
            EndpointConfig::new(1, 9),
            broker.connect().transport(),
            Arc::new(LoggingObserver),
        )
        .unwrap();
        controller.connected().await.unwrap();
        assert_eq!(
            controller.session().subscriptions(),
            vec!["yqmiot/1/0/#".to_string(), "yqmiot/1/9/#".to_string()]
        );

        let node = Endpoint::node(EndpointConfig::new(1, 5), broker.connect().transport()).unwrap();
        node.connected().await.unwrap();
        assert_eq!(node.session().subscriptions(), vec!["yqmiot/1/5/#".to_string()]);
        assert_eq!(broker.published_on("yqmiot/1/0/5/event").len(), 1);
    }

    #[tokio::test]
    async fn test_last_will_topic() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::node(EndpointConfig::new(1, 5), broker.connect().transport()).unwrap();
        let will = endpoint.last_will().unwrap().unwrap();
        assert_eq!(will.topic, "yqmiot/1/0/5/event");
        let cmd = Command::from_wire(&will.topic, &will.payload, &JsonCodec).unwrap();
        assert_eq!(cmd.action(), Some(crate::command::actions::OFFLINE));
    }
}
