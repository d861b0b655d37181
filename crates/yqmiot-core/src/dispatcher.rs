//! Inbound command dispatch.
//!
//! Every decoded command is classified by kind:
//!
//! | Kind | Destination |
//! |------|-------------|
//! | `call` | action handler registered under the call's action |
//! | `ack` | [`CallRegistry::resolve`] |
//! | `property` / `event` | the endpoint role |
//!
//! Faults are contained per command: an unknown action, a failing or
//! panicking handler, or an unmatched ack is logged and dropped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::codec::Params;
use crate::command::{actions, Command, CommandKind};
use crate::error::ProtocolError;
use crate::registry::{CallRegistry, CallStatus};
use crate::role::Role;

/// Result of an action handler: parameters for the ack.
pub type HandlerResult = anyhow::Result<Option<Params>>;

/// Services calls for one action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handle `call`. `Ok` is acked with the returned params; `Err` is
    /// logged and left unanswered, so the caller times out.
    async fn handle(&self, call: &Command) -> HandlerResult;
}

/// Adapter turning a closure into an [`ActionHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(&Command) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, call: &Command) -> HandlerResult {
        (self.0)(call)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(&Command) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Built-in liveness handler: acks with no params.
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl ActionHandler for PingHandler {
    async fn handle(&self, call: &Command) -> HandlerResult {
        debug!("Ping #{:?} from node {}", call.call_seq(), call.sender());
        Ok(None)
    }
}

/// What happened to an inbound command.
#[derive(Debug)]
pub enum Outcome {
    /// A call was handled; this ack should be sent back
    Reply(Command),
    /// An ack completed a pending call
    Resolved { call_seq: u64, status: CallStatus },
    /// A report was handed to the role
    Reported,
    /// The message was addressed to someone else
    Ignored,
    /// The command was dropped
    Dropped(ProtocolError),
}

/// Routes inbound commands for one endpoint.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    registry: Arc<CallRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Register the handler for `action`, returning any handler it replaces.
    pub fn register(
        &self,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.write().insert(action.into(), handler)
    }

    /// Remove the handler for `action`. Built-in ping actions can be
    /// replaced with [`register`](Self::register) but not removed.
    pub fn unregister(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        if is_builtin(action) {
            warn!("Refusing to unregister built-in action {}", action);
            return None;
        }
        self.handlers.write().remove(action)
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Route one command.
    pub async fn dispatch(&self, command: Command, role: &dyn Role) -> Outcome {
        match command.kind() {
            CommandKind::Call => self.serve_call(command).await,
            CommandKind::Ack => self.resolve_ack(command),
            CommandKind::Property | CommandKind::Event => {
                role.on_report(&command);
                Outcome::Reported
            }
        }
    }

    async fn serve_call(&self, call: Command) -> Outcome {
        let action = call.action().unwrap_or_default().to_string();
        let handler = self.handlers.read().get(&action).cloned();
        let Some(handler) = handler else {
            let err = ProtocolError::UnknownAction(action);
            warn!("Dropping call #{:?} from node {}: {}", call.call_seq(), call.sender(), err);
            return Outcome::Dropped(err);
        };

        let result = AssertUnwindSafe(handler.handle(&call)).catch_unwind().await;
        let params = match result {
            Ok(Ok(params)) => params,
            Ok(Err(e)) => return Self::handler_fault(&call, action, e.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                return Self::handler_fault(&call, action, reason);
            }
        };

        match call.reply(params) {
            Ok(ack) => Outcome::Reply(ack),
            Err(e) => Outcome::Dropped(e),
        }
    }

    fn handler_fault(call: &Command, action: String, reason: String) -> Outcome {
        let err = ProtocolError::HandlerFault { action, reason };
        warn!("Call #{:?} from node {} not acked: {}", call.call_seq(), call.sender(), err);
        Outcome::Dropped(err)
    }

    fn resolve_ack(&self, ack: Command) -> Outcome {
        let call_seq = ack.call_seq().unwrap_or_default();
        match self.registry.resolve(&ack) {
            Some(resolution) => {
                let status = resolution.status;
                debug!(
                    "Call #{} ({}) completed {:?} in {:?}",
                    call_seq,
                    resolution.pending.action(),
                    status,
                    resolution.elapsed
                );
                resolution.complete(ack);
                Outcome::Resolved { call_seq, status }
            }
            None => Outcome::Dropped(ProtocolError::StaleOrUnknownAck(call_seq)),
        }
    }
}

fn is_builtin(action: &str) -> bool {
    action == actions::PING || action == actions::LEGACY_PING
}

/// Handlers every role starts with.
pub fn builtin_handlers() -> Vec<(&'static str, Arc<dyn ActionHandler>)> {
    let ping: Arc<dyn ActionHandler> = Arc::new(PingHandler);
    vec![(actions::PING, ping.clone()), (actions::LEGACY_PING, ping)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{ControllerRole, NodeRole, ReportObserver};
    use parking_lot::Mutex;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new(Arc::new(CallRegistry::default()));
        for (action, handler) in builtin_handlers() {
            dispatcher.register(action, handler);
        }
        dispatcher
    }

    fn call(action: &str, seq: u64) -> Command {
        Command::call(9, action, seq, None).unwrap().with_sender(5)
    }

    #[tokio::test]
    async fn test_ping_replies_with_empty_ack() {
        let dispatcher = dispatcher();
        let role = NodeRole::default();

        for action in [actions::PING, actions::LEGACY_PING] {
            match dispatcher.dispatch(call(action, 3), &role).await {
                Outcome::Reply(ack) => {
                    assert_eq!(ack.kind(), CommandKind::Ack);
                    assert_eq!(ack.call_seq(), Some(3));
                    assert_eq!(ack.action(), Some(action));
                    assert_eq!(ack.receiver(), 5);
                    assert!(ack.params().is_none());
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_action_dropped() {
        let dispatcher = dispatcher();
        let outcome = dispatcher.dispatch(call("nope", 1), &NodeRole::default()).await;
        assert!(matches!(outcome, Outcome::Dropped(ProtocolError::UnknownAction(a)) if a == "nope"));
    }

    #[tokio::test]
    async fn test_handler_params_in_ack() {
        let dispatcher = dispatcher();
        dispatcher.register(
            "add",
            handler_fn(|call| {
                let a = call.param("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let b = call.param("b").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!({"sum": a + b}).as_object().cloned())
            }),
        );

        let params = json!({"a": 2, "b": 3}).as_object().cloned();
        let call = Command::call(9, "add", 4, params).unwrap().with_sender(5);
        match dispatcher.dispatch(call, &NodeRole::default()).await {
            Outcome::Reply(ack) => assert_eq!(ack.param("sum"), Some(&json!(5))),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_contained() {
        let dispatcher = dispatcher();
        dispatcher.register("fail", handler_fn(|_| Err(anyhow::anyhow!("relay stuck"))));
        dispatcher.register("boom", handler_fn(|_| panic!("exploded")));
        let role = NodeRole::default();

        let outcome = dispatcher.dispatch(call("fail", 1), &role).await;
        assert!(matches!(
            outcome,
            Outcome::Dropped(ProtocolError::HandlerFault { ref reason, .. }) if reason == "relay stuck"
        ));

        let outcome = dispatcher.dispatch(call("boom", 2), &role).await;
        assert!(matches!(
            outcome,
            Outcome::Dropped(ProtocolError::HandlerFault { ref reason, .. }) if reason == "exploded"
        ));

        // Still serving afterwards
        assert!(matches!(
            dispatcher.dispatch(call(actions::PING, 3), &role).await,
            Outcome::Reply(_)
        ));
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_call() {
        let dispatcher = dispatcher();
        let seq = dispatcher.registry().issue("x", None);
        let ack = Command::call(9, "x", seq, None)
            .unwrap()
            .with_sender(5)
            .reply(None)
            .unwrap()
            .with_sender(9);

        let role = NodeRole::default();
        assert!(matches!(
            dispatcher.dispatch(ack.clone(), &role).await,
            Outcome::Resolved { status: CallStatus::Ok, .. }
        ));
        assert!(matches!(
            dispatcher.dispatch(ack, &role).await,
            Outcome::Dropped(ProtocolError::StaleOrUnknownAck(s)) if s == seq
        ));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, Option<String>)>>,
    }

    impl ReportObserver for Recorder {
        fn on_property(&self, sender: u64, _params: &Params) {
            self.seen.lock().push((sender, None));
        }

        fn on_event(&self, sender: u64, action: &str, _params: Option<&Params>) {
            self.seen.lock().push((sender, Some(action.to_string())));
        }
    }

    #[tokio::test]
    async fn test_reports_go_to_role() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let role = ControllerRole::new(recorder.clone());

        let property = Command::property(Params::new()).with_sender(5);
        let event = Command::event(actions::ONLINE, None).unwrap().with_sender(6);
        assert!(matches!(dispatcher.dispatch(property, &role).await, Outcome::Reported));
        assert!(matches!(dispatcher.dispatch(event, &role).await, Outcome::Reported));

        assert_eq!(
            *recorder.seen.lock(),
            vec![(5, None), (6, Some(actions::ONLINE.to_string()))]
        );
    }

    #[test]
    fn test_register_replaces() {
        let dispatcher = dispatcher();
        assert!(dispatcher.register("x", Arc::new(PingHandler)).is_none());
        assert!(dispatcher.register("x", Arc::new(PingHandler)).is_some());
        assert!(dispatcher.unregister("x").is_some());
        assert!(!dispatcher.has_handler("x"));

        assert!(dispatcher.unregister(actions::PING).is_none());
        assert!(dispatcher.unregister(actions::LEGACY_PING).is_none());
        assert!(dispatcher.has_handler(actions::PING));
        assert!(dispatcher.has_handler(actions::LEGACY_PING));
        assert_eq!(
            dispatcher.actions(),
            vec![actions::LEGACY_PING.to_string(), actions::PING.to_string()]
        );
    }
}
