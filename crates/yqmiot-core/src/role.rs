//! Endpoint roles.
//!
//! An endpoint is the shared core (session, call registry, dispatcher) plus
//! one role object selected at construction:
//!
//! - [`NodeRole`] announces itself when connected, reports properties and
//!   events, and ignores broadcasts except from peers it watches.
//! - [`ControllerRole`] listens on the channel broadcast and hands every
//!   property and event report to a [`ReportObserver`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::codec::Params;
use crate::command::{actions, Command, CommandKind};
use crate::dispatcher::{builtin_handlers, ActionHandler};
use crate::error::ProtocolResult;
use crate::reporter::PropertyReporter;
use crate::session::Session;
use crate::topic::sender_broadcast_filter;

/// Role-specific behaviour of an endpoint.
#[async_trait]
pub trait Role: Send + Sync {
    /// Role name for logs.
    fn name(&self) -> &'static str;

    /// Called after every (re)connect, once the endpoint has subscribed to
    /// its own inbox.
    async fn on_connected(&self, session: &Session) -> ProtocolResult<()>;

    /// Called for every property or event report delivered to the endpoint.
    fn on_report(&self, report: &Command);

    /// Handlers registered when the endpoint is built.
    fn default_action_handlers(&self) -> Vec<(&'static str, Arc<dyn ActionHandler>)> {
        builtin_handlers()
    }

    /// Property throttling state, for roles that report properties.
    fn reporter(&self) -> Option<&PropertyReporter> {
        None
    }

    /// Event published for this endpoint when it goes away.
    fn farewell(&self) -> Option<Command> {
        None
    }
}

/// Consumer of property and event reports.
pub trait ReportObserver: Send + Sync {
    fn on_property(&self, _sender: u64, _params: &Params) {}

    fn on_event(&self, _sender: u64, _action: &str, _params: Option<&Params>) {}
}

/// Observer that logs every report.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ReportObserver for LoggingObserver {
    fn on_property(&self, sender: u64, params: &Params) {
        info!("Node {} property {}", sender, serde_json::Value::Object(params.clone()));
    }

    fn on_event(&self, sender: u64, action: &str, params: Option<&Params>) {
        match params {
            Some(params) => info!(
                "Node {} event {} {}",
                sender,
                action,
                serde_json::Value::Object(params.clone())
            ),
            None => info!("Node {} event {}", sender, action),
        }
    }
}

fn forward_report(observer: &dyn ReportObserver, report: &Command) {
    match report.kind() {
        CommandKind::Property => {
            let empty = Params::new();
            observer.on_property(report.sender(), report.params().unwrap_or(&empty));
        }
        CommandKind::Event => {
            observer.on_event(
                report.sender(),
                report.action().unwrap_or_default(),
                report.params(),
            );
        }
        CommandKind::Call | CommandKind::Ack => {}
    }
}

/// A device endpoint.
pub struct NodeRole {
    reporter: PropertyReporter,
    watched: BTreeSet<u64>,
    observer: Option<Arc<dyn ReportObserver>>,
}

impl NodeRole {
    pub fn new(report_min_interval: Duration) -> Self {
        Self {
            reporter: PropertyReporter::new(report_min_interval),
            watched: BTreeSet::new(),
            observer: None,
        }
    }

    /// Listen to the broadcast reports of node `sender`.
    pub fn watch(mut self, sender: u64) -> Self {
        self.watched.insert(sender);
        self
    }

    /// Observer for reports from watched nodes.
    pub fn with_observer(mut self, observer: Arc<dyn ReportObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn watched(&self) -> impl Iterator<Item = u64> + '_ {
        self.watched.iter().copied()
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::new(crate::reporter::DEFAULT_REPORT_MIN_INTERVAL)
    }
}

#[async_trait]
impl Role for NodeRole {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn on_connected(&self, session: &Session) -> ProtocolResult<()> {
        let channel_id = session.address().channel_id();
        for sender in &self.watched {
            session.subscribe(&sender_broadcast_filter(channel_id, *sender)).await?;
        }
        // Resend full state after every reconnect
        self.reporter.invalidate();
        session.send(Command::event(actions::ONLINE, None)?).await
    }

    fn on_report(&self, report: &Command) {
        match &self.observer {
            Some(observer) if self.watched.contains(&report.sender()) => {
                forward_report(observer.as_ref(), report)
            }
            _ => debug!("Node ignoring {} from node {}", report.kind(), report.sender()),
        }
    }

    fn reporter(&self) -> Option<&PropertyReporter> {
        Some(&self.reporter)
    }

    fn farewell(&self) -> Option<Command> {
        Command::event(actions::OFFLINE, None).ok()
    }
}

/// An aggregating endpoint.
pub struct ControllerRole {
    observer: Arc<dyn ReportObserver>,
}

impl ControllerRole {
    pub fn new(observer: Arc<dyn ReportObserver>) -> Self {
        Self { observer }
    }
}

impl Default for ControllerRole {
    fn default() -> Self {
        Self::new(Arc::new(LoggingObserver))
    }
}

#[async_trait]
impl Role for ControllerRole {
    fn name(&self) -> &'static str {
        "controller"
    }

    async fn on_connected(&self, session: &Session) -> ProtocolResult<()> {
        session.subscribe(&session.address().broadcast_filter()).await
    }

    fn on_report(&self, report: &Command) {
        forward_report(self.observer.as_ref(), report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counter {
        properties: Mutex<Vec<u64>>,
    }

    impl ReportObserver for Counter {
        fn on_property(&self, sender: u64, _params: &Params) {
            self.properties.lock().push(sender);
        }
    }

    #[test]
    fn test_node_forwards_only_watched() {
        let counter = Arc::new(Counter::default());
        let role = NodeRole::default().watch(7).with_observer(counter.clone());

        role.on_report(&Command::property(Params::new()).with_sender(7));
        role.on_report(&Command::property(Params::new()).with_sender(8));
        assert_eq!(*counter.properties.lock(), vec![7]);
        assert_eq!(role.watched().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_role_capabilities() {
        let node = NodeRole::default();
        assert_eq!(node.name(), "node");
        assert!(node.reporter().is_some());
        assert_eq!(node.farewell().unwrap().action(), Some(actions::OFFLINE));

        let controller = ControllerRole::default();
        assert_eq!(controller.name(), "controller");
        assert!(controller.reporter().is_none());
        assert!(controller.farewell().is_none());
        assert_eq!(controller.default_action_handlers().len(), 2);
    }
}
