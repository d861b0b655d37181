//! Property and event reporting tests.
//!
//! Tests include:
//! - Throttling of unchanged property reports
//! - Controllers observing node announcements and reports
//! - Nodes watching selected peers
//! - Offline announcement via last will and orderly shutdown

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use yqmiot_core::{
    actions, Command, Endpoint, EndpointConfig, JsonCodec, MemoryBroker, NodeRole, Params,
    ReportObserver,
};

fn params(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

#[derive(Debug, PartialEq)]
enum Report {
    Property(u64, Params),
    Event(u64, String),
}

struct ChannelObserver(mpsc::UnboundedSender<Report>);

impl ReportObserver for ChannelObserver {
    fn on_property(&self, sender: u64, params: &Params) {
        let _ = self.0.send(Report::Property(sender, params.clone()));
    }

    fn on_event(&self, sender: u64, action: &str, _params: Option<&Params>) {
        let _ = self.0.send(Report::Event(sender, action.to_string()));
    }
}

async fn start_controller(broker: &MemoryBroker) -> (Arc<Endpoint>, mpsc::UnboundedReceiver<Report>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = broker.connect();
    let controller = Arc::new(
        Endpoint::controller(
            EndpointConfig::new(1, 9),
            conn.transport(),
            Arc::new(ChannelObserver(tx)),
        )
        .unwrap(),
    );
    conn.start(controller.clone()).await;
    (controller, rx)
}

async fn start_node(broker: &MemoryBroker, node_id: u64) -> Arc<Endpoint> {
    let conn = broker.connect();
    let node = Arc::new(Endpoint::node(EndpointConfig::new(1, node_id), conn.transport()).unwrap());
    conn.start(node.clone()).await;
    node
}

#[tokio::test(start_paused = true)]
async fn test_property_throttling() {
    let broker = MemoryBroker::new();
    let node = start_node(&broker, 5).await;
    let topic = "yqmiot/1/0/5/property";

    assert!(node.report_property(params(json!({"a": 1}))).await.unwrap());
    assert!(!node.report_property(params(json!({"a": 1}))).await.unwrap());
    assert_eq!(broker.published_on(topic).len(), 1);

    assert!(node.report_property(params(json!({"a": 2}))).await.unwrap());
    assert_eq!(broker.published_on(topic).len(), 2);

    tokio::time::advance(Duration::from_millis(9_000)).await;
    assert!(!node.report_property(params(json!({"a": 2}))).await.unwrap());

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert!(node.report_property(params(json!({"a": 2}))).await.unwrap());

    let sent = broker.published_on(topic);
    assert_eq!(sent.len(), 3);
    let last = Command::from_wire(&sent[2].topic, &sent[2].payload, &JsonCodec).unwrap();
    assert_eq!(last.param("a"), Some(&json!(2)));
    assert!(last.action().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_controller_observes_node() {
    let broker = MemoryBroker::new();
    let (_controller, mut reports) = start_controller(&broker).await;
    let node = start_node(&broker, 5).await;

    assert_eq!(
        reports.recv().await,
        Some(Report::Event(5, actions::ONLINE.to_string()))
    );

    node.report_property(params(json!({"temperature": 21.5})))
        .await
        .unwrap();
    assert_eq!(
        reports.recv().await,
        Some(Report::Property(5, params(json!({"temperature": 21.5}))))
    );

    node.report_event(actions::TEST, None).await.unwrap();
    assert_eq!(
        reports.recv().await,
        Some(Report::Event(5, actions::TEST.to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_controller_ignores_other_channels() {
    let broker = MemoryBroker::new();
    let (_controller, mut reports) = start_controller(&broker).await;

    let conn = broker.connect();
    let stranger = Arc::new(Endpoint::node(EndpointConfig::new(2, 5), conn.transport()).unwrap());
    conn.start(stranger.clone()).await;
    stranger.report_property(params(json!({"a": 1}))).await.unwrap();

    let node = start_node(&broker, 6).await;
    node.report_event("yqmiot.event.door", None).await.unwrap();

    assert_eq!(
        reports.recv().await,
        Some(Report::Event(6, actions::ONLINE.to_string()))
    );
    assert_eq!(
        reports.recv().await,
        Some(Report::Event(6, "yqmiot.event.door".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_node_watches_peer() {
    let broker = MemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let conn = broker.connect();
    let role = NodeRole::new(Duration::from_secs(10))
        .watch(7)
        .with_observer(Arc::new(ChannelObserver(tx)));
    let watcher = Arc::new(
        Endpoint::new(EndpointConfig::new(1, 5), Arc::new(role), conn.transport()).unwrap(),
    );
    conn.start(watcher.clone()).await;

    let other = start_node(&broker, 8).await;
    other.report_property(params(json!({"x": 1}))).await.unwrap();

    let peer = start_node(&broker, 7).await;
    peer.report_property(params(json!({"x": 2}))).await.unwrap();

    assert_eq!(rx.recv().await, Some(Report::Event(7, actions::ONLINE.to_string())));
    assert_eq!(rx.recv().await, Some(Report::Property(7, params(json!({"x": 2})))));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_offline_announcements() {
    let broker = MemoryBroker::new();
    let (_controller, mut reports) = start_controller(&broker).await;

    let conn = broker.connect_with_will(None);
    let node = Arc::new(Endpoint::node(EndpointConfig::new(1, 5), conn.transport()).unwrap());
    let will = node.last_will().unwrap();
    drop(node);

    // Abrupt loss: the broker publishes the will
    let conn = broker.connect_with_will(will);
    let transport = conn.transport();
    let node = Arc::new(Endpoint::node(EndpointConfig::new(1, 5), transport.clone()).unwrap());
    conn.start(node.clone()).await;
    assert_eq!(reports.recv().await, Some(Report::Event(5, actions::ONLINE.to_string())));

    transport.disconnect();
    assert_eq!(reports.recv().await, Some(Report::Event(5, actions::OFFLINE.to_string())));

    // Orderly shutdown: the node says goodbye itself
    let node = start_node(&broker, 6).await;
    assert_eq!(reports.recv().await, Some(Report::Event(6, actions::ONLINE.to_string())));
    node.go_offline().await.unwrap();
    assert_eq!(reports.recv().await, Some(Report::Event(6, actions::OFFLINE.to_string())));
}
