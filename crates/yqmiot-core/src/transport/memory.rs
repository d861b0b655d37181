//! In-process broker.
//!
//! Routes publishes to every connected client whose subscriptions match,
//! with MQTT filter semantics and per-client delivery order. Each publish is
//! delivered at most once per client even when several filters match.
//! Every publish is also kept in a history for inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{InboundHandler, LastWill, Transport};
use crate::error::{TransportError, TransportResult};
use crate::topic::topic_matches;

type Inbox = mpsc::UnboundedSender<(String, Vec<u8>)>;

/// A message seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct ClientSlot {
    filters: Vec<String>,
    inbox: Inbox,
    last_will: Option<LastWill>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientSlot>,
    history: Vec<PublishRecord>,
    next_client_id: u64,
}

/// In-process pub/sub broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client.
    pub fn connect(&self) -> MemoryConnection {
        self.connect_with_will(None)
    }

    /// Connect a new client with a last will, published if the client
    /// drops without closing cleanly.
    pub fn connect_with_will(&self, last_will: Option<LastWill>) -> MemoryConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_client_id += 1;
            let id = state.next_client_id;
            state.clients.insert(
                id,
                ClientSlot {
                    filters: Vec::new(),
                    inbox: tx,
                    last_will,
                },
            );
            id
        };
        debug!("Memory broker client {} connected", id);

        MemoryConnection {
            transport: Arc::new(MemoryTransport {
                id,
                broker: self.clone(),
                closed: AtomicBool::new(false),
            }),
            inbox: rx,
        }
    }

    /// All messages published so far.
    pub fn history(&self) -> Vec<PublishRecord> {
        self.state.lock().history.clone()
    }

    /// Messages published on topics matching `filter`.
    pub fn published_on(&self, filter: &str) -> Vec<PublishRecord> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|record| topic_matches(filter, &record.topic))
            .cloned()
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    fn route(&self, topic: &str, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.history.push(PublishRecord {
            topic: topic.to_string(),
            payload: payload.clone(),
        });

        for (id, client) in &state.clients {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                trace!("Routing {} to client {}", topic, id);
                let _ = client.inbox.send((topic.to_string(), payload.clone()));
            }
        }
    }

    fn subscribe(&self, client_id: u64, filter: &str) -> TransportResult<()> {
        let mut state = self.state.lock();
        let client = state.clients.get_mut(&client_id).ok_or(TransportError::Closed)?;
        if !client.filters.iter().any(|f| f == filter) {
            client.filters.push(filter.to_string());
        }
        Ok(())
    }

    fn remove(&self, client_id: u64) -> Option<ClientSlot> {
        self.state.lock().clients.remove(&client_id)
    }
}

/// Client side of a memory broker connection.
pub struct MemoryTransport {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Close cleanly; the last will is discarded.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.remove(self.id);
        }
    }

    /// Drop the connection abruptly; the broker publishes the last will.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(will) = self.broker.remove(self.id).and_then(|slot| slot.last_will) {
            debug!("Publishing last will of client {} on {}", self.id, will.topic);
            self.broker.route(&will.topic, will.payload);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.broker.route(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.broker.subscribe(self.id, filter)
    }
}

/// A connected client: its transport plus its inbound queue.
pub struct MemoryConnection {
    transport: Arc<MemoryTransport>,
    inbox: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

impl MemoryConnection {
    pub fn transport(&self) -> Arc<MemoryTransport> {
        self.transport.clone()
    }

    /// Run `on_connected`, then deliver inbound messages on a background
    /// task until the connection closes.
    pub async fn start(self, handler: Arc<dyn InboundHandler>) -> JoinHandle<()> {
        handler.on_connected().await;

        let mut inbox = self.inbox;
        tokio::spawn(async move {
            while let Some((topic, payload)) = inbox.recv().await {
                handler.on_message(&topic, &payload).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_to_matching_subscribers() {
        let broker = MemoryBroker::new();
        let mut a = broker.connect();
        let mut b = broker.connect();

        a.transport.subscribe("yqmiot/1/5/#").await.unwrap();
        a.transport.subscribe("yqmiot/1/+/9/call").await.unwrap();
        b.transport.subscribe("yqmiot/1/0/#").await.unwrap();

        b.transport
            .publish("yqmiot/1/5/9/call", b"{}".to_vec())
            .await
            .unwrap();

        let (topic, _) = a.inbox.recv().await.unwrap();
        assert_eq!(topic, "yqmiot/1/5/9/call");
        // Delivered once despite two matching filters
        assert!(a.inbox.try_recv().is_err());
        assert!(b.inbox.try_recv().is_err());
        assert_eq!(broker.history().len(), 1);
    }

    #[tokio::test]
    async fn test_last_will_on_disconnect() {
        let broker = MemoryBroker::new();
        let observer = broker.connect();
        observer.transport.subscribe("yqmiot/#").await.unwrap();

        let node = broker.connect_with_will(Some(LastWill {
            topic: "yqmiot/1/0/5/event".to_string(),
            payload: b"bye".to_vec(),
        }));
        node.transport.disconnect();

        assert_eq!(broker.published_on("yqmiot/1/0/5/+").len(), 1);
        assert!(matches!(
            node.transport.publish("x", Vec::new()).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(broker.client_count(), 1);
    }

    #[tokio::test]
    async fn test_close_discards_will() {
        let broker = MemoryBroker::new();
        let node = broker.connect_with_will(Some(LastWill {
            topic: "yqmiot/1/0/5/event".to_string(),
            payload: Vec::new(),
        }));
        node.transport.close();
        node.transport.disconnect();
        assert!(broker.history().is_empty());
    }
}
