//! MQTT transport backed by `rumqttc`.
//!
//! The event loop is polled on its own task and inbound activity is queued
//! to a second task that drives the [`InboundHandler`]. Handlers can publish
//! and subscribe freely without stalling the loop that flushes those
//! requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{InboundHandler, LastWill, Transport};
use crate::config::EndpointConfig;
use crate::error::{TransportError, TransportResult};

/// Consecutive event loop errors tolerated before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Request channel capacity between client handles and the event loop.
const REQUEST_CAPACITY: usize = 64;

enum Inbound {
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

fn qos_level(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Publishing side of an MQTT connection.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
    client_id: String,
}

impl MqttTransport {
    /// Build a client for `config`. Nothing is sent until the returned
    /// connection is run.
    pub fn connect(config: &EndpointConfig, last_will: Option<LastWill>) -> (Self, MqttConnection) {
        let client_id = format!(
            "yqmiot-{}-{}-{}",
            config.channel_id,
            config.node_id,
            Uuid::new_v4().simple()
        );
        let qos = qos_level(config.qos);

        let mut options = MqttOptions::new(&client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(credential) = &config.credential {
            options.set_credentials(&credential.username, &credential.password);
        }
        if let Some(will) = last_will {
            options.set_last_will(rumqttc::LastWill::new(will.topic, will.payload, qos, false));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!("MQTT client {} targeting {}", client_id, config.broker_addr());

        (
            Self {
                client: client.clone(),
                qos,
                client_id: client_id.clone(),
            },
            MqttConnection {
                client,
                eventloop,
                client_id,
            },
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send a DISCONNECT; the broker drops the last will.
    pub async fn disconnect(&self) -> TransportResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        debug!("MQTT publish {} ({} bytes)", topic, payload.len());
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str) -> TransportResult<()> {
        debug!("MQTT subscribe {}", filter);
        self.client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Event loop side of an MQTT connection.
pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
}

impl MqttConnection {
    /// Poll the connection until it fails repeatedly or the client
    /// disconnects. `handler.on_connected` runs on every CONNACK, so
    /// subscriptions are restored after a reconnect.
    pub async fn run(self, handler: Arc<dyn InboundHandler>) -> TransportResult<()> {
        let MqttConnection {
            client,
            mut eventloop,
            client_id,
        } = self;
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();

        let dispatch = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Connected => handler.on_connected().await,
                    Inbound::Message { topic, payload } => handler.on_message(&topic, &payload).await,
                }
            }
        });

        let mut error_count = 0;
        let result = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    error_count = 0;
                    info!("MQTT client {} connected ({:?})", client_id, ack.code);
                    let _ = tx.send(Inbound::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    error_count = 0;
                    let _ = tx.send(Inbound::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("MQTT client {} disconnected by broker", client_id);
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    info!("MQTT client {} disconnecting", client_id);
                    break Ok(());
                }
                Ok(_) => {
                    error_count = 0;
                }
                Err(e) => {
                    error_count += 1;
                    if error_count >= MAX_CONSECUTIVE_ERRORS {
                        error!(
                            "MQTT client {} error count reached {}, stopping: {}",
                            client_id, MAX_CONSECUTIVE_ERRORS, e
                        );
                        break Err(TransportError::Connection(e.to_string()));
                    }
                    warn!(
                        "MQTT client {} error ({}/{}): {}",
                        client_id, error_count, MAX_CONSECUTIVE_ERRORS, e
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        drop(tx);
        drop(client);
        let _ = dispatch.await;
        info!("MQTT client {} connection closed", client_id);
        result
    }
}
