//! Subcommand runners.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use yqmiot_core::{
    actions, handler_fn, CallCallback, CallStatus, Command, Endpoint, InboundHandler, JsonCodec,
    LastWill, LoggingObserver, MqttConnection, MqttTransport, NodeRole, Params, ProtocolError, Role,
    Transport, TransportResult,
};

use crate::settings::{describe, ConnectionArgs};

/// Node id used when no source configures one.
const DEFAULT_NODE_ID: u64 = 1000;
/// Controller id used when no source configures one.
const DEFAULT_CONTROLLER_ID: u64 = 4000;

/// Action served by the CLI node that acks with the call's own params.
pub const ECHO_ACTION: &str = "yqmiot.method.echo";

pub struct NodeOptions {
    pub interval: Duration,
    pub properties: Params,
    pub emit_test_event: bool,
    pub watch: Vec<u64>,
}

/// Run a node that reports `properties` every `interval` until Ctrl-C.
pub async fn run_node(connection: &ConnectionArgs, options: NodeOptions) -> Result<()> {
    let config = connection.resolve(DEFAULT_NODE_ID)?;
    info!(
        "Starting node {} on channel {} via {}",
        config.node_id,
        config.channel_id,
        describe(&config)
    );

    let mut role = NodeRole::new(config.report_min_interval());
    for peer in &options.watch {
        role = role.watch(*peer);
    }
    let role = role.with_observer(Arc::new(LoggingObserver));
    let will = role
        .farewell()
        .map(|command| LastWill::from_command(config.address()?, &command, &JsonCodec))
        .transpose()?;

    let (transport, mqtt) = MqttTransport::connect(&config, will);
    let transport = Arc::new(transport);
    let endpoint = Arc::new(Endpoint::new(config, Arc::new(role), transport.clone())?);
    endpoint.register_action(ECHO_ACTION, handler_fn(|call| Ok(call.params().cloned())));

    let mut running = Running::start(&endpoint, mqtt);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(options.interval);
    let mut first = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if first && options.emit_test_event {
                    if let Err(e) = endpoint.report_event(actions::TEST, None).await {
                        log_failure("Test event", &e);
                    }
                }
                first = false;
                match endpoint.report_property(options.properties.clone()).await {
                    Ok(true) => debug!("Reported properties"),
                    Ok(false) => debug!("Properties unchanged, report suppressed"),
                    Err(e) => log_failure("Property report", &e),
                }
            }
            result = &mut running.connection => return connection_ended(result),
            _ = &mut shutdown => break,
        }
    }

    if let Err(e) = endpoint.go_offline().await {
        log_failure("Offline announcement", &e);
    }
    running.stop(&transport).await
}

/// Run a controller that pings `targets` every `ping_interval` and logs
/// every report on the channel.
pub async fn run_controller(
    connection: &ConnectionArgs,
    targets: Vec<u64>,
    ping_interval: Duration,
) -> Result<()> {
    let config = connection.resolve(DEFAULT_CONTROLLER_ID)?;
    info!(
        "Starting controller {} on channel {} via {}, pinging {:?}",
        config.node_id,
        config.channel_id,
        describe(&config),
        targets
    );

    let (transport, mqtt) = MqttTransport::connect(&config, None);
    let transport = Arc::new(transport);
    let endpoint = Arc::new(Endpoint::controller(
        config,
        transport.clone(),
        Arc::new(LoggingObserver),
    )?);

    let mut running = Running::start(&endpoint, mqtt);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(ping_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for &target in &targets {
                    let callback = Some(ping_callback(target));
                    if let Err(e) = endpoint.call_method(target, actions::PING, None, callback).await {
                        log_failure(&format!("Ping node {}", target), &e);
                    }
                }
            }
            result = &mut running.connection => return connection_ended(result),
            _ = &mut shutdown => break,
        }
    }

    running.stop(&transport).await
}

/// Misuse of the API is an error; transport trouble is expected to pass.
fn log_failure(what: &str, e: &ProtocolError) {
    if e.is_contract_violation() {
        error!("{} rejected: {}", what, e);
    } else {
        warn!("{} failed: {}", what, e);
    }
}

fn ping_callback(target: u64) -> CallCallback {
    Box::new(move |reply| match reply.status {
        CallStatus::Ok => info!("Ping node {} #{}: {:?}", target, reply.call_seq, reply.elapsed),
        CallStatus::Timeout => warn!(
            "Ping node {} #{} timed out after {:?}",
            target, reply.call_seq, reply.elapsed
        ),
    })
}

/// Log every command seen on `filter` until Ctrl-C.
pub async fn run_monitor(connection: &ConnectionArgs, filter: String) -> Result<()> {
    let config = connection.merge()?;
    info!("Monitoring {} via {}", filter, describe(&config));

    let (transport, mqtt) = MqttTransport::connect(&config, None);
    let transport = Arc::new(transport);
    let monitor = Arc::new(Monitor {
        filter,
        transport: transport.clone(),
    });

    let mut connection = tokio::spawn(mqtt.run(monitor));
    tokio::select! {
        result = &mut connection => return connection_ended(result),
        _ = tokio::signal::ctrl_c() => {}
    }
    transport.disconnect().await?;
    connection.await.context("MQTT connection task failed")??;
    Ok(())
}

/// Decodes and logs every message on a filter.
struct Monitor {
    filter: String,
    transport: Arc<MqttTransport>,
}

#[async_trait]
impl InboundHandler for Monitor {
    async fn on_connected(&self) {
        if let Err(e) = self.transport.subscribe(&self.filter).await {
            warn!("Failed to subscribe to {}: {}", self.filter, e);
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        match Command::from_wire(topic, payload, &JsonCodec) {
            Ok(command) => info!("{}", describe_command(&command)),
            Err(e) => warn!("Undecodable message on {}: {}", topic, e),
        }
    }
}

fn describe_command(command: &Command) -> String {
    let mut line = format!(
        "{} -> {} {}",
        command.sender(),
        command.receiver(),
        command.kind()
    );
    if let Some(action) = command.action() {
        line.push(' ');
        line.push_str(action);
    }
    if let Some(seq) = command.call_seq() {
        line.push_str(&format!(" #{}", seq));
    }
    if let Some(params) = command.params() {
        line.push(' ');
        line.push_str(&serde_json::Value::Object(params.clone()).to_string());
    }
    line
}

/// Background tasks of a connected endpoint.
struct Running {
    connection: JoinHandle<TransportResult<()>>,
    sweeper: JoinHandle<()>,
}

impl Running {
    fn start(endpoint: &Arc<Endpoint>, mqtt: MqttConnection) -> Self {
        let sweeper = endpoint.spawn_sweeper();
        let connection = tokio::spawn(mqtt.run(endpoint.clone()));
        Self { connection, sweeper }
    }

    async fn stop(self, transport: &MqttTransport) -> Result<()> {
        transport.disconnect().await?;
        self.sweeper.abort();
        self.connection.await.context("MQTT connection task failed")??;
        info!("Stopped");
        Ok(())
    }
}

fn connection_ended(result: Result<TransportResult<()>, tokio::task::JoinError>) -> Result<()> {
    result.context("MQTT connection task failed")??;
    info!("Connection closed");
    Ok(())
}
