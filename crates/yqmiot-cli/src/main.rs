//! Command-line node, controller and traffic monitor for yqmiot.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use yqmiot_core::topic::{all_traffic_filter, NAMESPACE};
use yqmiot_core::Params;

mod run;
mod settings;

use run::NodeOptions;
use settings::ConnectionArgs;

/// yqmiot - device commands over MQTT.
#[derive(Parser, Debug)]
#[command(name = "yqmiot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node that reports properties and answers calls.
    Node {
        /// Seconds between property reports.
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
        /// Property to report, as key=value (value parsed as JSON if possible).
        #[arg(short = 'P', long = "property", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
        /// Emit a test event after connecting.
        #[arg(long)]
        emit_test_event: bool,
        /// Log the broadcast reports of this peer node.
        #[arg(long)]
        watch: Vec<u64>,
    },
    /// Run a controller that pings nodes and logs channel reports.
    Controller {
        /// Node to ping.
        #[arg(short, long = "target", required = true)]
        targets: Vec<u64>,
        /// Milliseconds between pings.
        #[arg(long, default_value_t = 3000)]
        ping_interval_ms: u64,
    },
    /// Log every command seen on the broker.
    Monitor {
        /// Topic filter; defaults to all yqmiot traffic, or one channel
        /// when --channel is given.
        #[arg(long)]
        filter: Option<String>,
    },
}

fn parse_property(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty property name in '{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_logging(verbose: bool) {
    // JSON logs for containers
    let json_logging = std::env::var("YQMIOT_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "yqmiot=debug" } else { "yqmiot=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Node {
            interval,
            properties,
            emit_test_event,
            watch,
        } => {
            let mut params: Params = properties.into_iter().collect();
            if params.is_empty() {
                params.insert("version".to_string(), Value::from(yqmiot_core::VERSION));
            }
            let options = NodeOptions {
                interval: Duration::from_secs(interval.max(1)),
                properties: params,
                emit_test_event,
                watch,
            };
            run::run_node(&args.connection, options).await
        }
        Command::Controller {
            targets,
            ping_interval_ms,
        } => {
            let interval = Duration::from_millis(ping_interval_ms.max(1));
            run::run_controller(&args.connection, targets, interval).await
        }
        Command::Monitor { filter } => {
            let filter = filter.unwrap_or_else(|| match args.connection.channel {
                Some(channel) => format!("{}/{}/#", NAMESPACE, channel),
                None => all_traffic_filter(),
            });
            run::run_monitor(&args.connection, filter).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node() {
        let args = Args::try_parse_from([
            "yqmiot",
            "node",
            "--channel",
            "1",
            "--node",
            "5",
            "-P",
            "temperature=21.5",
            "-P",
            "mode=eco",
            "--watch",
            "7",
        ])
        .unwrap();

        assert_eq!(args.connection.channel, Some(1));
        assert_eq!(args.connection.node, Some(5));
        match args.command {
            Command::Node {
                interval,
                properties,
                emit_test_event,
                watch,
            } => {
                assert_eq!(interval, 5);
                assert_eq!(
                    properties,
                    vec![
                        ("temperature".to_string(), serde_json::json!(21.5)),
                        ("mode".to_string(), Value::String("eco".to_string())),
                    ]
                );
                assert!(!emit_test_event);
                assert_eq!(watch, vec![7]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_controller() {
        let args = Args::try_parse_from([
            "yqmiot",
            "--broker",
            "iot.example.org",
            "controller",
            "-t",
            "1000",
            "-t",
            "1001",
        ])
        .unwrap();
        assert_eq!(args.connection.broker.as_deref(), Some("iot.example.org"));
        assert!(matches!(
            args.command,
            Command::Controller { ref targets, ping_interval_ms: 3000 } if targets == &vec![1000, 1001]
        ));

        assert!(Args::try_parse_from(["yqmiot", "controller"]).is_err());
    }

    #[test]
    fn test_credentials_come_in_pairs() {
        assert!(Args::try_parse_from(["yqmiot", "monitor", "--username", "u"]).is_err());
        assert!(Args::try_parse_from(["yqmiot", "monitor", "--username", "u", "--password", "p"]).is_ok());
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("on=true").unwrap(), ("on".to_string(), Value::Bool(true)));
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=1").is_err());
    }
}
