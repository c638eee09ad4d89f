//! mqtt-bridge command line entry point
//!
//! `watch` connects through the rumqttc native layer, subscribes and prints
//! every message as one JSON line until Ctrl-C.

use clap::{Parser, Subcommand};
use mqtt_bridge::client::{ClientFactory, MqttClient, SubscribeRequest, SubscriptionHandle};
use mqtt_bridge::config::BridgeConfig;
use mqtt_bridge::error::BoxError;
use mqtt_bridge::native::RumqttcNative;
use mqtt_bridge::observability::{init_logging, metrics, LogFormat};
use mqtt_bridge::protocol::{ConnectionOptions, Qos};
use mqtt_bridge::router::EventRouter;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

/// MQTT client bridge
#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Event-driven MQTT client with automatic reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to topics and print messages as JSON lines
    Watch {
        /// Topic filters (`+` and `#` wildcards allowed)
        #[arg(required = true)]
        topics: Vec<String>,

        /// QoS for every subscription
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,

        /// Broker URL, overrides the configuration file
        #[arg(long, env = "MQTT_BROKER_URL")]
        broker: Option<String>,

        /// Client id used with --broker
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Watch {
            topics,
            qos,
            broker,
            client_id,
        } => {
            let config: Result<BridgeConfig, Box<dyn std::error::Error>> = match broker {
                Some(url) => {
                    let client_id =
                        client_id.unwrap_or_else(|| format!("mqtt-bridge-{}", uuid::Uuid::new_v4().simple()));
                    BridgeConfig::from_broker_url(client_id, &url).map_err(Into::into)
                }
                None => load_configuration(&cli.config),
            };
            match config {
                Ok(config) => watch(config, topics, qos).await,
                Err(e) => Err(e),
            }
        }
        Commands::Config { show } => {
            load_configuration(&cli.config).and_then(|config| handle_config_command(config, show))
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn setup_logging(verbose: u8) {
    if verbose == 0 {
        mqtt_bridge::observability::init_default_logging();
        return;
    }
    let level = if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    let format = std::env::var("LOG_FORMAT")
        .map(|f| LogFormat::parse(&f))
        .unwrap_or(LogFormat::Pretty);
    init_logging(level, format, false);
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BridgeConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["mqtt-bridge.toml", "config/mqtt-bridge.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BridgeConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config, pass --broker, or create mqtt-bridge.toml".into())
        }
    }
}

fn handle_config_command(config: BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

async fn watch(config: BridgeConfig, topics: Vec<String>, qos: u8) -> Result<(), Box<dyn std::error::Error>> {
    let qos = Qos::try_from(qos)?;
    let router = EventRouter::global();
    let native = Arc::new(RumqttcNative::new(Arc::clone(&router))?);
    let factory = ClientFactory::new(native)
        .with_router(router)
        .with_init_timeout(config.init_timeout());

    let client = factory
        .create(config.to_client_config()?)
        .await
        .ok_or("MQTT client initialization failed")?;

    install_callbacks(&client, &config);
    let subscriptions = subscribe_topics(&client, &topics, qos);

    client.connect();
    info!(
        broker = %client.identity().broker_url(),
        topics = topics.len(),
        "Watching; press Ctrl-C to stop"
    );

    signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");

    for subscription in &subscriptions {
        subscription.remove();
    }
    client.disconnect();
    // Let the native worker flush the DISCONNECT packet.
    sleep(Duration::from_millis(250)).await;
    client.remove();

    let snapshot = metrics().get_metrics();
    info!(
        delivered = snapshot.events.delivered,
        reconnects = snapshot.connections.reconnects_scheduled,
        "Bridge stopped"
    );
    Ok(())
}

fn install_callbacks(client: &MqttClient, config: &BridgeConfig) {
    client.set_on_connect_callback(|_| info!("Connected to broker"));
    client.set_on_connect_failure_callback(|code| warn!(reason_code = %code, "Connection attempt failed"));
    client.set_on_disconnect_callback(|code, details| {
        warn!(
            reason_code = %code,
            disconnect_type = ?details.disconnect_type,
            retry_count = details.retry_count,
            "Disconnected from broker"
        );
    });
    client.set_on_error_callback(|event| {
        error!(reason_code = %event.reason_code, message = %event.error_message, "MQTT error");
    });

    // Credentials may rotate while the bridge is running.
    let config = config.clone();
    client.set_on_reconnect_interceptor(move |reason| {
        let config = config.clone();
        async move {
            info!(last_reason = ?reason, "Refreshing credentials before reconnect");
            let options = config.connection_options()?;
            Ok::<_, BoxError>(Some(ConnectionOptions {
                username: options.username,
                password: options.password,
                ..Default::default()
            }))
        }
    });
}

fn subscribe_topics(client: &MqttClient, topics: &[String], qos: Qos) -> Vec<SubscriptionHandle> {
    topics
        .iter()
        .map(|topic| {
            let request = SubscribeRequest::new(topic.clone(), |message| {
                match serde_json::to_string(message) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode message"),
                }
            })
            .qos(qos)
            .on_success(|ack| info!(topic = %ack.topic, qos = %ack.qos, "Subscribed"))
            .on_error(|failure| error!(message = %failure.error_message, "Subscription failed"));
            client.subscribe(request)
        })
        .collect()
}
