//! tuya2mqtt - bridge entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tuya2mqtt::bridge::Bridge;
use tuya2mqtt::config::BridgeConfig;
use tuya2mqtt::error::BridgeResult;
use tuya2mqtt::observability::init_default_logging;
use tuya2mqtt::transport::device::TcpDeviceClient;
use tuya2mqtt::transport::mqtt::MqttClient;

const DEFAULT_CONFIG_PATHS: &[&str] = &["tuya2mqtt.toml", "config/tuya2mqtt.toml"];

/// Bridge between local smart devices and an MQTT broker
#[derive(Parser)]
#[command(name = "tuya2mqtt")]
#[command(about = "Keeps MQTT retained state in sync with local smart devices")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TUYA2MQTT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run,
    /// Validate configuration
    Config {
        /// Print the parsed configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Flushes the log file when main returns
    let _log_guard = init_default_logging();

    info!("Starting tuya2mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Commands::Run => run_bridge(config).await.map_err(Into::into),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<()> {
    let username = config.get_mqtt_username();
    let password = config.get_mqtt_password()?;
    if config.mqtt.username_env.is_some() && username.is_none() {
        warn!("MQTT username variable is not set, connecting anonymously");
    }

    let broker = MqttClient::new(&config.mqtt, username.as_deref(), password.as_deref())?;
    let bridge = Bridge::from_config(&config, broker, TcpDeviceClient::new)?;

    info!(
        broker = %config.mqtt.broker_url,
        topic_root = %config.bridge.topic_root,
        devices = bridge.device_count(),
        "Bridge initialised"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut bridge_task = tokio::spawn(bridge.run(shutdown_rx));

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        finished = &mut bridge_task => {
            return finished?;
        }
    }

    let _ = shutdown_tx.send(true);
    bridge_task.await??;
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Surfaces unset key_env variables and undecodable secrets too
    config.device_identities()?;
    config.get_mqtt_password()?;

    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!(devices = config.devices.len(), "Configuration is valid");
    Ok(())
}
