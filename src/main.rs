//! hublink device daemon
//!
//! Connects a device to its IoT hub through the connection guardian, answers
//! direct methods, acknowledges desired-property patches and sends a periodic
//! telemetry heartbeat until interrupted or permanently disconnected.

use clap::{Parser, Subcommand};
use hublink::auth::EnvTokenSource;
use hublink::config::ClientConfig;
use hublink::observability::{init_default_logging, init_logging, LogFormat};
use hublink::session::{
    ConnectionGuardian, ConnectionStatus, ConnectionStatusInfo, ConnectionStatusSink,
    GuardianOptions,
};
use hublink::transport::mqtt::{InboundReceivers, MqttTransport};
use hublink::transport::{Message, MethodResponse};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

/// Resilient IoT hub device client
#[derive(Parser)]
#[command(name = "hublink")]
#[command(about = "Keeps a device connected to its IoT hub")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

/// Logs every connection status transition
struct LoggingStatusSink;

impl ConnectionStatusSink for LoggingStatusSink {
    fn on_connection_status_changed(&self, info: ConnectionStatusInfo) {
        match info.status {
            ConnectionStatus::Connected => info!(status = %info, "Connection status changed"),
            ConnectionStatus::DisconnectedRetrying => {
                warn!(status = %info, "Connection status changed")
            }
            ConnectionStatus::Disconnected => error!(status = %info, "Connection status changed"),
            ConnectionStatus::Closed => info!(status = %info, "Connection status changed"),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Pretty, false),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    info!("Starting hublink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for candidate in ["hublink.toml", "config/hublink.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create hublink.toml".into())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!(device_id = %config.device.id, "Configuration is valid");
    Ok(())
}

async fn run_device(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(device_id = %config.device.id, hub = %config.device.hub_hostname, "Device starting");

    let credentials = Arc::new(EnvTokenSource::new(
        config.device.sas_token_env.clone(),
        config.renew_before(),
    ));
    let (transport, inbound) = MqttTransport::from_config(&config, credentials.clone())?;
    let guardian = Arc::new(ConnectionGuardian::new(
        Arc::new(transport),
        GuardianOptions {
            policy: config.retry.build_policy(),
            credentials: Some(credentials),
            status_sink: Some(Arc::new(LoggingStatusSink)),
        },
    ));

    let running = CancellationToken::new();
    guardian.open(&running).await?;

    if config.features.methods {
        guardian.enable_methods(&running).await?;
    }
    if config.features.twin_patch {
        guardian.enable_twin_patch(&running).await?;
    }
    if config.features.receive_messages {
        guardian.enable_receive_message(&running).await?;
    }

    let workers = spawn_workers(&guardian, inbound, &config, &running);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device is running");
    let outcome = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            Ok(())
        }
        info = wait_for_permanent_disconnect(guardian.status_receiver()) => {
            error!(status = %info, "Connection permanently lost, shutting down");
            Err(format!("connection lost: {info}"))
        }
    };

    running.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task failed");
        }
    }

    guardian.dispose(&CancellationToken::new()).await?;
    outcome.map_err(Into::into)
}

fn spawn_workers(
    guardian: &Arc<ConnectionGuardian>,
    inbound: InboundReceivers,
    config: &ClientConfig,
    running: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let InboundReceivers {
        mut method_requests,
        mut desired_patches,
        mut messages,
    } = inbound;

    let methods = {
        let guardian = guardian.clone();
        let running = running.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = running.cancelled() => break,
                    request = method_requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                info!(method = %request.name, request_id = %request.request_id, "Direct method invoked");
                let response = MethodResponse::new(request.request_id, 200, request.payload);
                if let Err(e) = guardian.send_method_response(&response, &running).await {
                    warn!(error = %e, "Failed to answer direct method");
                }
            }
        })
    };

    let patches = {
        let guardian = guardian.clone();
        let running = running.clone();
        tokio::spawn(async move {
            loop {
                let patch = tokio::select! {
                    _ = running.cancelled() => break,
                    patch = desired_patches.recv() => match patch {
                        Some(patch) => patch,
                        None => break,
                    },
                };
                info!(version = ?patch.version, "Desired properties updated");
                match guardian
                    .update_reported_properties(&patch.patch, &running)
                    .await
                {
                    Ok(version) => debug!(reported_version = ?version, "Acknowledged desired properties"),
                    Err(e) => warn!(error = %e, "Failed to acknowledge desired properties"),
                }
            }
        })
    };

    let cloud_messages = {
        let guardian = guardian.clone();
        let running = running.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = running.cancelled() => break,
                    message = messages.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                info!(
                    message_id = %message.message_id,
                    bytes = message.body.len(),
                    "Cloud message received"
                );
                if let Some(lock_token) = &message.lock_token {
                    if let Err(e) = guardian.complete_message(lock_token, &running).await {
                        warn!(error = %e, "Failed to complete cloud message");
                    }
                }
            }
        })
    };

    let telemetry = {
        let guardian = guardian.clone();
        let running = running.clone();
        let period = config.telemetry_interval();
        let device_id = config.device.id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = running.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let health = guardian.health_metrics();
                let payload = json!({
                    "device_id": device_id,
                    "uptime_secs": health.uptime.map(|uptime| uptime.as_secs()),
                    "reconnect_count": health.reconnect_count,
                    "quality": health.quality,
                });
                let result = match Message::json(&payload) {
                    Ok(message) => guardian.send_event(&message, &running).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "Telemetry heartbeat not sent");
                }
            }
        })
    };

    vec![methods, patches, cloud_messages, telemetry]
}

/// Resolves with the first `Disconnected` status
async fn wait_for_permanent_disconnect(
    mut status: watch::Receiver<Option<ConnectionStatusInfo>>,
) -> ConnectionStatusInfo {
    loop {
        if let Some(info) = *status.borrow_and_update() {
            if info.status == ConnectionStatus::Disconnected {
                return info;
            }
        }
        if status.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
