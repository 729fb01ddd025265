mod command;
mod config;
mod connection;
mod heartbeat;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use command::{CommandExecutor, DispatchOutcome, Dispatcher, Platform, ResultRouter};
use config::{AgentConfig, DEFAULT_CONFIG_PATH};
use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use heartbeat::{HeartbeatTask, SystemSampler};
use remote_agent_shared::CheckMessage;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transport::TcpConnector;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Remote execution agent: runs commands from the hub and reports host health
#[derive(Debug, Parser)]
#[command(name = "remote-agent", version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "REMOTE_AGENT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Send one test message to the hub and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    debug!("Loaded configuration: {:?}", config);

    let result = if cli.check {
        run_check(&config).await
    } else {
        run_agent(config).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn connection_config(config: &AgentConfig) -> ConnectionConfig {
    ConnectionConfig {
        device_id: config.device_id.clone(),
        org_id: config.rewst_org_id.clone(),
        connect_timeout: config.connect_timeout,
        ..Default::default()
    }
}

/// One-shot connectivity test
async fn run_check(config: &AgentConfig) -> Result<()> {
    let connector = TcpConnector::new(&config.azure_iot_hub_host);
    info!("Checking connectivity to {}", connector.address());

    let conn = ConnectionManager::connect(connection_config(config), connector).await?;
    let payload = serde_json::to_vec(&CheckMessage::default())?;
    conn.send(payload.into())
        .await
        .context("Failed to queue test message")?;
    conn.disconnect().await?;

    info!("Test message sent");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!("Remote agent starting: {}", config.device_id);
    info!("  Hub: {}", config.azure_iot_hub_host);
    info!("  Engine: {}", config.rewst_engine_host);

    let connector = TcpConnector::new(&config.azure_iot_hub_host);
    let mut conn = ConnectionManager::connect(connection_config(&config), connector)
        .await
        .context("Initial connection to the hub failed")?;

    let platform = Platform::current();
    let executor = Arc::new(CommandExecutor::new(config.max_concurrent_commands));
    let router = Arc::new(ResultRouter::new(conn.sender(), config.callback_timeout)?);
    let dispatcher = Dispatcher::new(platform, config.rewst_engine_host.clone(), executor, router);
    info!(
        "Command dispatcher ready ({:?}, up to {} concurrent)",
        platform, config.max_concurrent_commands
    );

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = HeartbeatTask::new(SystemSampler::new(), conn.sender(), config.heartbeat_interval);
    let heartbeat_handle = tokio::spawn(heartbeat.run(heartbeat_cancel.clone()));

    // Main event loop
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected { transport }) => {
                    info!("Connected to hub via {}", transport);
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                }
                Some(ConnectionEvent::ConnectionFailed { reason }) => {
                    warn!("Reconnect failed: {}", reason);
                }
                Some(ConnectionEvent::Received(payload)) => {
                    if dispatcher.dispatch(&payload) == DispatchOutcome::Spawned {
                        debug!("{} command(s) in flight", dispatcher.in_flight());
                    }
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            }
        }
    }

    heartbeat_cancel.cancel();
    if let Err(e) = heartbeat_handle.await {
        error!("Heartbeat task failed: {}", e);
    }

    if !dispatcher.shutdown(config.shutdown_grace).await {
        warn!("Disconnecting with commands still running");
    }

    let device_id = conn.device_id().to_string();
    conn.disconnect().await?;
    info!("Remote agent stopped: {}", device_id);
    Ok(())
}
