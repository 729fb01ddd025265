mod console;
mod session;

use console::ConsoleCommand;
use session::{AgentSession, SessionManager};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&bind).await?;
    info!("Hub listening on {}", bind);
    info!("Console: '<device_id> <command>', '* <command>' or 'list'");

    let sessions = SessionManager::new();
    tokio::spawn(run_console(sessions.clone()));

    loop {
        let (socket, addr) = listener.accept().await?;
        info!("Connection from: {}", addr);
        tokio::spawn(handle_agent(socket, addr, sessions.clone()));
    }
}

async fn handle_agent(socket: TcpStream, addr: SocketAddr, sessions: SessionManager) {
    let mut session = match AgentSession::accept(socket, addr).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejected {}: {:#}", addr, e);
            return;
        }
    };

    let device_id = session.device_id().to_string();
    let handle = session.handle();
    info!("Agent registered: {} (org={}, {})", device_id, handle.org_id, addr);
    sessions.register(handle).await;

    while let Some(frame) = session.recv().await {
        match serde_json::from_slice::<serde_json::Value>(&frame) {
            Ok(value) => info!("[{}] {}", device_id, value),
            Err(e) => warn!("[{}] Non-JSON frame ({} bytes): {}", device_id, frame.len(), e),
        }
    }

    sessions.unregister(&device_id, addr).await;
    info!(
        "Agent disconnected: {} ({} connected)",
        device_id,
        sessions.count().await
    );
}

async fn run_console(sessions: SessionManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Console read error: {}", e);
                break;
            }
        };

        match console::parse_line(&line) {
            Some(ConsoleCommand::Send { device_id, body }) => {
                match sessions.send_to(&device_id, &body).await {
                    Ok(()) => info!("Sent to {}", device_id),
                    Err(e) => warn!("{}", e),
                }
            }
            Some(ConsoleCommand::Broadcast { body }) => {
                let delivered = sessions.broadcast(&body).await;
                info!("Broadcast to {} agent(s)", delivered);
            }
            Some(ConsoleCommand::List) => {
                for device_id in sessions.connected_devices().await {
                    if let Some(handle) = sessions.get(&device_id).await {
                        info!(
                            "  {} {} idle {:?}, up {:?}",
                            device_id,
                            handle.addr,
                            handle.idle_for().await,
                            handle.connected_at.elapsed()
                        );
                    }
                }
            }
            None if line.trim().is_empty() => {}
            None => warn!("Unrecognized input: {}", line.trim()),
        }
    }

    info!("Console closed");
}
