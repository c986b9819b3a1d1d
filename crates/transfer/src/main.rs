//! Socket Transfer server binary

use shadowcheck::Socks5Checker;
use std::sync::Arc;
use transfer::{Config, SocketTransfer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    match config.logging.format.as_deref() {
        Some("json") => common::logging::init_json(),
        _ => common::logging::init(),
    }

    tracing::info!("Socket Transfer starting");

    let checker = Arc::new(Socks5Checker::new(config.probe_timeout()));
    let mut server = SocketTransfer::with_checker(config.to_options(), checker).await?;
    let mut events = server.take_events().expect("fresh supervisor has events");

    let port = server.listen(None).await?;
    tracing::info!(port = port, "relay listening");

    loop {
        tokio::select! {
            Some(event) = events.recv() => match &event {
                transfer::TransferEvent::HealthCheckFailed { targets } => {
                    let ports: Vec<u16> = targets.iter().map(|t| t.id).collect();
                    tracing::warn!(event = event.name(), targets = ?ports, "targets pruned");
                }
                other => {
                    tracing::warn!(event = other.name(), detail = ?other, "event");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    server.stop().await;
    tracing::info!("Socket Transfer stopped");
    Ok(())
}
