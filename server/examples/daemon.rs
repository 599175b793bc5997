use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use localwire_common::{Event, IpcError, ServerConfig, Status};
use localwire_server::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENDPOINT: &str = "example-daemon";

/// Long-running server that survives client restarts and stops on Ctrl+C
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    println!("=== localwire Daemon Server Example ===");
    println!("This example demonstrates a long-running server with signal handling");

    let config = ServerConfig::from_env()
        .with_timeout(Duration::ZERO)
        .with_encryption(true);
    let server = Arc::new(Server::start(ENDPOINT, config).context("Failed to start server")?);

    // Closing the server wakes the receive loop below
    let handle = server.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        handle.close();
    })
    .context("Failed to set signal handler")?;

    println!("✓ Server started on endpoint '{}'", server.name());
    println!("Press Ctrl+C to stop the server gracefully");
    println!();

    let mut received = 0u64;
    loop {
        match server.receive() {
            Ok(Event::Message(message)) => {
                received += 1;
                info!(
                    "Message #{} of type {} ({} bytes)",
                    received,
                    message.msg_type,
                    message.data.len()
                );
                let reply = format!("ack {received}");
                if let Err(e) = server.send(message.msg_type, reply) {
                    warn!("Failed to acknowledge message: {}", e);
                }
            }
            Ok(Event::StatusChanged(Status::ReConnecting)) => {
                info!("Client went away, waiting for it to come back");
            }
            Ok(Event::StatusChanged(status)) => info!("Server status: {}", status),
            Ok(Event::Notice(notice)) => warn!("Notice: {}", notice),
            Err(IpcError::ReceiveClosed) => {
                info!("Server closed");
                break;
            }
            Err(e) => {
                error!("Server error: {}", e);
                break;
            }
        }
    }

    println!("✓ Server shutdown completed after {received} messages");
    Ok(())
}
