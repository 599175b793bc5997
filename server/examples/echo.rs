use anyhow::{Context, Result};
use localwire_common::{Event, ServerConfig};
use localwire_server::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENDPOINT: &str = "example";

/// Message type a client sends to stop the server
const SHUTDOWN_MSG_TYPE: u32 = 99;

/// Echo server example that sends every message back to the client
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    println!("=== localwire Echo Server Example ===");
    println!("This server will echo back any messages sent by clients");

    let config = ServerConfig::from_env();
    let server = Server::start(ENDPOINT, config).context("Failed to start echo server")?;

    println!("✓ Echo server started");
    println!("Endpoint name: {}", server.name());
    println!("Socket directory: {}", server.config().socket_base_path.display());
    println!("Encryption: {}", server.config().encryption);
    println!("Send message type {SHUTDOWN_MSG_TYPE} to stop the server");
    println!();

    loop {
        match server.receive() {
            Ok(Event::Message(message)) if message.msg_type == SHUTDOWN_MSG_TYPE => {
                info!("Received shutdown request");
                break;
            }
            Ok(Event::Message(message)) => {
                info!(
                    "Echoing message type {} ({} bytes): {}",
                    message.msg_type,
                    message.data.len(),
                    message.text()
                );
                if let Err(e) = server.send(message.msg_type, message.data) {
                    warn!("Failed to echo message: {}", e);
                }
            }
            Ok(Event::StatusChanged(status)) => info!("Server status: {}", status),
            Ok(Event::Notice(notice)) => warn!("Notice: {}", notice),
            Err(e) => {
                error!("Echo server error: {}", e);
                break;
            }
        }
    }

    server.close();
    println!("✓ Echo server shutdown completed");
    Ok(())
}
