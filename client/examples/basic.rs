use std::time::Duration;

use anyhow::Result;
use localwire_client::{Client, ClientConfig, Event};
use tracing_subscriber::EnvFilter;

const ENDPOINT: &str = "example";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    println!("=== localwire Client Basic Example ===");
    println!("Run the echo server example first: cargo run -p localwire-server --example echo");

    let config = ClientConfig::from_env().with_timeout(Duration::from_secs(10));

    println!("\nConnecting to '{ENDPOINT}'...");
    let client = Client::connect(ENDPOINT, config)?;
    println!("✓ Connected, server accepts up to {} bytes", client.max_msg_size());

    for (msg_type, text) in [(1, "hello"), (2, "from"), (3, "localwire")] {
        println!("Sending type {msg_type}: {text}");
        client.send(msg_type, text)?;

        let reply = next_message(&client)?;
        println!("Echo type {}: {}", reply.msg_type, reply.text());
    }

    println!("\nDisconnecting...");
    client.close();

    println!("✓ All examples completed successfully!");
    Ok(())
}

fn next_message(client: &Client) -> Result<localwire_client::Message> {
    loop {
        match client.receive()? {
            Event::Message(message) => return Ok(message),
            Event::StatusChanged(status) => println!("  status: {status}"),
            Event::Notice(notice) => println!("  notice: {notice}"),
        }
    }
}
