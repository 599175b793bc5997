//! localwire client endpoint
//!
//! A [`Client`] dials a named local endpoint served by a localwire server,
//! negotiates the protocol version, encryption and the maximum message size,
//! and then exchanges typed messages with it. A lost connection is redialed
//! in the background and reported through [`Client::receive`] as status
//! changes.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use localwire_client::{Client, ClientConfig, Event};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_timeout(Duration::from_secs(10))
//!     .with_encryption_required(true);
//!
//! let client = Client::connect("example", config)?;
//! client.send(1, "status")?;
//!
//! loop {
//!     match client.receive()? {
//!         Event::Message(message) => {
//!             println!("Server replied: {}", message.text());
//!             break;
//!         }
//!         Event::StatusChanged(status) => println!("Status: {status}"),
//!         Event::Notice(notice) => println!("Notice: {notice}"),
//!     }
//! }
//!
//! client.close();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from localwire-common for convenience
pub use localwire_common::{ClientConfig, Event, HandshakeError, IpcError, Message, Status};
