//! Seam between the protocol engine and the OS-level local transport.
//!
//! The engine only needs a listener that hands out one byte stream per
//! client and a dialer that opens one, both addressed by an endpoint name.
//! [`crate::platform_socket::PlatformTransport`] provides Unix domain sockets
//! and Windows named pipes; tests wrap it to tap or sever streams.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use crate::config::{ClientConfig, ServerConfig};

/// A connected, blocking byte stream
pub trait Connection: Read + Write + Send + Sized + 'static {
    /// Another handle onto the same stream, used to read and write from
    /// separate threads
    fn try_clone(&self) -> io::Result<Self>;

    /// Closes both directions; blocked reads on any clone return promptly
    fn shutdown(&self) -> io::Result<()>;

    /// Bounds blocking reads; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Source of incoming connections for a server
pub trait Listener: Send + Sync + 'static {
    type Conn: Connection;

    /// Blocks until a client connects or the listener is closed
    fn accept(&self) -> io::Result<Self::Conn>;

    /// Stops accepting and releases the endpoint name. Idempotent.
    fn close(&self) -> io::Result<()>;
}

/// Factory for listeners and outgoing connections
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;
    type Listener: Listener<Conn = Self::Conn>;

    /// Binds `name`, replacing any stale endpoint of the same name
    fn listen(&self, name: &str, config: &ServerConfig) -> io::Result<Self::Listener>;

    /// Opens a connection to the server listening on `name`
    fn dial(&self, name: &str, config: &ClientConfig) -> io::Result<Self::Conn>;
}

/// Dial errors that only mean the server is not up yet
pub fn is_retryable_dial_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) {
        return true;
    }

    // ERROR_PIPE_BUSY: the server's single pipe instance is still taken
    #[cfg(windows)]
    if err.raw_os_error() == Some(231) {
        return true;
    }

    false
}
