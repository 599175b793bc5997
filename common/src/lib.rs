//! localwire common library
//!
//! Protocol engine shared by the localwire server and client: a two-party,
//! message-oriented channel over Unix domain sockets or Windows named pipes.
//! It includes:
//!
//! - Endpoint configuration, lifecycle status and message types
//! - The handshake that negotiates protocol version, encryption and the
//!   maximum message size
//! - Length-prefixed framing, optionally sealed with AES-256-GCM under an
//!   X25519-derived key
//! - Platform-specific socket implementations behind the [`transport`] traits
//! - The endpoint core that runs one read and one write pipeline per
//!   connection
//!
//! # Features
//!
//! - **Cross-platform IPC**: Unified interface for Unix domain sockets and Windows named pipes
//! - **Optional encryption**: Fresh ephemeral keys for every connection
//! - **Automatic reconnection**: Connection loss is reported as a status
//!   change, never as a dead endpoint

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Configuration structures and protocol constants
pub mod config;

/// Length-prefixed frame encoding
pub mod codec;

/// Key agreement and authenticated encryption
pub mod crypto;

/// Shared endpoint state and connection attachment
pub mod endpoint;

/// Error types
pub mod error;

/// Connection negotiation
pub mod handshake;

/// Messages and events delivered to applications
pub mod message;

/// Queues and the read/write loops
pub mod pipeline;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Endpoint lifecycle status
pub mod status;

/// Transport abstraction
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{ClientConfig, ServerConfig};
pub use error::{HandshakeError, IpcError};
pub use message::{Event, Message};
pub use platform_socket::{PlatformListener, PlatformSocket, PlatformTransport};
pub use status::Status;
pub use transport::{Connection, Listener, Transport};

/// Locks `mutex`, recovering the data if a panicking thread poisoned it
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
