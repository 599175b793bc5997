use std::io;

use thiserror::Error;

use crate::status::Status;

/// Reported by a server whose client never arrived
pub const SERVER_WAIT_TIMEOUT: &str = "Timed out waiting for client to connect";
/// Reported by `Client::connect` when the server never became reachable
pub const CLIENT_DIAL_TIMEOUT: &str = "Timed out trying to connect";
/// Delivered through `receive()` when a client cannot get its server back
pub const CLIENT_REDIAL_TIMEOUT: &str = "Timed out trying to re-connect";

/// Errors surfaced by endpoints
#[derive(Debug, Error)]
pub enum IpcError {
    /// The endpoint name cannot be turned into a local socket or pipe
    #[error("invalid endpoint name {name:?}: {reason}")]
    InvalidName {
        name:   String,
        reason: &'static str,
    },

    /// `send` was called with the control message type
    #[error("message type 0 is reserved")]
    ReservedType,

    /// `send` was called with more data than the peer accepts
    #[error("message exceeds maximum message length ({len} > {max} bytes)")]
    MessageTooLarge { len: usize, max: usize },

    /// `send` was called while no connection is established
    #[error("cannot send while {0}")]
    NotConnected(Status),

    /// The endpoint shut down; no further events will arrive
    #[error("the receive channel has been closed")]
    ReceiveClosed,

    /// Establishment was abandoned because the endpoint was closed
    #[error("endpoint closed while establishing the connection")]
    Closed,

    /// Waiting for a connection took longer than the configured timeout
    #[error("{0}")]
    Timeout(&'static str),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Failures while negotiating a fresh connection
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer speaks protocol version {peer}, expected {local}")]
    VersionMismatch { local: u8, peer: u8 },

    /// Client requires encryption but the server offered a plaintext channel
    #[error("server tried to connect without encryption")]
    EncryptionRequired,

    /// The peer refused the handshake with the given reply code
    #[error("peer rejected the handshake: {}", reply_reason(.0))]
    Rejected(u8),

    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),

    #[error("key exchange produced a non-contributory shared secret")]
    WeakKey,

    #[error("server advertised an invalid maximum message size of {0} bytes")]
    InvalidMaxSize(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("handshake i/o failed: {0}")]
    Io(#[from] io::Error),
}

fn reply_reason(code: &u8) -> &'static str {
    match *code {
        1 => "client has a different version number",
        2 => "client is enforcing encryption",
        3 => "client could not parse the handshake",
        _ => "unknown reply code",
    }
}

/// Failures of the AEAD layer
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to derive the session key")]
    KeyDerivation,

    #[error("failed to seal message")]
    Seal,

    /// Authentication failed: the ciphertext was modified or sealed under a
    /// different key
    #[error("failed to open sealed message")]
    Open,

    #[error("sealed message is {0} bytes, shorter than nonce and tag")]
    Truncated(usize),
}

/// Failures while reading or writing one frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("transport failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("frame of {len} bytes exceeds the limit of {limit} bytes")]
    Oversized { len: usize, limit: usize },

    #[error("frame of {0} bytes is too short to hold a message type")]
    Truncated(usize),
}

impl FrameError {
    /// True when the stream ended cleanly between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
