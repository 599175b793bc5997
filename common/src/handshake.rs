//! Negotiation run on every fresh connection before any frame flows.
//!
//! ```text
//! Server                                     Client
//!   |---- [version, encryption flag] -------->|
//!   |<--- reply code -------------------------|
//!   |---- server public key (if encrypted) -->|
//!   |<--- client public key (if encrypted) ---|
//!   |---- len || max_msg_size (sealed) ------>|
//!   |<--- reply code -------------------------|
//! ```

use std::{
    io::{Read, Write},
    time::Duration,
};

use crate::{
    config::{MIN_MSG_SIZE, PROTOCOL_VERSION},
    crypto::{Encryption, KeyPair, PUBLIC_KEY_SIZE, SEAL_OVERHEAD},
    error::HandshakeError,
};

/// Read timeout applied to a connection while it negotiates
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const REPLY_OK: u8 = 0;
const REPLY_VERSION_MISMATCH: u8 = 1;
const REPLY_ENCRYPTION_REQUIRED: u8 = 2;
const REPLY_MALFORMED: u8 = 3;

const FLAG_PLAINTEXT: u8 = 0;
const FLAG_ENCRYPTED: u8 = 1;

/// Upper bound on the size advertisement frame
const MAX_SIZE_FRAME: usize = 4 + SEAL_OVERHEAD;

/// What a client learns from the server during the handshake
#[derive(Debug)]
pub struct Negotiated {
    /// Cipher for this connection, when the server offered encryption
    pub encryption:   Option<Encryption>,
    /// Largest payload the server accepts
    pub max_msg_size: usize,
}

/// Server half of the handshake.
///
/// Returns the encryption context when `encrypt` is set.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    encrypt: bool,
    max_msg_size: usize,
) -> Result<Option<Encryption>, HandshakeError> {
    let flag = if encrypt { FLAG_ENCRYPTED } else { FLAG_PLAINTEXT };
    stream.write_all(&[PROTOCOL_VERSION, flag])?;
    stream.flush()?;
    expect_ok(stream)?;

    let encryption = if encrypt {
        let keys = KeyPair::generate();
        let server_public = keys.public_bytes();
        stream.write_all(&server_public)?;
        stream.flush()?;

        let mut client_public = [0u8; PUBLIC_KEY_SIZE];
        stream.read_exact(&mut client_public)?;

        let shared = keys.agree(client_public).ok_or(HandshakeError::WeakKey)?;
        let encryption = Encryption::derive(&shared[..], &server_public, &client_public)?;
        tracing::debug!(
            "Negotiated {}/{} session, fingerprint {}",
            encryption.key_exchange(),
            encryption.algorithm(),
            encryption.fingerprint()
        );
        Some(encryption)
    } else {
        None
    };

    let advertised = u32::try_from(max_msg_size).unwrap_or(u32::MAX).to_be_bytes();
    let payload = match &encryption {
        Some(encryption) => encryption.seal(&advertised)?,
        None => advertised.to_vec(),
    };
    // The payload is at most 32 bytes
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&payload);
    stream.write_all(&frame)?;
    stream.flush()?;
    expect_ok(stream)?;

    Ok(encryption)
}

/// Client half of the handshake.
///
/// Fails with [`HandshakeError::EncryptionRequired`] when `encryption_required`
/// is set and the server offers a plaintext channel.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    encryption_required: bool,
) -> Result<Negotiated, HandshakeError> {
    let mut hello = [0u8; 2];
    stream.read_exact(&mut hello)?;

    let [version, flag] = hello;
    if version != PROTOCOL_VERSION {
        reply(stream, REPLY_VERSION_MISMATCH)?;
        return Err(HandshakeError::VersionMismatch {
            local: PROTOCOL_VERSION,
            peer:  version,
        });
    }

    let encrypted = match flag {
        FLAG_PLAINTEXT => false,
        FLAG_ENCRYPTED => true,
        _ => {
            reply(stream, REPLY_MALFORMED)?;
            return Err(HandshakeError::Malformed("unknown encryption flag"));
        }
    };

    if !encrypted && encryption_required {
        reply(stream, REPLY_ENCRYPTION_REQUIRED)?;
        return Err(HandshakeError::EncryptionRequired);
    }
    reply(stream, REPLY_OK)?;

    let encryption = if encrypted {
        let mut server_public = [0u8; PUBLIC_KEY_SIZE];
        stream.read_exact(&mut server_public)?;

        let keys = KeyPair::generate();
        let client_public = keys.public_bytes();
        stream.write_all(&client_public)?;
        stream.flush()?;

        let shared = keys.agree(server_public).ok_or(HandshakeError::WeakKey)?;
        let encryption = Encryption::derive(&shared[..], &server_public, &client_public)?;
        tracing::debug!(
            "Negotiated {}/{} session, fingerprint {}",
            encryption.key_exchange(),
            encryption.algorithm(),
            encryption.fingerprint()
        );
        Some(encryption)
    } else {
        None
    };

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_SIZE_FRAME {
        return Err(HandshakeError::Malformed("size advertisement too long"));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    if let Some(encryption) = &encryption {
        payload = encryption.open(&payload)?;
    }

    let advertised: [u8; 4] = payload
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Malformed("size advertisement must be 4 bytes"))?;
    let max_msg_size = u32::from_be_bytes(advertised);
    if (max_msg_size as usize) < MIN_MSG_SIZE {
        reply(stream, REPLY_MALFORMED)?;
        return Err(HandshakeError::InvalidMaxSize(max_msg_size));
    }
    reply(stream, REPLY_OK)?;

    Ok(Negotiated {
        encryption,
        max_msg_size: max_msg_size as usize,
    })
}

fn reply<S: Write>(stream: &mut S, code: u8) -> Result<(), HandshakeError> {
    stream.write_all(&[code])?;
    stream.flush()?;
    Ok(())
}

fn expect_ok<S: Read>(stream: &mut S) -> Result<(), HandshakeError> {
    let mut code = [0u8; 1];
    stream.read_exact(&mut code)?;
    match code[0] {
        REPLY_OK => Ok(()),
        other => Err(HandshakeError::Rejected(other)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::net::UnixStream, thread};

    use super::*;
    use crate::{codec, message::Message};

    fn run(
        encrypt: bool,
        encryption_required: bool,
    ) -> (
        Result<Option<Encryption>, HandshakeError>,
        Result<Negotiated, HandshakeError>,
    ) {
        let (mut server_end, mut client_end) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || server_handshake(&mut server_end, encrypt, 4096));
        let client = client_handshake(&mut client_end, encryption_required);
        (server.join().unwrap(), client)
    }

    #[test]
    fn plaintext_handshake_advertises_size() {
        let (server, client) = run(false, false);
        assert!(server.unwrap().is_none());

        let negotiated = client.unwrap();
        assert!(negotiated.encryption.is_none());
        assert_eq!(negotiated.max_msg_size, 4096);
    }

    #[test]
    fn encrypted_handshake_agrees_on_a_key() {
        let (server, client) = run(true, true);
        let server = server.unwrap().unwrap();
        let client = client.unwrap();
        let client_enc = client.encryption.unwrap();

        assert_eq!(server.fingerprint(), client_enc.fingerprint());
        assert_eq!(client.max_msg_size, 4096);

        let frame = codec::encode_frame(3, b"sealed", Some(&server)).unwrap();
        let decoded = codec::read_frame(
            &mut frame.as_slice(),
            Some(&client_enc),
            codec::inbound_limit(4096, true),
        )
        .unwrap();
        assert_eq!(decoded, codec::Frame::Message(Message::new(3, "sealed")));
    }

    #[test]
    fn client_requiring_encryption_refuses_plaintext_server() {
        let (server, client) = run(false, true);
        assert!(matches!(client, Err(HandshakeError::EncryptionRequired)));
        assert!(matches!(server, Err(HandshakeError::Rejected(2))));
    }

    #[test]
    fn version_mismatch_is_reported_on_both_sides() {
        let (mut server_end, mut client_end) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            server_end.write_all(&[PROTOCOL_VERSION + 1, FLAG_PLAINTEXT]).unwrap();
            expect_ok(&mut server_end)
        });

        let client = client_handshake(&mut client_end, false);
        assert!(matches!(
            client,
            Err(HandshakeError::VersionMismatch { peer, .. }) if peer == PROTOCOL_VERSION + 1
        ));
        assert!(matches!(server.join().unwrap(), Err(HandshakeError::Rejected(1))));
    }

    #[test]
    fn tiny_advertised_size_is_rejected() {
        let (mut server_end, mut client_end) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || server_handshake(&mut server_end, false, 16));

        let client = client_handshake(&mut client_end, false);
        assert!(matches!(client, Err(HandshakeError::InvalidMaxSize(16))));
        assert!(matches!(server.join().unwrap(), Err(HandshakeError::Rejected(3))));
    }

    #[test]
    fn peer_hanging_up_is_an_io_error() {
        let (server_end, mut client_end) = UnixStream::pair().unwrap();
        drop(server_end);
        assert!(matches!(
            client_handshake(&mut client_end, false),
            Err(HandshakeError::Io(_))
        ));
    }
}
