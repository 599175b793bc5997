//! Encryption context negotiated during the handshake.
//!
//! Both ends run an ephemeral X25519 exchange, feed the shared secret through
//! HKDF-SHA256 (salted with both public keys) and key a single AES-256-GCM
//! cipher used for both directions. Every sealed unit carries its own random
//! 96-bit nonce:
//!
//! ```text
//! sealed := nonce(12) || ciphertext || tag(16)
//! ```

use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Nonce size for AES-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;
/// Tag size for AES-GCM authentication
pub const TAG_SIZE: usize = 16;
/// Bytes added to every sealed unit
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
/// Key size for AES-256
pub const KEY_SIZE: usize = 32;
/// Size of an X25519 public key on the wire
pub const PUBLIC_KEY_SIZE: usize = 32;

pub const KEY_EXCHANGE: &str = "x25519";
pub const ALGORITHM: &str = "aes-256-gcm";

const KDF_INFO: &[u8] = b"localwire v2 session key";

/// Ephemeral half of a key exchange
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Completes the exchange, returning the raw shared secret.
    ///
    /// `None` when the peer sent a low-order point, which would make the
    /// secret predictable.
    pub fn agree(self, peer: [u8; PUBLIC_KEY_SIZE]) -> Option<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        shared
            .was_contributory()
            .then(|| Zeroizing::new(shared.to_bytes()))
    }
}

/// Symmetric state shared by both ends of one connection epoch
pub struct Encryption {
    key_exchange: &'static str,
    algorithm:    &'static str,
    fingerprint:  String,
    cipher:       Aes256Gcm,
}

impl Encryption {
    /// Derives the session cipher from a completed exchange
    pub fn derive(
        shared: &[u8],
        server_public: &[u8; PUBLIC_KEY_SIZE],
        client_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; 2 * PUBLIC_KEY_SIZE];
        salt[..PUBLIC_KEY_SIZE].copy_from_slice(server_public);
        salt[PUBLIC_KEY_SIZE..].copy_from_slice(client_public);

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Hkdf::<Sha256>::new(Some(&salt), shared)
            .expand(KDF_INFO, &mut key[..])
            .map_err(|_| CryptoError::KeyDerivation)?;

        let transcript = Sha256::digest(salt);
        Ok(Self {
            key_exchange: KEY_EXCHANGE,
            algorithm:    ALGORITHM,
            fingerprint:  hex::encode(&transcript[..8]),
            cipher:       Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..])),
        })
    }

    pub fn key_exchange(&self) -> &'static str {
        self.key_exchange
    }

    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    /// Short hex digest of both public keys; identical on both ends
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypts `plaintext` as one authenticated unit
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Authenticates and decrypts a unit produced by [`Encryption::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

impl fmt::Debug for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryption")
            .field("key_exchange", &self.key_exchange)
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
