//! WireGuard key material.
//!
//! Keys on the wire are base64-encoded 32-byte values. The registration
//! engine only ever handles public keys; the private key exists for the
//! local interface itself and is generated or derived here.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::StaticSecret;

/// Length of a decoded WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors produced when parsing key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("key decodes to {0} bytes, expected 32")]
    Length(usize),
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(s.trim())?;
    let len = bytes.len();
    <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| KeyError::Length(len))
}

/// A peer's public key, the primary identity of a peer record.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_key(s)?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

/// The local interface's private key.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    /// Generate a fresh X25519 private key.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_key(s)?))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

// Key material must never end up in logs.
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}
