//! WireGuard key pair handling
//!
//! A private key is a clamped 32-byte Curve25519 scalar, persisted as a
//! base64 text file with mode `0400`. The matching public key is derived
//! deterministically. Keys are created once when missing and never rotated
//! by this agent.

mod store;

pub use store::KeyStore;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::StaticSecret;

/// Length of a raw WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors from key parsing, generation and persistence
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key file could not be read
    #[error("unable to read private key from '{path}': {source}")]
    Read {
        /// Path of the key file
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The key file could not be written
    #[error("unable to write private key to '{path}': {source}")]
    Write {
        /// Path of the key file
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Key material was not valid base64
    #[error("invalid base64 key material: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// Decoded key material had the wrong length
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// A WireGuard private key.
///
/// `Debug` never prints key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    /// Generate a new random private key, clamped for Curve25519.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);

        // Clamp for Curve25519 (this is what WireGuard expects)
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;

        Self(bytes)
    }

    /// Parse a private key from its base64 form.
    ///
    /// Surrounding whitespace (a trailing newline in the key file) is
    /// tolerated.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_key(s)?))
    }

    /// Encode the key as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// A WireGuard public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Parse a public key from its base64 form.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self(decode_key(s)?))
    }

    /// Encode the key as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
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

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(s.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidLength(len))
}

/// Load a private key from `path`.
///
/// Returns `Ok(None)` when the file does not exist; any other read or
/// parse failure is an error.
pub fn load(path: &Path) -> Result<Option<PrivateKey>, KeyError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(KeyError::Read {
                path: path.to_owned(),
                source,
            })
        }
    };

    PrivateKey::from_base64(&content).map(Some)
}

/// Write a freshly generated private key to `path` with mode `0400`.
///
/// The file must not exist yet; keys are never overwritten.
pub fn persist(path: &Path, key: &PrivateKey) -> Result<(), KeyError> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;

    let write_err = |source| KeyError::Write {
        path: path.to_owned(),
        source,
    };

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)
        .map_err(write_err)?;
    file.write_all(key.to_base64().as_bytes()).map_err(write_err)?;

    Ok(())
}
