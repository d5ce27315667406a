//! Credential keypairs.
//!
//! Provisioning helper for hosts: generates the X25519 keypair whose
//! base64 forms become the session's private/public credentials. The session
//! core itself treats credentials as opaque strings; nothing here is used on
//! the packet path.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::params::Credential;

/// Errors decoding a key from its base64 form.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("invalid key length (expected 32 bytes)")]
    InvalidLength,
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Local private key (Curve25519).
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Decode from base64.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            secret: StaticSecret::from(decode_key(s)?),
        })
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// This key as an opaque session credential.
    pub fn credential(&self) -> Credential {
        Credential::new(self.to_base64())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Remote or derived public key (Curve25519).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Decode from base64.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            key: X25519Public::from(decode_key(s)?),
        })
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key.to_bytes())
    }

    /// This key as an opaque session credential.
    pub fn credential(&self) -> Credential {
        Credential::new(self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A private key and its matching public key.
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random pair.
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_round_trip_base64() {
        let pair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&pair.private.to_base64()).unwrap();
        assert_eq!(
            restored.public_key().to_base64(),
            pair.public.to_base64()
        );
    }

    #[test]
    fn test_public_key_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(
            private.public_key().to_base64(),
            private.public_key().to_base64()
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            PublicKey::from_base64("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        ));
        assert!(matches!(
            PublicKey::from_base64(&BASE64.encode([0u8; 16])),
            Err(KeyError::InvalidLength)
        ));
    }

    #[test]
    fn test_credentials_are_nonempty() {
        let pair = KeyPair::generate();
        assert!(!pair.private.credential().is_empty());
        assert!(!pair.public.credential().is_empty());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let private = PrivateKey::generate();
        let rendered = format!("{private:?}");
        assert!(!rendered.contains(&private.to_base64()));
    }
}
