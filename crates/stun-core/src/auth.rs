//! Credential key derivation (RFC 8489 section 9).
//!
//! The codec never holds keys; it only locates MESSAGE-INTEGRITY. Key
//! derivation lives here so the transaction/session layers and the TURN
//! client share one definition.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Key for the short-term credential mechanism: the password itself.
///
/// ICE connectivity checks use this with the exchanged `pwd`.
pub fn short_term_key(password: &str) -> Vec<u8> {
    password.as_bytes().to_vec()
}

/// Key for the long-term credential mechanism:
/// `MD5(username ":" realm ":" password)`.
///
/// TURN allocations use this after the 401 challenge supplies the realm.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Credentials as configured by the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Long-term key for a realm learned from a 401 challenge.
    pub fn long_term_key(&self, realm: &str) -> Vec<u8> {
        long_term_key(&self.username, realm, &self.password)
    }
}
