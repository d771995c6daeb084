//! Authentication
//!
//! `AUTH` carries base64 of `username\0password`. Existing clients encode
//! the separator as the literal two characters backslash-zero; a real NUL
//! byte is accepted as well. `NAUTH` carries the lowercase hex SHA-256 of
//! the shared key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Gateway username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Encode as an AUTH token the way deployed clients do, with the
    /// literal `\0` separator.
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}\\0{}", self.username, self.password))
    }

    /// Verify an AUTH token, accepting both the literal `\0` sequence and
    /// a real NUL byte as separator.
    pub fn verify(&self, token: &str) -> bool {
        let decoded = match BASE64.decode(token) {
            Ok(decoded) => decoded,
            Err(_) => return false,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(decoded) => decoded,
            Err(_) => return false,
        };
        let pair = decoded
            .split_once("\\0")
            .or_else(|| decoded.split_once('\0'));
        match pair {
            Some((username, password)) => {
                constant_eq(username.as_bytes(), self.username.as_bytes())
                    & constant_eq(password.as_bytes(), self.password.as_bytes())
            }
            None => false,
        }
    }
}

/// Shared key used between instances (gateway to primaries/replicas and
/// primaries to their replicas).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedKey {
    key: String,
}

impl SharedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The NAUTH token: lowercase hex SHA-256 of the key.
    pub fn token(&self) -> String {
        let digest = Sha256::digest(self.key.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Verify a presented NAUTH token.
    pub fn verify(&self, token: &str) -> bool {
        constant_eq(token.as_bytes(), self.token().as_bytes())
    }
}

/// Length-then-bytes comparison without early exit on content.
fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
