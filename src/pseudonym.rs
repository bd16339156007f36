//! Pseudonymous participant identifiers.
//!
//! Signals, sessions and updates only ever carry a [`Pseudonym`]; raw user
//! identities are reduced with a keyed hash before they enter this crate.

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the HMAC digest kept in a derived pseudonym.
const PSEUDONYM_BYTES: usize = 16;

/// Opaque per-participant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

impl Pseudonym {
    /// Wrap a value that is already opaque (e.g. issued by the front end).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive a stable pseudonym from a user id with a server-side secret.
    ///
    /// The same `(user_id, secret)` pair always yields the same pseudonym;
    /// without the secret the mapping cannot be reversed or recomputed.
    pub fn derive(user_id: &str, secret: &[u8]) -> Self {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = match HmacSha256::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        };
        mac.update(user_id.as_bytes());
        let digest = mac.finalize().into_bytes();
        Self(format!("p-{}", hex::encode(&digest[..PSEUDONYM_BYTES])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pseudonym {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
