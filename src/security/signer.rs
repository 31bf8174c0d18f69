//! Payload signing
//!
//! HMAC-SHA256 over the raw body, hex encoded. One trailing newline is ignored
//! so a body produced by a line-oriented JSON encoder signs the same as the
//! bare document.

use super::SecurityError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "HashSHA256";

#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(key: &str) -> Result<Self, SecurityError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Build a signer only when a non-empty key is configured
    pub fn from_key(key: Option<&str>) -> Result<Option<Self>, SecurityError> {
        match key {
            Some(key) if !key.is_empty() => Self::new(key).map(Some),
            _ => Ok(None),
        }
    }

    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(strip_newline(data));
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(strip_newline(data));
        mac.verify_slice(&expected).is_ok()
    }
}

fn strip_newline(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}
