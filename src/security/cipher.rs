//! Asymmetric payload encryption
//!
//! RSA PKCS#1 v1.5 with PKCS#1 PEM keys. A payload longer than one block is
//! split into `k - 11` byte chunks, each sealed into a `k` byte block, where
//! `k` is the modulus size in bytes.

use super::SecurityError;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::Path;

const PKCS1_PADDING: usize = 11;

/// Agent side: seals payloads with the collector's public key
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
}

impl Encryptor {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    pub fn from_pem(pem: &str) -> Result<Self, SecurityError> {
        RsaPublicKey::from_pkcs1_pem(pem)
            .map(Self::new)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, SecurityError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(&pem)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let block = self.key.size();
        let chunk = block - PKCS1_PADDING;
        let mut sealed = Vec::with_capacity(plaintext.len().div_ceil(chunk) * block);

        for part in plaintext.chunks(chunk) {
            let encrypted = self
                .key
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, part)
                .map_err(|e| SecurityError::Encrypt(e.to_string()))?;
            sealed.extend_from_slice(&encrypted);
        }

        Ok(sealed)
    }
}

/// Collector side: opens payloads with the private key
#[derive(Debug, Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    pub fn from_pem(pem: &str) -> Result<Self, SecurityError> {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map(Self::new)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, SecurityError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        Self::from_pem(&pem)
    }

    /// Matching encryptor, mostly useful for tests and tooling
    pub fn encryptor(&self) -> Encryptor {
        Encryptor::new(RsaPublicKey::from(&self.key))
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let block = self.key.size();
        if sealed.len() % block != 0 {
            return Err(SecurityError::Decrypt(format!(
                "payload length {} is not a multiple of the {} byte block",
                sealed.len(),
                block
            )));
        }

        let mut plaintext = Vec::with_capacity(sealed.len());
        for part in sealed.chunks(block) {
            let opened = self
                .key
                .decrypt(Pkcs1v15Encrypt, part)
                .map_err(|e| SecurityError::Decrypt(e.to_string()))?;
            plaintext.extend_from_slice(&opened);
        }

        Ok(plaintext)
    }
}
