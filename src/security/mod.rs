//! Security Module
//!
//! Transport-agnostic request protection shared by the HTTP API and the RPC
//! listener. Checks run in a fixed order: trusted subnet, payload decryption,
//! signature verification, then gzip decompression.

pub mod cipher;
pub mod compression;
pub mod signer;
pub mod subnet;

pub use cipher::{Decryptor, Encryptor};
pub use signer::{Signer, SIGNATURE_HEADER};
pub use subnet::{TrustedSubnet, REAL_IP_HEADER};

use ipnet::IpNet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// How a failed check should be reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Forbidden,
    BadRequest,
    Internal,
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("X-Real-IP header is missing")]
    MissingRealIp,

    #[error("invalid client address {0:?}")]
    InvalidRealIp(String),

    #[error("client address {0} is outside the trusted subnet")]
    UntrustedIp(IpAddr),

    #[error("invalid trusted subnet {cidr:?}: {reason}")]
    InvalidSubnet { cidr: String, reason: String },

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("payload decryption failed: {0}")]
    Decrypt(String),

    #[error("payload encryption failed: {0}")]
    Encrypt(String),

    #[error("gzip: {0}")]
    Compression(#[from] std::io::Error),
}

impl SecurityError {
    pub fn rejection(&self) -> Rejection {
        match self {
            Self::MissingRealIp | Self::UntrustedIp(_) => Rejection::Forbidden,
            Self::InvalidRealIp(_)
            | Self::SignatureMismatch
            | Self::Decrypt(_)
            | Self::Compression(_) => Rejection::BadRequest,
            Self::InvalidSubnet { .. } | Self::InvalidKey(_) | Self::Encrypt(_) => {
                Rejection::Internal
            }
        }
    }
}

/// Request as seen at the transport boundary
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub real_ip: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub content_encoding: Option<&'a str>,
    pub body: &'a [u8],
}

/// Body after every check passed
#[derive(Debug)]
pub struct OpenedRequest {
    pub body: Vec<u8>,
    /// The request carried a signature that verified
    pub signed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityChain {
    subnet: Option<TrustedSubnet>,
    decryptor: Option<Arc<Decryptor>>,
    signer: Option<Signer>,
}

impl SecurityChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the chain from configured material; absent entries disable a step
    pub fn from_settings(
        trusted_subnet: Option<IpNet>,
        private_key: Option<&Path>,
        hash_key: Option<&str>,
    ) -> Result<Self, SecurityError> {
        let mut chain = Self::new();
        if let Some(net) = trusted_subnet {
            chain = chain.with_subnet(TrustedSubnet::new(net));
        }
        if let Some(path) = private_key {
            chain = chain.with_decryptor(Decryptor::from_file(path)?);
        }
        if let Some(signer) = Signer::from_key(hash_key)? {
            chain = chain.with_signer(signer);
        }
        Ok(chain)
    }

    pub fn with_subnet(mut self, subnet: TrustedSubnet) -> Self {
        self.subnet = Some(subnet);
        self
    }

    pub fn with_decryptor(mut self, decryptor: Decryptor) -> Self {
        self.decryptor = Some(Arc::new(decryptor));
        self
    }

    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn signer(&self) -> Option<&Signer> {
        self.signer.as_ref()
    }

    pub fn check_ip(&self, real_ip: Option<&str>) -> Result<(), SecurityError> {
        match &self.subnet {
            Some(subnet) => subnet.check(real_ip).map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, SecurityError> {
        match &self.decryptor {
            Some(decryptor) => decryptor.decrypt(body),
            None => Ok(body.to_vec()),
        }
    }

    /// Verify when both a key and a signature are present; returns whether it did
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<bool, SecurityError> {
        let (Some(signer), Some(signature)) = (&self.signer, signature) else {
            return Ok(false);
        };

        if signer.verify(body, signature) {
            Ok(true)
        } else {
            Err(SecurityError::SignatureMismatch)
        }
    }

    pub fn decompress(
        &self,
        content_encoding: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, SecurityError> {
        if compression::is_gzip(content_encoding) {
            Ok(compression::gunzip(&body)?)
        } else {
            Ok(body)
        }
    }

    /// Run every step in order
    pub fn open(&self, request: RawRequest<'_>) -> Result<OpenedRequest, SecurityError> {
        self.check_ip(request.real_ip)?;
        let body = self.decrypt(request.body)?;
        let signed = self.verify(request.signature, &body)?;
        let body = self.decompress(request.content_encoding, body)?;

        debug!(bytes = body.len(), signed, "request passed security checks");
        Ok(OpenedRequest { body, signed })
    }

    /// Signature for an outgoing body when a key is configured
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        self.signer.as_ref().map(|signer| signer.sign(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = SecurityChain::new();
        let opened = chain
            .open(RawRequest {
                real_ip: None,
                signature: Some("ignored"),
                content_encoding: None,
                body: b"{}",
            })
            .unwrap();

        assert_eq!(opened.body, b"{}");
        assert!(!opened.signed);
        assert!(chain.sign(b"{}").is_none());
    }

    #[test]
    fn test_full_chain() {
        let decryptor = Decryptor::new(RsaPrivateKey::new(&mut OsRng, 1024).unwrap());
        let encryptor = decryptor.encryptor();
        let signer = Signer::new("key").unwrap();

        let chain = SecurityChain::new()
            .with_subnet(TrustedSubnet::parse("10.0.0.0/8").unwrap())
            .with_decryptor(decryptor)
            .with_signer(signer.clone());

        let packed = compression::gzip(br#"{"id":"a","type":"gauge","value":1}"#).unwrap();
        let signature = signer.sign(&packed);
        let sealed = encryptor.encrypt(&packed).unwrap();

        let opened = chain
            .open(RawRequest {
                real_ip: Some("10.1.2.3"),
                signature: Some(&signature),
                content_encoding: Some("gzip"),
                body: &sealed,
            })
            .unwrap();
        assert!(opened.signed);
        assert_eq!(opened.body, br#"{"id":"a","type":"gauge","value":1}"#);

        let err = chain
            .open(RawRequest {
                real_ip: Some("10.1.2.3"),
                signature: Some(&signer.sign(b"other")),
                content_encoding: Some("gzip"),
                body: &sealed,
            })
            .unwrap_err();
        assert_eq!(err.rejection(), Rejection::BadRequest);

        let err = chain
            .open(RawRequest {
                real_ip: Some("172.16.0.1"),
                signature: Some(&signature),
                content_encoding: Some("gzip"),
                body: &sealed,
            })
            .unwrap_err();
        assert_eq!(err.rejection(), Rejection::Forbidden);
    }

    #[test]
    fn test_unsigned_request_accepted_with_key() {
        let chain = SecurityChain::new().with_signer(Signer::new("key").unwrap());
        let opened = chain
            .open(RawRequest {
                real_ip: None,
                signature: None,
                content_encoding: None,
                body: b"[]",
            })
            .unwrap();
        assert!(!opened.signed);
    }
}
