//! HTTP JSON transport

use super::{outbound_ip, Payload, Transport, TransportError};
use crate::metric::Metric;
use crate::security::compression::GZIP_ENCODING;
use crate::security::{REAL_IP_HEADER, SIGNATURE_HEADER};
use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::error::Error as _;
use std::net::IpAddr;
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    local_ip: Option<IpAddr>,
}

impl HttpTransport {
    pub fn new(address: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("http://{}/update/", address),
            local_ip: outbound_ip(address),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// A refused TCP connect shows up as an `io::Error` somewhere in the source chain
fn classify(err: reqwest::Error) -> TransportError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return TransportError::ConnectionRefused(err.to_string());
            }
        }
        source = cause.source();
    }

    if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &Payload) -> Result<Metric, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, GZIP_ENCODING)
            .body(payload.body.clone());

        if let Some(ip) = self.local_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }
        if let Some(signature) = &payload.signature {
            request = request.header(SIGNATURE_HEADER, signature.as_str());
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;

        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
