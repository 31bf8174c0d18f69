//! Agent-to-collector transports
//!
//! Both wires carry the same prepared payload and hand back the value the
//! collector stored.

pub mod http;
pub mod rpc;

pub use self::http::HttpTransport;
pub use self::rpc::RpcTransport;

use crate::metric::Metric;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use thiserror::Error;

/// One record ready for the wire: gzip JSON, optionally encrypted
#[derive(Debug, Clone)]
pub struct Payload {
    pub id: String,
    pub body: Bytes,
    /// Signature over the compressed bytes
    pub signature: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("collector answered {code}: {message}")]
    Status { code: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Only a refused connection is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::ConnectionRefused(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<Metric, TransportError>;

    fn name(&self) -> &'static str;
}

/// Local address the OS would use to reach `address`
///
/// Connecting a UDP socket only selects a route, nothing is sent.
pub fn outbound_ip(address: &str) -> Option<IpAddr> {
    let target = address.to_socket_addrs().ok()?.next()?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_refused_is_retryable() {
        assert!(TransportError::ConnectionRefused("x".into()).is_retryable());
        assert!(!TransportError::Status {
            code: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Protocol("x".into()).is_retryable());
        assert!(!TransportError::Other("x".into()).is_retryable());
    }

    #[test]
    fn test_outbound_ip_loopback() {
        assert_eq!(
            outbound_ip("127.0.0.1:8080"),
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(outbound_ip("not an address"), None);
    }
}
