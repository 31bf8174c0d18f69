//! Binary RPC framing
//!
//! Each message is a 4-byte big-endian length followed by a bincode encoded
//! [`RpcRequest`] or [`RpcResponse`]. Request bodies carry exactly what an
//! HTTP request body would, so both transports share one security chain.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub const META_REAL_IP: &str = "x-real-ip";
pub const META_SIGNATURE: &str = "hashsha256";
pub const META_CONTENT_ENCODING: &str = "content-encoding";

pub type Metadata = BTreeMap<String, String>;
pub type RpcFramed<T> = Framed<T, LengthDelimitedCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Update,
    UpdateBatch,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Ok,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: Method,
    pub metadata: Metadata,
    pub body: Vec<u8>,
}

impl RpcRequest {
    pub fn new(method: Method, body: Vec<u8>) -> Self {
        Self {
            method,
            metadata: Metadata::new(),
            body,
        }
    }

    /// Keys are stored lowercase
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: Code,
    pub metadata: Metadata,
    pub body: Vec<u8>,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            code: Code::Ok,
            metadata: Metadata::new(),
            body,
            message: String::new(),
        }
    }

    pub fn error(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            metadata: Metadata::new(),
            body: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("connection closed by peer")]
    Closed,
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> RpcFramed<T> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(io)
}

pub async fn send<T, M>(framed: &mut RpcFramed<T>, message: &M) -> Result<(), RpcError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let encoded = bincode::serialize(message)?;
    framed.send(Bytes::from(encoded)).await?;
    Ok(())
}

/// Next message, `None` on a clean end of stream
pub async fn recv<T, M>(framed: &mut RpcFramed<T>) -> Result<Option<M>, RpcError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match framed.next().await {
        Some(frame) => Ok(Some(bincode::deserialize(&frame?)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = framed(client);
        let mut server = framed(server);

        let request = RpcRequest::new(Method::Update, b"payload".to_vec())
            .with_metadata("X-Real-IP", "127.0.0.1");
        send(&mut client, &request).await.unwrap();
        send(&mut client, &RpcRequest::new(Method::Value, Vec::new()))
            .await
            .unwrap();

        let first: RpcRequest = recv(&mut server).await.unwrap().unwrap();
        assert_eq!(first, request);
        assert_eq!(first.metadata(META_REAL_IP), Some("127.0.0.1"));

        let second: RpcRequest = recv(&mut server).await.unwrap().unwrap();
        assert_eq!(second.method, Method::Value);

        drop(client);
        assert!(recv::<_, RpcRequest>(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_an_error() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = framed(client);
        let mut server = framed(server);

        client.send(Bytes::from_static(&[0xff; 3])).await.unwrap();
        assert!(matches!(
            recv::<_, RpcResponse>(&mut server).await,
            Err(RpcError::Encoding(_))
        ));
    }
}
