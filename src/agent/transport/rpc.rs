//! Binary RPC transport
//!
//! Idle connections are kept for reuse. A reused connection the collector has
//! since closed is dropped and the call is made once more on a fresh one.

use super::{outbound_ip, Payload, Transport, TransportError};
use crate::metric::Metric;
use crate::rpc::{
    self, Code, Method, RpcError, RpcFramed, RpcRequest, RpcResponse, META_CONTENT_ENCODING,
    META_REAL_IP, META_SIGNATURE,
};
use crate::security::compression::GZIP_ENCODING;
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

const MAX_IDLE: usize = 16;

pub struct RpcTransport {
    address: String,
    local_ip: Option<IpAddr>,
    idle: Mutex<Vec<RpcFramed<TcpStream>>>,
}

impl RpcTransport {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            local_ip: outbound_ip(address),
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn connect(&self) -> Result<RpcFramed<TcpStream>, TransportError> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportError::ConnectionRefused(format!("{}: {}", self.address, e))
            } else {
                TransportError::Other(format!("{}: {}", self.address, e))
            }
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!(address = %self.address, "RPC connection established");
        Ok(rpc::framed(stream))
    }

    /// One request/response exchange on a freshly dialed connection
    async fn call_fresh(
        &self,
        request: &RpcRequest,
    ) -> Result<(RpcFramed<TcpStream>, RpcResponse), TransportError> {
        let mut conn = self.connect().await?;
        let response = call(&mut conn, request).await.map_err(rpc_error)?;
        Ok((conn, response))
    }

    async fn release(&self, conn: RpcFramed<TcpStream>) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }

    fn request(&self, payload: &Payload) -> RpcRequest {
        let mut request = RpcRequest::new(Method::Update, payload.body.to_vec())
            .with_metadata(META_CONTENT_ENCODING, GZIP_ENCODING);
        if let Some(ip) = self.local_ip {
            request = request.with_metadata(META_REAL_IP, ip.to_string());
        }
        if let Some(signature) = &payload.signature {
            request = request.with_metadata(META_SIGNATURE, signature.clone());
        }
        request
    }
}

async fn call(conn: &mut RpcFramed<TcpStream>, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
    rpc::send(conn, request).await?;
    rpc::recv(conn).await?.ok_or(RpcError::Closed)
}

fn rpc_error(err: RpcError) -> TransportError {
    match err {
        RpcError::Encoding(e) => TransportError::Protocol(e.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

/// HTTP-equivalent status for a failed call
fn status_code(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::InvalidArgument => 400,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::Internal => 500,
    }
}

#[async_trait]
impl Transport for RpcTransport {
    async fn send(&self, payload: &Payload) -> Result<Metric, TransportError> {
        let request = self.request(payload);
        let idle = self.idle.lock().await.pop();

        let (conn, response) = match idle {
            Some(mut conn) => match call(&mut conn, &request).await {
                Ok(response) => (conn, response),
                // The collector closed its end while the connection sat idle
                Err(e @ (RpcError::Io(_) | RpcError::Closed)) => {
                    debug!(address = %self.address, error = %e, "Idle RPC connection is stale, redialing");
                    drop(conn);
                    self.call_fresh(&request).await?
                }
                Err(e) => return Err(rpc_error(e)),
            },
            None => self.call_fresh(&request).await?,
        };

        self.release(conn).await;

        if response.code != Code::Ok {
            return Err(TransportError::Status {
                code: status_code(response.code),
                message: response.message,
            });
        }

        serde_json::from_slice(&response.body).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}
