//! Binary RPC listener
//!
//! Every frame runs through the same security chain as HTTP requests before
//! it reaches [`MetricService`].

use super::service::{MetricService, ServiceError};
use crate::metric::Metric;
use crate::rpc::{
    self, Code, Method, RpcError, RpcRequest, RpcResponse, META_CONTENT_ENCODING, META_REAL_IP,
    META_SIGNATURE,
};
use crate::security::{RawRequest, Rejection, SecurityChain};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RpcServer {
    service: MetricService,
    chain: Arc<SecurityChain>,
}

impl RpcServer {
    pub fn new(service: MetricService, chain: Arc<SecurityChain>) -> Self {
        Self { service, chain }
    }

    /// Accept connections until `shutdown` fires, then wait for open ones
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), RpcError> {
        let addr = listener.local_addr()?;
        info!(%addr, "RPC server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                                debug!(%peer, error = %e, "RPC connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "RPC accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), RpcError> {
        debug!(%peer, "RPC connection opened");
        let mut framed = rpc::framed(stream);

        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rpc::recv::<_, RpcRequest>(&mut framed) => request,
            };

            let response = match request {
                Ok(Some(request)) => self.handle(request).await,
                Ok(None) => break,
                Err(RpcError::Encoding(e)) => {
                    warn!(%peer, error = %e, "Undecodable RPC frame");
                    RpcResponse::error(Code::InvalidArgument, format!("undecodable request: {}", e))
                }
                Err(e) => return Err(e),
            };

            rpc::send(&mut framed, &response).await?;
        }

        debug!(%peer, "RPC connection closed");
        Ok(())
    }

    /// Process one request envelope
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let opened = match self.chain.open(RawRequest {
            real_ip: request.metadata(META_REAL_IP),
            signature: request.metadata(META_SIGNATURE),
            content_encoding: request.metadata(META_CONTENT_ENCODING),
            body: &request.body,
        }) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(method = ?request.method, error = %e, "RPC request rejected");
                let code = match e.rejection() {
                    Rejection::Forbidden => Code::PermissionDenied,
                    Rejection::BadRequest => Code::InvalidArgument,
                    Rejection::Internal => Code::Internal,
                };
                return RpcResponse::error(code, e.to_string());
            }
        };

        let result = match request.method {
            Method::Update => match decode::<Metric>(&opened.body) {
                Ok(metric) => encode(self.service.update(metric).await),
                Err(response) => return response,
            },
            Method::UpdateBatch => match decode::<Vec<Metric>>(&opened.body) {
                Ok(metrics) => encode(self.service.update_batch(metrics).await),
                Err(response) => return response,
            },
            Method::Value => match decode::<Metric>(&opened.body) {
                Ok(query) => encode(self.service.value(&query).await),
                Err(response) => return response,
            },
        };

        let response = match result {
            Ok(body) => RpcResponse::ok(body),
            Err(response) => return response,
        };

        match (opened.signed, self.chain.sign(&response.body)) {
            (true, Some(signature)) => response.with_metadata(META_SIGNATURE, signature),
            _ => response,
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcResponse> {
    serde_json::from_slice(body).map_err(|e| {
        RpcResponse::error(Code::InvalidArgument, format!("invalid JSON body: {}", e))
    })
}

fn encode<T: Serialize>(result: Result<T, ServiceError>) -> Result<Vec<u8>, RpcResponse> {
    let value = result.map_err(|e| {
        let code = match &e {
            ServiceError::Validation(_) => Code::InvalidArgument,
            ServiceError::NotFound { .. } => Code::NotFound,
            ServiceError::Storage(err) => {
                error!(error = %err, "Storage failure");
                Code::Internal
            }
        };
        RpcResponse::error(code, e.to_string())
    })?;

    serde_json::to_vec(&value).map_err(|e| RpcResponse::error(Code::Internal, e.to_string()))
}
