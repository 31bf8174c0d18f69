//! HTTP request protection
//!
//! Thin adapters from axum requests onto [`SecurityChain`]. Each step is its
//! own layer so the router can stack them in the required order.

use crate::security::{Rejection, SecurityChain, SecurityError, REAL_IP_HEADER, SIGNATURE_HEADER};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Largest request or response body buffered by the security layers
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

fn reject(err: SecurityError) -> Response {
    let status = match err.rejection() {
        Rejection::Forbidden => StatusCode::FORBIDDEN,
        Rejection::BadRequest => StatusCode::BAD_REQUEST,
        Rejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(status = %status, error = %err, "Request rejected by security layer");
    (status, err.to_string()).into_response()
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn buffer(body: Body) -> Result<axum::body::Bytes, Response> {
    to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)).into_response())
}

/// Trusted subnet check over `X-Real-IP`
pub async fn trusted_subnet(
    State(chain): State<Arc<SecurityChain>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = chain.check_ip(header_str(&request, REAL_IP_HEADER)) {
        return reject(e);
    }
    next.run(request).await
}

/// Replace an encrypted body with its plaintext
pub async fn decrypt_body(
    State(chain): State<Arc<SecurityChain>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let sealed = match buffer(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let opened = match chain.decrypt(&sealed) {
        Ok(opened) => opened,
        Err(e) => return reject(e),
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, Body::from(opened))).await
}

/// Verify `HashSHA256` on the request and sign the response
pub async fn verify_signature(
    State(chain): State<Arc<SecurityChain>>,
    request: Request,
    next: Next,
) -> Response {
    let signature = header_str(&request, SIGNATURE_HEADER).map(str::to_string);

    let (parts, body) = request.into_parts();
    let bytes = match buffer(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let signed = match chain.verify(signature.as_deref(), &bytes) {
        Ok(signed) => signed,
        Err(e) => return reject(e),
    };

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    if !signed {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Unable to buffer response for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(value) = chain
        .sign(&bytes)
        .and_then(|sig| HeaderValue::from_str(&sig).ok())
    {
        parts
            .headers
            .insert(HeaderName::from_static("hashsha256"), value);
    }
    Response::from_parts(parts, Body::from(bytes))
}
