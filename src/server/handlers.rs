//! HTTP handlers

use super::service::{MetricService, ServiceError};
use crate::metric::{format_gauge, Metric};
use crate::storage::HealthStatus;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

/// Handler state
#[derive(Clone)]
pub struct AppState {
    pub service: MetricService,
}

/// Error returned by HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    Decode(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Decode(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Service(err) => {
                let status = match &err {
                    ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
                    ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
                    ServiceError::Storage(e) => {
                        error!(error = %e, "Storage failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };

        debug!(status = %status, message = %message, "Request rejected");
        (status, message).into_response()
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Decode(format!("invalid JSON body: {}", e)))
}

/// POST /update/
pub async fn update_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Metric>, ApiError> {
    let metric: Metric = decode(&body)?;
    Ok(Json(state.service.update(metric).await?))
}

/// POST /updates/
pub async fn update_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<Metric>>, ApiError> {
    let metrics: Vec<Metric> = decode(&body)?;
    Ok(Json(state.service.update_batch(metrics).await?))
}

/// POST /value/
pub async fn value_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Metric>, ApiError> {
    let query: Metric = decode(&body)?;
    Ok(Json(state.service.value(&query).await?))
}

/// POST /update/:kind/:name/:value
pub async fn update_text(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state.service.update_text(&kind, &name, &value).await?;
    Ok(StatusCode::OK)
}

/// GET /value/:kind/:name
pub async fn value_text(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let body = state.service.value_text(&kind, &name).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// GET /
pub async fn index(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let gauges = state.service.gauges().await?;
    if gauges.is_empty() {
        return Ok(Html("no value".to_string()));
    }

    let mut page = String::with_capacity(gauges.len() * 32);
    for (name, value) in gauges {
        page.push_str("<p>");
        page.push_str(&escape_html(&name));
        page.push_str(": ");
        page.push_str(&format_gauge(value));
        page.push_str("</p>");
    }
    Ok(Html(page))
}

/// GET /ping
pub async fn ping(State(state): State<AppState>) -> StatusCode {
    match state.service.health().await {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::NotConfigured => StatusCode::NOT_IMPLEMENTED,
        HealthStatus::Unreachable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(escape_html("Alloc"), "Alloc");
    }
}
