//! Collector HTTP routes

use super::handlers::*;
use super::middleware::{decrypt_body, trusted_subnet, verify_signature};
use crate::security::SecurityChain;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer, decompression::RequestDecompressionLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};

pub struct MetricsApi;

impl MetricsApi {
    /// Build the router
    ///
    /// Requests pass the subnet check, then decryption, then signature
    /// verification, then gzip decompression before reaching a handler.
    pub fn create_router(
        state: AppState,
        chain: Arc<SecurityChain>,
        request_timeout: Duration,
    ) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/ping", get(ping))
            .route("/update/", post(update_json))
            .route("/updates/", post(update_batch))
            .route("/value/", post(value_json))
            .route("/update/:kind/:name/:value", post(update_text))
            .route("/value/:kind/:name", get(value_text))
            .with_state(state)
            // Innermost first
            .layer(CompressionLayer::new())
            .layer(RequestDecompressionLayer::new())
            .layer(middleware::from_fn_with_state(chain.clone(), verify_signature))
            .layer(middleware::from_fn_with_state(chain.clone(), decrypt_body))
            .layer(middleware::from_fn_with_state(chain, trusted_subnet))
            .layer(TimeoutLayer::new(request_timeout))
            .layer(TraceLayer::new_for_http())
    }
}
