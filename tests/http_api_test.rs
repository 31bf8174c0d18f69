//! Collector HTTP API Integration Tests

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use metricsd::security::compression::gzip;
use metricsd::security::{Decryptor, SecurityChain, Signer, TrustedSubnet};
use metricsd::server::{AppState, MetricService, MetricsApi};
use metricsd::storage::MemoryRepository;
use metricsd::{Metric, Storage};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app(chain: SecurityChain) -> Router {
    let storage = Arc::new(Storage::from_repository(Arc::new(MemoryRepository::new())));
    MetricsApi::create_router(
        AppState {
            service: MetricService::new(storage),
        },
        Arc::new(chain),
        Duration::from_secs(5),
    )
}

fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_metric(response: axum::response::Response) -> Metric {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_counter_accumulates() {
    let app = app(SecurityChain::new());

    let first = app
        .clone()
        .oneshot(post_json("/update/", r#"{"id":"ss","type":"counter","delta":3}"#))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_metric(first).await, Metric::counter("ss", 3));

    let second = app
        .clone()
        .oneshot(post_json("/update/", r#"{"id":"ss","type":"counter","delta":3}"#))
        .await
        .unwrap();
    assert_eq!(body_metric(second).await, Metric::counter("ss", 6));

    let value = app
        .oneshot(post_json("/value/", r#"{"id":"ss","type":"counter"}"#))
        .await
        .unwrap();
    assert_eq!(value.status(), StatusCode::OK);
    assert_eq!(body_metric(value).await, Metric::counter("ss", 6));
}

#[tokio::test]
async fn test_gauge_overwrites() {
    let app = app(SecurityChain::new());

    for value in ["1.5", "-2.25"] {
        let body = format!(r#"{{"id":"temp","type":"gauge","value":{}}}"#, value);
        let response = app.clone().oneshot(post_json("/update/", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let value = app
        .oneshot(post_json("/value/", r#"{"id":"temp","type":"gauge"}"#))
        .await
        .unwrap();
    assert_eq!(body_metric(value).await, Metric::gauge("temp", -2.25));
}

#[tokio::test]
async fn test_missing_metric_is_not_found() {
    let app = app(SecurityChain::new());

    let response = app
        .clone()
        .oneshot(post_json("/value/", r#"{"id":"nope","type":"gauge"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/value/counter/nope")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_updates_rejected() {
    let app = app(SecurityChain::new());

    let cases = [
        "not json",
        r#"{"id":"","type":"gauge","value":1}"#,
        r#"{"id":"x","type":"histogram","value":1}"#,
        r#"{"id":"x","type":"gauge"}"#,
        r#"{"id":"x","type":"counter","value":1.5}"#,
    ];
    for body in cases {
        let response = app.clone().oneshot(post_json("/update/", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }
}

#[tokio::test]
async fn test_batch_update() {
    let app = app(SecurityChain::new());
    let batch = r#"[
        {"id":"a","type":"gauge","value":1.0},
        {"id":"c","type":"counter","delta":4},
        {"id":"a","type":"gauge","value":2.5},
        {"id":"c","type":"counter","delta":3}
    ]"#;

    let response = app.clone().oneshot(post_json("/updates/", batch)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let a = app
        .clone()
        .oneshot(post_json("/value/", r#"{"id":"a","type":"gauge"}"#))
        .await
        .unwrap();
    assert_eq!(body_metric(a).await, Metric::gauge("a", 2.5));

    let c = app
        .clone()
        .oneshot(post_json("/value/", r#"{"id":"c","type":"counter"}"#))
        .await
        .unwrap();
    assert_eq!(body_metric(c).await, Metric::counter("c", 7));

    let empty = app.oneshot(post_json("/updates/", "[]")).await.unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_text_endpoints_and_index() {
    let app = app(SecurityChain::new());

    for uri in [
        "/update/gauge/Alloc/12.500",
        "/update/gauge/%3Cb%3E/1",
        "/update/counter/hits/2",
        "/update/counter/hits/5",
    ] {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "uri: {uri}");
    }

    let request = Request::builder()
        .uri("/value/counter/hits")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(body_string(response).await, "7");

    let request = Request::builder()
        .uri("/value/gauge/Alloc")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(body_string(response).await, "12.5");

    let request = Request::builder()
        .method("POST")
        .uri("/update/counter/hits/abc")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "<p>&lt;b&gt;: 1</p><p>Alloc: 12.5</p>"
    );
}

#[tokio::test]
async fn test_index_without_gauges() {
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app(SecurityChain::new()).oneshot(request).await.unwrap();
    assert_eq!(body_string(response).await, "no value");
}

#[tokio::test]
async fn test_ping_without_database() {
    let request = Request::builder().uri("/ping").body(Body::empty()).unwrap();
    let response = app(SecurityChain::new()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_trusted_subnet() {
    let chain = SecurityChain::new().with_subnet(TrustedSubnet::parse("10.0.0.0/8").unwrap());
    let app = app(chain);
    let body = r#"{"id":"g","type":"gauge","value":1}"#;

    let cases = [
        (None, StatusCode::FORBIDDEN),
        (Some("192.168.1.1"), StatusCode::FORBIDDEN),
        (Some("not-an-ip"), StatusCode::BAD_REQUEST),
        (Some("10.1.2.3"), StatusCode::OK),
    ];
    for (ip, expected) in cases {
        let mut request = Request::builder()
            .method("POST")
            .uri("/update/")
            .header("Content-Type", "application/json");
        if let Some(ip) = ip {
            request = request.header("X-Real-IP", ip);
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "ip: {ip:?}");
    }
}

#[tokio::test]
async fn test_signature_checked_and_response_signed() {
    let signer = Signer::new("secret").unwrap();
    let app = app(SecurityChain::new().with_signer(signer.clone()));
    let body = r#"{"id":"c","type":"counter","delta":2}"#;

    let forged = Request::builder()
        .method("POST")
        .uri("/update/")
        .header("HashSHA256", signer.sign(b"something else"))
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let signed = Request::builder()
        .method("POST")
        .uri("/update/")
        .header("HashSHA256", signer.sign(body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let signature = response
        .headers()
        .get("HashSHA256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("signed response");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(signer.verify(&bytes, &signature));

    // Unsigned requests still pass and get no signature back
    let unsigned = app.oneshot(post_json("/update/", body)).await.unwrap();
    assert_eq!(unsigned.status(), StatusCode::OK);
    assert!(unsigned.headers().get("HashSHA256").is_none());
}

#[tokio::test]
async fn test_gzip_request_body() {
    let app = app(SecurityChain::new());
    let compressed = gzip(br#"{"id":"z","type":"gauge","value":0.5}"#).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/update/")
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(Body::from(compressed))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_metric(response).await, Metric::gauge("z", 0.5));
}

#[tokio::test]
async fn test_encrypted_signed_gzip_request() {
    let decryptor = Decryptor::new(RsaPrivateKey::new(&mut OsRng, 1024).unwrap());
    let encryptor = decryptor.encryptor();
    let signer = Signer::new("k").unwrap();
    let app = app(
        SecurityChain::new()
            .with_decryptor(decryptor)
            .with_signer(signer.clone()),
    );

    let compressed = gzip(br#"{"id":"sealed","type":"counter","delta":9}"#).unwrap();
    let signature = signer.sign(&compressed);
    let sealed = encryptor.encrypt(&compressed).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/update/")
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .header("HashSHA256", signature)
        .body(Body::from(sealed))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Plaintext where ciphertext is expected fails to decrypt
    let request = post_json("/update/", r#"{"id":"x","type":"counter","delta":1}"#);
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
