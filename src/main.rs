mod config;
mod firestore;
mod http;
mod idempotency;
mod line;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod security;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, DeliveryAck, WebhookPayload};
use pipeline::Pipeline;
use security::WebhookAuth;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "shaken.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth = WebhookAuth::from_env();
    let pipeline = Pipeline::from_env();
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        auth,
        pipeline,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };
    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "shaken.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    auth: WebhookAuth,
    pipeline: Pipeline,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/webhook/line", post(line_webhook))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "shaken-api-rs",
    }))
}

/// Receive one LINE webhook delivery.
///
/// - Method: `POST`
/// - Path: `/webhook/line`
/// - Auth: `x-line-signature` HMAC over the raw body
/// - Response: `DeliveryAck` on any accepted delivery, including ones whose
///   per-event processing partially failed
///
/// The body is captured as raw bytes and verified before any parsing;
/// a re-serialized body would not hash to the platform's signature.
async fn line_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DeliveryAck>, AppError> {
    crate::metrics::inc_requests("/webhook/line");

    let signature = headers
        .get("x-line-signature")
        .and_then(|value| value.to_str().ok());
    if !state.auth.verify(&body, signature) {
        return Err(AppError::Unauthorized);
    }

    let payload: WebhookPayload =
        serde_json::from_slice(&body).map_err(|err| AppError::Parse(err.to_string()))?;

    let delivery_id = Uuid::new_v4();
    info!(
        target = "shaken.api",
        delivery = %delivery_id,
        destination = %payload.destination,
        events = payload.events.len(),
        "webhook delivery accepted",
    );

    let report = state.pipeline.handle_delivery(payload).await;
    let failed = report
        .reports
        .iter()
        .filter(|r| !r.outcome.is_processed())
        .count();
    if failed > 0 {
        warn!(
            target = "shaken.api",
            delivery = %delivery_id,
            failed,
            "delivery acknowledged with per-event failures",
        );
    }
    Ok(Json(DeliveryAck {
        status: "ok",
        received: report.received,
        processed: report.processed,
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Shaken API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

#[derive(Debug)]
enum AppError {
    Unauthorized,
    Parse(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: "invalid_signature".to_string(),
                    detail: Some("x-line-signature missing or mismatched".to_string()),
                },
            ),
            AppError::Parse(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    error: "parse_error".to_string(),
                    detail: Some(detail),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "test-channel-secret";

    fn test_app() -> Router {
        let state = AppState {
            auth: WebhookAuth::new(Some(TEST_SECRET.into())),
            pipeline: Pipeline::from_env(),
            openapi: Arc::new(json!({"openapi": "3.0.3"})),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        router(state)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(TEST_SECRET.as_bytes()).unwrap();
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn post_webhook(body: &str, signature: Option<String>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhook/line")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            request = request.header("x-line-signature", sig);
        }
        let response = test_app()
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let response = test_app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let (status, body) = post_webhook(r#"{"destination":"Ubot","events":[]}"#, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_signature");
    }

    #[tokio::test]
    async fn mismatched_signature_is_rejected() {
        let (status, _) = post_webhook(
            r#"{"destination":"Ubot","events":[]}"#,
            Some("bm90LXRoZS1zaWduYXR1cmU=".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_empty_delivery_acks_ok() {
        let body = r#"{"destination":"Ubot","events":[]}"#;
        let (status, ack) = post_webhook(body, Some(sign(body.as_bytes()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "ok");
        assert_eq!(ack["received"], 0);
        assert_eq!(ack["processed"], 0);
    }

    #[tokio::test]
    async fn signed_non_image_delivery_acks_without_processing() {
        let body = r#"{"destination":"Ubot","events":[
            {"type":"message","message":{"id":"1","type":"text"},"source":{"userId":"U1"}},
            {"type":"follow","source":{"userId":"U1"}}
        ]}"#;
        let (status, ack) = post_webhook(body, Some(sign(body.as_bytes()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["received"], 2);
        assert_eq!(ack["processed"], 0);
    }

    #[tokio::test]
    async fn signed_malformed_body_is_a_parse_error() {
        let body = r#"{"destination":"Ubot","events":"#;
        let (status, error) = post_webhook(body, Some(sign(body.as_bytes()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error["error"], "parse_error");
    }

    #[tokio::test]
    async fn signature_is_checked_before_parsing() {
        // malformed body AND bad signature: auth wins
        let (status, error) = post_webhook(r#"{"broken"#, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["error"], "invalid_signature");
    }
}
