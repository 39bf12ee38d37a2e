//! Admin HTTP surface for the price sync: manual trigger + status.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fuelsync_core::{SyncMode, SyncStateRecord, SyncSummary};
use fuelsync_sync::{parse_trigger_mode, SyncError, SyncService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "fuelsync-web";

pub const TRIGGER_PATH: &str = "/admin/sync/service-nsw";
pub const STATUS_PATH: &str = "/admin/sync/service-nsw/status";

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(sync: Arc<SyncService>) -> Self {
        Self { sync }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    message: &'static str,
    mode: SyncMode,
    duration_ms: u64,
    summary: SyncSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(TRIGGER_PATH, post(trigger_handler))
        .route(STATUS_PATH, get(status_handler))
        .with_state(state)
}

pub fn port_from_env() -> u16 {
    std::env::var("FUELSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
}

/// Serves [`app`] on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn trigger_handler(
    State(state): State<AppState>,
    payload: Result<Json<TriggerRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let mode = match parse_trigger_mode(&request.mode) {
        Ok(mode) => mode,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "mode must be one of: full, incremental".to_string(),
            )
        }
    };

    let started = Instant::now();
    match state.sync.trigger(mode).await {
        Ok(summary) => Json(TriggerResponse {
            message: "service NSW sync completed",
            mode,
            duration_ms: started.elapsed().as_millis() as u64,
            summary,
        })
        .into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.sync.status().await {
        Ok(status) => Json::<SyncStateRecord>(status).into_response(),
        Err(err) => {
            error!(error = %err, "failed to load sync status");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to load sync status: {err}"),
            )
        }
    }
}

fn sync_error_response(err: SyncError) -> Response {
    match err {
        SyncError::Disabled | SyncError::NotConfigured => {
            error_response(StatusCode::FAILED_DEPENDENCY, err.to_string())
        }
        SyncError::InvalidMode(_) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        other => {
            error!(error = %other, "manual service nsw sync failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("sync failed: {other}"),
            )
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{DateTime, Utc};
    use fuelsync_adapters::{FeedError, PriceFeed};
    use fuelsync_core::{PriceSnapshot, ReferenceData};
    use fuelsync_storage::MemoryStore;
    use fuelsync_sync::SyncConfig;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct StubFeed {
        fail_prices: bool,
    }

    #[async_trait]
    impl PriceFeed for StubFeed {
        async fn reference_data(&self, _since: DateTime<Utc>) -> Result<ReferenceData, FeedError> {
            Err(FeedError::NotModified)
        }

        async fn all_current_prices(&self) -> Result<PriceSnapshot, FeedError> {
            if self.fail_prices {
                return Err(FeedError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            Ok(PriceSnapshot::default())
        }

        async fn new_current_prices(&self) -> Result<PriceSnapshot, FeedError> {
            Ok(PriceSnapshot::default())
        }
    }

    fn config(enabled: bool) -> SyncConfig {
        SyncConfig {
            enabled,
            base_url: "http://127.0.0.1:9".to_string(),
            states: "NSW".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            incremental_interval: Duration::from_secs(300),
            full_sync_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn test_app(enabled: bool, feed: Option<StubFeed>) -> Router {
        let feed = feed.map(|f| Arc::new(f) as Arc<dyn PriceFeed>);
        let sync = SyncService::new(Arc::new(MemoryStore::new()), feed, config(enabled));
        app(AppState::new(Arc::new(sync)))
    }

    fn trigger(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(TRIGGER_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn trigger_full_returns_summary() {
        let app = test_app(true, Some(StubFeed { fail_prices: false }));
        let resp = app.oneshot(trigger(r#"{"mode":" Full "}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["message"], "service NSW sync completed");
        assert_eq!(body["mode"], "full");
        assert!(body["durationMs"].is_u64());
        assert_eq!(body["summary"]["mode"], "full");
        assert_eq!(body["summary"]["prices_upserted"], 0);
    }

    #[tokio::test]
    async fn unknown_mode_is_bad_request() {
        let app = test_app(true, Some(StubFeed { fail_prices: false }));
        let resp = app.oneshot(trigger(r#"{"mode":"reference"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "mode must be one of: full, incremental");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = test_app(true, Some(StubFeed { fail_prices: false }));
        let resp = app.oneshot(trigger("{not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let app = test_app(true, Some(StubFeed { fail_prices: false }));
        let resp = app.oneshot(trigger("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn disabled_and_unconfigured_map_to_failed_dependency() {
        let disabled = test_app(false, Some(StubFeed { fail_prices: false }));
        let resp = disabled
            .oneshot(trigger(r#"{"mode":"incremental"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FAILED_DEPENDENCY);
        assert_eq!(json_body(resp).await["error"], "service nsw sync is disabled");

        let unconfigured = test_app(true, None);
        let resp = unconfigured
            .oneshot(trigger(r#"{"mode":"full"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FAILED_DEPENDENCY);
    }

    #[tokio::test]
    async fn upstream_failure_is_server_error() {
        let app = test_app(true, Some(StubFeed { fail_prices: true }));
        let resp = app.oneshot(trigger(r#"{"mode":"full"}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("sync failed: "));
        assert!(message.contains("502"));
    }

    #[tokio::test]
    async fn status_reports_last_outcome() {
        let app = test_app(true, Some(StubFeed { fail_prices: true }));
        let resp = app
            .clone()
            .oneshot(trigger(r#"{"mode":"full"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = app
            .oneshot(Request::builder().uri(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["sync_key"], "service_nsw_v2");
        assert!(body["last_reference_sync_at"].is_string());
        assert!(body["last_full_sync_at"].is_null());
        assert!(body["last_error"].as_str().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn status_before_any_run_is_empty() {
        let app = test_app(false, None);
        let resp = app
            .oneshot(Request::builder().uri(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["last_success_at"].is_null());
        assert!(body["last_error"].is_null());
    }
}
