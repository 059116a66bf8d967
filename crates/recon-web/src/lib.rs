//! JSON control surface over the sync pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recon_sync::{load_run_digests, load_run_outcomes, SyncPipeline};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "recon-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
struct ReportsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SeedQuery {
    path: Option<PathBuf>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/feeds", get(feeds_handler))
        .route("/runs/{feed_id}", post(run_feed_handler))
        .route("/reference/seed", post(seed_handler))
        .route("/reports", get(reports_handler))
        .route("/reports/{run_id}", get(report_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = pipeline.backend(), "control surface listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("RECON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "store": state.pipeline.backend(),
    }))
    .into_response()
}

async fn feeds_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.registry().await {
        Ok(registry) => Json(registry.feeds).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_feed_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(feed_id): AxumPath<String>,
) -> Response {
    match state.pipeline.registry().await {
        Ok(registry) if registry.get(&feed_id).is_none() => {
            return not_found(format!("unknown feed `{feed_id}`"));
        }
        Ok(_) => {}
        Err(err) => return server_error(err),
    }

    match state.pipeline.run_feed(&feed_id).await {
        Ok(run) => {
            let status = if run.committed() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let body = json!({
                "run": run.report.digest(),
                "report_dir": run.report_dir.display().to_string(),
            });
            (status, Json(body)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn seed_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeedQuery>,
) -> Response {
    match state.pipeline.seed_reference(query.path).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> Response {
    let reports_dir = &state.pipeline.config().reports_dir;
    match load_run_digests(reports_dir, query.limit.unwrap_or(20)) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn report_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Response {
    let reports_dir = &state.pipeline.config().reports_dir;
    match load_run_outcomes(reports_dir, &run_id) {
        Ok(Some(outcomes)) => Json(outcomes).into_response(),
        Ok(None) => not_found(format!("no report for run `{run_id}`")),
        Err(err) => server_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use recon_storage::MemoryStore;
    use recon_sync::SyncConfig;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn test_app() -> (Router, TempDir) {
        let out = tempdir().unwrap();
        let mut config = SyncConfig::for_workspace(workspace_root());
        config.reports_dir = out.path().join("reports");
        config.artifacts_dir = out.path().join("artifacts");
        let pipeline = SyncPipeline::with_store(config, Arc::new(MemoryStore::new())).unwrap();
        (app(AppState::new(Arc::new(pipeline))), out)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let (app, _out) = test_app();
        let (status, body) = call(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn feeds_come_from_the_registry() {
        let (app, _out) = test_app();
        let (status, body) = call(&app, "GET", "/feeds").await;
        assert_eq!(status, StatusCode::OK);
        let ids = body
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["feed_id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(ids.contains(&"bookings".to_string()));
        assert!(ids.contains(&"balances".to_string()));
    }

    #[tokio::test]
    async fn seed_run_and_read_back_reports() {
        let (app, _out) = test_app();

        let (status, seed) = call(&app, "POST", "/reference/seed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seed["inserted"], 6);

        let (status, run) = call(&app, "POST", "/runs/bookings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["run"]["status"], "committed");
        assert_eq!(run["run"]["summary"]["new"], 3);
        assert_eq!(run["run"]["summary"]["errors"], 1);
        let run_id = run["run"]["run_id"].as_str().unwrap().to_string();

        let (status, runs) = call(&app, "GET", "/reports?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let (status, detail) = call(&app, "GET", &format!("/reports/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["new"].as_array().unwrap().len(), 3);
        assert_eq!(detail["errors"][0]["outcome"], "ERROR");
    }

    #[tokio::test]
    async fn unknown_feed_and_run_are_not_found() {
        let (app, _out) = test_app();
        let (status, _) = call(&app, "POST", "/runs/ledger").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/reports/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
