//! Axum HTTP glue for Tender Watch: health check, workflow trigger, and
//! JSON reads over the latest run's report files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::error;
use tw_adapters::{KeywordRegistry, TenderSource};
use tw_pipeline::{Notifier, Pipeline};

pub const CRATE_NAME: &str = "tw-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<KeywordRegistry>,
    pub source: Arc<dyn TenderSource>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/run", get(run_handler))
        .route("/tenders", get(recent_tenders_handler))
        .route("/all-tenders", get(all_tenders_handler))
        .route("/report", get(report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "Tender Watch is running!"
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state
        .pipeline
        .run_workflow(
            state.source.as_ref(),
            &state.registry,
            state.notifier.as_ref(),
            Utc::now(),
        )
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            error!(?err, "tender workflow failed");
            server_error(err)
        }
    }
}

async fn recent_tenders_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_report_json(&state, "tenders_recent.json").await
}

async fn all_tenders_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_report_json(&state, "tenders_all.json").await
}

async fn report_handler(State(state): State<Arc<AppState>>) -> Response {
    let data_dir = state.pipeline.config().data_dir.clone();
    match latest_report_file(&data_dir, "notification.html") {
        Ok(Some(path)) => match tokio::fs::read_to_string(&path).await {
            Ok(html) => Html(html).into_response(),
            Err(err) => server_error(anyhow::anyhow!(err)),
        },
        Ok(None) => (StatusCode::NOT_FOUND, Html("No report yet".to_string())).into_response(),
        Err(err) => server_error(err),
    }
}

async fn serve_report_json(state: &AppState, name: &str) -> Response {
    let data_dir = state.pipeline.config().data_dir.clone();
    match latest_report_file(&data_dir, name) {
        Ok(Some(path)) => match read_json(&path).await {
            Ok(value) => Json(value).into_response(),
            Err(err) => server_error(err),
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no report yet" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

/// Find `name` inside the most recently written run directory under
/// `<data_dir>/reports`, if any run produced it yet.
fn latest_report_file(data_dir: &Path, name: &str) -> anyhow::Result<Option<PathBuf>> {
    let reports_root = data_dir.join("reports");
    if !reports_root.exists() {
        return Ok(None);
    }

    let mut dirs = std::fs::read_dir(&reports_root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs {
        let candidate = dir.path().join(name);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
