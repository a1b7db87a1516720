// src/api.rs
//! HTTP trigger surface: `/health`, `POST /run_report`, `GET /runs/{run_id}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::config::{run::split_entities, RetrievalMode, RunConfig};
use crate::error::{ErrorKind, PipelineError, Warning};
use crate::notify::NotifierMux;
use crate::pipeline::{is_valid_run_id, CheckpointStore, Collaborators, Failure, Pipeline, RunState, Stage};
use crate::report::{Report, ReportAssembler};

#[derive(Clone)]
pub struct AppState {
    pub base_config: Arc<RunConfig>,
    pub collaborators: Collaborators,
    pub notifier: NotifierMux,
}

impl AppState {
    pub fn new(base_config: RunConfig, collaborators: Collaborators) -> Self {
        Self {
            base_config: Arc::new(base_config),
            collaborators,
            notifier: NotifierMux::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: NotifierMux) -> Self {
        self.notifier = notifier;
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/run_report", post(run_report))
        .route("/runs/{run_id}", get(get_run))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Per-request overrides on top of the server's base config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RunRequest {
    /// Comma-separated entity list.
    #[serde(default)]
    pub tickers: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub retrieval_mode: Option<String>,
    #[serde(default)]
    pub use_sec: Option<bool>,
    #[serde(default)]
    pub news_limit: Option<usize>,
    #[serde(default)]
    pub checkpoint: Option<bool>,
}

impl RunRequest {
    pub fn apply(&self, base: &RunConfig) -> Result<RunConfig, PipelineError> {
        let mut cfg = base.clone();
        if let Some(t) = &self.tickers {
            cfg.entities = split_entities(t);
        }
        if let Some(k) = self.top_k {
            cfg.top_k = k;
        }
        if let Some(m) = &self.retrieval_mode {
            cfg.retrieval_mode = m.parse::<RetrievalMode>()?;
        }
        if let Some(b) = self.use_sec {
            cfg.use_secondary_source = b;
        }
        if let Some(n) = self.news_limit {
            cfg.news_limit = n;
        }
        if let Some(c) = self.checkpoint {
            cfg.checkpoint = c;
        }
        cfg.finalize()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub stage: Stage,
    pub report: Option<Report>,
    pub warnings: Vec<Warning>,
    pub failure: Option<Failure>,
}

impl From<RunState> for RunResponse {
    fn from(s: RunState) -> Self {
        Self {
            run_id: s.run_id().to_string(),
            stage: s.stage(),
            report: s.report().cloned(),
            warnings: s.warnings().to_vec(),
            failure: s.failure().cloned(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    error: String,
}

fn error_response(status: StatusCode, err: &PipelineError) -> Response {
    let body = ErrorBody {
        kind: err.kind(),
        error: err.to_string(),
    };
    (status, Json(body)).into_response()
}

async fn run_report(State(state): State<AppState>, body: Bytes) -> Response {
    let req: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                let err = PipelineError::config(format!("invalid request body: {e}"));
                return error_response(StatusCode::BAD_REQUEST, &err);
            }
        }
    };

    let pipeline = match req
        .apply(&state.base_config)
        .and_then(|cfg| Pipeline::new(cfg, state.collaborators.clone()))
    {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(target: "pipeline", error = %e, "run rejected");
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };

    let run = pipeline.run().await;
    if let Some(report) = run.report() {
        state.notifier.deliver(report).await;
    }
    Json(RunResponse::from(run)).into_response()
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    if !is_valid_run_id(&run_id) {
        let err = PipelineError::config(format!("invalid run id '{run_id}'"));
        return error_response(StatusCode::BAD_REQUEST, &err);
    }
    let output = &state.base_config.output;

    // A snapshot carries failures and partial runs; fall back to the report file.
    if let Ok(snap) = CheckpointStore::new(&output.checkpoint_dir).load(&run_id).await {
        return Json(RunResponse::from(snap)).into_response();
    }
    match ReportAssembler::new(&output.report_dir).load(&run_id).await {
        Ok(Some(report)) => Json(RunResponse {
            run_id,
            stage: Stage::Done,
            warnings: report.degraded.clone(),
            report: Some(report),
            failure: None,
        })
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("unknown run '{run_id}'")).into_response(),
        Err(e) => {
            tracing::error!(target: "report", run_id = %run_id, error = %format!("{e:#}"), "report unreadable");
            let err = PipelineError::ReportAssemblyError(format!("{e:#}"));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_and_validate() {
        let req = RunRequest {
            tickers: Some("acme, widget".into()),
            top_k: Some(3),
            retrieval_mode: Some("vector".into()),
            ..Default::default()
        };
        let cfg = req.apply(&RunConfig::default()).unwrap();
        assert_eq!(cfg.entities, vec!["ACME", "WIDGET"]);
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.retrieval_mode, RetrievalMode::Vector);

        let bad = RunRequest {
            retrieval_mode: Some("graph".into()),
            ..Default::default()
        };
        assert_eq!(
            bad.apply(&RunConfig::default()).unwrap_err().kind(),
            ErrorKind::ConfigurationError
        );
    }
}
