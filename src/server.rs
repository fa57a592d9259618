//! HTTP trigger surface for cron and the admin UI.
//!
//! `POST /process-step` runs one step and answers 200 with a [`StepReport`],
//! including when there was nothing to do. An empty body means "next eligible
//! draft"; a body that is not a valid request is a 400 and runs nothing.
//! Storage failures produce a 500.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::anthropic::MessageSender;
use crate::draft::{Draft, Stage};
use crate::error::PipelineError;
use crate::pipeline::{StepDispatcher, StepReport};
use crate::store::DraftStore;

pub struct AppState<S> {
    pub dispatcher: StepDispatcher<S>,
    pub store: DraftStore,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Draft not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Pipeline(PipelineError::DraftNotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Pipeline(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct ProcessStepRequest {
    pub draft_id: Option<String>,
}

impl ProcessStepRequest {
    /// Parse a trigger body. Only an empty body stands for "no draft id";
    /// the content type is not required since cron clients often omit it.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// One row of the admin list view.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub id: String,
    pub title: String,
    pub stage: Stage,
    pub progress: String,
    pub attempts: u32,
    pub locked: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DraftSummary {
    fn from_draft(draft: &Draft, max_attempts: u32) -> Self {
        Self {
            id: draft.id.clone(),
            title: draft.source.title.clone(),
            stage: draft.stage,
            progress: draft.progress_label(max_attempts),
            attempts: draft.attempts,
            locked: draft.is_locked(),
            next_retry_at: draft.next_retry_at,
            last_error: draft.diagnostics.last_error.clone(),
            updated_at: draft.updated_at,
        }
    }
}

async fn process_step<S: MessageSender + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<StepReport>, ApiError> {
    let request = ProcessStepRequest::from_body(&body)?;
    let report = state
        .dispatcher
        .process_step_report(request.draft_id.as_deref())
        .await?;
    info!(
        ok = report.ok,
        draft_id = report.draft_id.as_deref().unwrap_or("-"),
        duration_ms = report.duration_ms,
        "process-step"
    );
    Ok(Json(report))
}

async fn list_drafts<S: MessageSender + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DraftSummary>>, ApiError> {
    let max_attempts = state.dispatcher.policy().max_attempts;
    let drafts = state.store.list(params.limit)?;
    Ok(Json(
        drafts
            .iter()
            .map(|d| DraftSummary::from_draft(d, max_attempts))
            .collect(),
    ))
}

async fn get_draft<S: MessageSender + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Draft>, ApiError> {
    state
        .store
        .get(&id)?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

pub fn router<S: MessageSender + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/process-step", post(process_step::<S>))
        .route("/drafts", get(list_drafts::<S>))
        .route("/drafts/:id", get(get_draft::<S>))
        .with_state(state)
}

pub async fn serve<S: MessageSender + 'static>(
    state: Arc<AppState<S>>,
    bind: &str,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::clock::SystemClock;
    use crate::config::AuthoringConfig;
    use crate::draft::sample_source;
    use crate::pipeline::handlers::tests::{ScriptedSender, composed_json};
    use crate::pipeline::{LockManager, RetryPolicy, StageHandlers, WorkerId};

    fn app(replies: Vec<Result<String, crate::anthropic::AnthropicError>>) -> (Router, DraftStore) {
        let store = DraftStore::open_in_memory().unwrap();
        let locks = LockManager::new(
            store.clone(),
            WorkerId::new("http"),
            Duration::minutes(10),
            Arc::new(SystemClock),
        );
        let dispatcher = StepDispatcher::new(
            store.clone(),
            locks,
            StageHandlers::new(ScriptedSender::new(replies), AuthoringConfig::default()),
            RetryPolicy::default(),
        );
        let state = Arc::new(AppState {
            dispatcher,
            store: store.clone(),
        });
        (router(state), store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_step(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/process-step")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn idle_process_step_is_200_not_ok() {
        let (app, _) = app(vec![]);
        let resp = app.oneshot(post_step("{}")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["message"], "nothing to process");
    }

    #[tokio::test]
    async fn process_step_advances_requested_draft() {
        let (app, store) = app(vec![Ok(composed_json())]);
        let draft = store.insert(&sample_source(), Utc::now()).unwrap();
        let body = serde_json::json!({ "draftId": draft.id }).to_string();

        let resp = app.oneshot(post_step(&body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["draftId"], draft.id.as_str());
        assert_eq!(json["prevStage"], "NEW");
        assert_eq!(json["newStage"], "STAGE1_DONE");
    }

    #[tokio::test]
    async fn process_step_without_body_picks_oldest() {
        let (app, store) = app(vec![Ok(composed_json())]);
        let draft = store.insert(&sample_source(), Utc::now()).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/process-step")
            .body(Body::empty())
            .unwrap();

        let json = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(json["draftId"], draft.id.as_str());
    }

    #[tokio::test]
    async fn draft_id_is_honoured_without_content_type() {
        let (app, store) = app(vec![Ok(composed_json())]);
        let older = store
            .insert(&sample_source(), Utc::now() - Duration::minutes(5))
            .unwrap();
        let target = store.insert(&sample_source(), Utc::now()).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/process-step")
            .body(Body::from(
                serde_json::json!({ "draftId": target.id }).to_string(),
            ))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["draftId"], target.id.as_str());
        assert_eq!(store.get(&older.id).unwrap().unwrap().stage, Stage::New);
    }

    #[tokio::test]
    async fn malformed_body_is_400_and_runs_nothing() {
        let (app, store) = app(vec![Ok(composed_json())]);
        let draft = store.insert(&sample_source(), Utc::now()).unwrap();

        let resp = app.oneshot(post_step("draftId=abc")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "BAD_REQUEST");
        assert_eq!(store.get(&draft.id).unwrap().unwrap().stage, Stage::New);
    }

    #[tokio::test]
    async fn mistyped_draft_id_is_400() {
        let (app, store) = app(vec![Ok(composed_json())]);
        let draft = store.insert(&sample_source(), Utc::now()).unwrap();

        let resp = app.oneshot(post_step(r#"{"draftId": 42}"#)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.get(&draft.id).unwrap().unwrap().stage, Stage::New);
    }

    #[test]
    fn whitespace_body_is_the_default_request() {
        let request = ProcessStepRequest::from_body(b" \n").unwrap();
        assert!(request.draft_id.is_none());
        assert!(ProcessStepRequest::from_body(br#"{"draft_id": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn list_drafts_includes_progress() {
        let (app, store) = app(vec![]);
        store.insert(&sample_source(), Utc::now()).unwrap();
        let req = Request::builder()
            .uri("/drafts")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json[0]["stage"], "NEW");
        assert_eq!(json[0]["progress"], "not started");
        assert_eq!(json[0]["locked"], false);
    }

    #[tokio::test]
    async fn unknown_draft_is_404() {
        let (app, _) = app(vec![]);
        let req = Request::builder()
            .uri("/drafts/missing")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "NOT_FOUND");
    }

    #[test]
    fn store_errors_map_to_500() {
        let err = ApiError::from(PipelineError::Store(rusqlite::Error::InvalidQuery));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
