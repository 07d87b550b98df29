use crate::{
    credential,
    rag::{CompletionError, ConversationTurn, QueryEngine, QueryError, QueryResult},
    semantic::{BuildError, GenerationId, IndexManager},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

pub struct SharedState {
    pub engine: Arc<QueryEngine>,
    pub manager: Arc<IndexManager>,
    pub reindex_secret: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/index", get(index_info))
        .route("/reindex", post(reindex))
        .route("/query", post(query))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn start_app(listen: String, state: Arc<SharedState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(listen: String, state: Arc<SharedState>) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(listen, state))
}

#[derive(Debug)]
enum HttpError {
    Forbidden,
    BuildFailed(BuildError),
    Query(QueryError),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self {
            HttpError::Forbidden => (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))),
            HttpError::BuildFailed(err) => {
                log::error!("reindex failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "build failed", "details": err.to_string()})),
                )
            }
            HttpError::Query(QueryError::InvalidQuery(reason)) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid query", "details": reason})),
            ),
            HttpError::Query(QueryError::Completion(err @ CompletionError::Unavailable(_))) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "upstream unavailable", "details": err.to_string()})),
            ),
            HttpError::Query(QueryError::Completion(err)) => {
                let details = match &err {
                    CompletionError::Upstream { detail, .. } => detail.clone(),
                    other => other.to_string(),
                };
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "upstream error", "details": details})),
                )
            }
            HttpError::Query(err) => {
                log::error!("{err:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
            }
        }
        .into_response()
    }
}

impl From<QueryError> for HttpError {
    fn from(err: QueryError) -> Self {
        Self::Query(err)
    }
}

impl From<BuildError> for HttpError {
    fn from(err: BuildError) -> Self {
        Self::BuildFailed(err)
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexInfoResponse {
    pub generation: GenerationId,
    pub model: String,
    pub documents: usize,
    pub dimensions: usize,
    pub built_at: DateTime<Utc>,
}

async fn index_info(State(state): State<Arc<SharedState>>) -> Json<IndexInfoResponse> {
    let generation = state.manager.current();
    Json(IndexInfoResponse {
        generation: generation.id(),
        model: generation.model().to_string(),
        documents: generation.len(),
        dimensions: generation.dimensions(),
        built_at: generation.built_at(),
    })
}

#[derive(Deserialize)]
pub struct ReindexRequest {
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReindexResponse {
    pub status: String,
    pub generation: GenerationId,
    pub documents: usize,
}

async fn reindex(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Option<Json<ReindexRequest>>,
) -> Result<Json<ReindexResponse>, HttpError> {
    let body_secret = body.as_ref().and_then(|Json(b)| b.secret.as_deref());
    if !credential::authorize(state.reindex_secret.as_deref(), &headers, body_secret) {
        log::warn!("rejected reindex request");
        return Err(HttpError::Forbidden);
    }

    let manager = state.manager.clone();
    let generation = tokio::task::block_in_place(move || manager.rebuild())?;

    Ok(Json(ReindexResponse {
        status: "reindexed".to_string(),
        generation: generation.id(),
        documents: generation.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default, deserialize_with = "lenient_k")]
    pub k: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireK {
    Number(i64),
    Text(String),
}

/// `k` may arrive as an integer or as a string holding one.
fn lenient_k<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<WireK>::deserialize(deserializer)? {
        None => Ok(None),
        Some(WireK::Number(k)) => Ok(Some(k)),
        Some(WireK::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("k is not an integer: {text:?}"))),
    }
}

async fn query(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResult>, HttpError> {
    let Json(payload) =
        payload.map_err(|rejection| QueryError::InvalidQuery(rejection.body_text()))?;
    log::debug!("payload: {payload:?}");

    // non-positive k is rejected by the engine
    let k = payload.k.map(|k| usize::try_from(k).unwrap_or(0));
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || {
        engine
            .answer(
                payload.query.as_deref().unwrap_or_default(),
                &payload.history,
                k,
            )
            .map(Json)
            .map_err(Into::into)
    })
}
