//! HTTP API for cache management and generation.
//!
//! Endpoints:
//! - POST /v1/generate             : run a query (SSE stream or collected JSON)
//! - POST /v1/generate/cancel      : cancel the in-flight generation
//! - GET /v1/caches                : list cache entries
//! - PUT /v1/caches/{id}           : register a cache (document-processor contract)
//! - DELETE /v1/caches/{id}        : purge one entry
//! - DELETE /v1/caches             : purge everything
//! - POST /v1/caches/{id}/master   : designate the master entry
//! - POST /v1/caches/select        : set or clear the session selection
//! - GET /v1/history, DELETE /v1/history : ephemeral transcript
//! - GET /health

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::cache::purge::{self, PurgeError};
use crate::cache::registry::{CacheEntry, CacheRegistry, DocumentRef, RegistryError};
use crate::cache::selector::SelectorError;
use crate::cache::store::{validate_id, CacheStore, SidecarMetadata};
use crate::cache::unix_now;
use crate::cache::usage::UsageTracker;
use crate::config::Config;
use crate::inference::engine::{EngineError, GenerationEngine, GenerationEvent, GenerationRequest};
use crate::inference::model::{content_hash, ModelRef};
use crate::server::streaming::generation_to_sse_stream;

/// One ephemeral conversation turn. Held in memory for the session only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// Application state shared across handlers.
pub struct AppState {
    pub engine: GenerationEngine,
    pub store: Arc<CacheStore>,
    pub registry: Arc<RwLock<CacheRegistry>>,
    pub usage: Arc<RwLock<UsageTracker>>,
    pub selected: RwLock<Option<String>>,
    pub history: RwLock<Vec<Turn>>,
    pub model: ModelRef,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/v1/generate/cancel", post(cancel))
        .route("/v1/caches", get(list_caches).delete(purge_all_caches))
        .route("/v1/caches/{id}", put(register_cache).delete(purge_cache))
        .route("/v1/caches/{id}/master", post(set_master))
        .route("/v1/caches/select", post(select_cache))
        .route("/v1/history", get(get_history).delete(clear_history))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub query: String,

    /// Overrides the session selection for this request only.
    pub cache_id: Option<String>,

    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,

    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub request_id: String,
    pub text: String,
    pub completion_tokens: usize,
    pub used_cache: Option<String>,
    pub fallback: bool,
    pub cancelled: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    /// Path of the original document the state was built from.
    pub document_path: PathBuf,

    /// Token estimate; derived from document length when omitted.
    pub token_estimate: Option<usize>,

    /// Model overrides; default to the configured active model.
    pub model_path: Option<PathBuf>,
    pub context_size: Option<usize>,
    pub version_tag: Option<String>,

    /// Designate this entry as master.
    #[serde(default)]
    pub master: bool,
}

#[derive(Debug, Deserialize)]
pub struct SelectBody {
    /// Entry to select, or null to clear the selection.
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub entries: usize,
    pub total_cache_bytes: u64,
    pub master: Option<String>,
    pub model_path: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn engine_error_response(err: EngineError) -> Response {
    match &err {
        EngineError::Busy => error_response(StatusCode::CONFLICT, err.to_string()),
        EngineError::ModelLoadFailed(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        EngineError::Selector(SelectorError::CacheNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        EngineError::Selector(SelectorError::CacheIncompatible { .. }) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
    }
}

// ─── Generation ────────────────────────────────────────────────────────────

async fn generate(State(state): State<Arc<AppState>>, Json(body): Json<GenerateBody>) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let cache_id = match body.cache_id.clone() {
        Some(id) => Some(id),
        None => state.selected.read().await.clone(),
    };

    info!(
        request_id = %request_id,
        cache_id = ?cache_id,
        stream = body.stream,
        "Generation request"
    );

    let request = GenerationRequest {
        request_id: request_id.clone(),
        query: body.query.clone(),
        cache_id,
        max_tokens: body
            .max_tokens
            .unwrap_or(state.config.generation.default_max_tokens),
        temperature: body.temperature.unwrap_or(0.7),
    };

    let rx = match state.engine.generate(request).await {
        Ok(rx) => rx,
        Err(e) => return engine_error_response(e),
    };

    // Recorded only once the engine has accepted the request; a rejected
    // request must not leave a user turn with no reply.
    state.history.write().await.push(Turn {
        role: "user".to_string(),
        content: body.query,
    });

    if body.stream {
        let rx = relay_with_history(state.clone(), rx);
        Sse::new(generation_to_sse_stream(rx))
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        collect_response(state, request_id, rx).await
    }
}

/// Forward events unchanged while accumulating the assistant turn for the
/// session transcript.
fn relay_with_history(
    state: Arc<AppState>,
    mut rx: mpsc::Receiver<GenerationEvent>,
) -> mpsc::Receiver<GenerationEvent> {
    let capacity = state.config.generation.stream_channel_capacity;
    let (tx, out) = mpsc::channel(capacity);

    tokio::spawn(async move {
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            if let GenerationEvent::Token { text: t, .. } = &event {
                text.push_str(t);
            }
            let completed = matches!(event, GenerationEvent::Done { .. });
            if tx.send(event).await.is_err() {
                break;
            }
            if completed && !text.is_empty() {
                state.history.write().await.push(Turn {
                    role: "assistant".to_string(),
                    content: std::mem::take(&mut text),
                });
            }
        }
    });

    out
}

/// Drain the event stream into a single JSON response.
async fn collect_response(
    state: Arc<AppState>,
    request_id: String,
    mut rx: mpsc::Receiver<GenerationEvent>,
) -> Response {
    let mut text = String::new();
    let mut warnings = Vec::new();
    let mut completion_tokens = 0;
    let mut used_cache = None;
    let mut fallback = false;
    let mut cancelled = false;

    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Token { text: t, .. } => {
                text.push_str(&t);
                completion_tokens += 1;
            }
            GenerationEvent::Warning { message } => warnings.push(message),
            GenerationEvent::Done {
                used_cache: u,
                fallback: f,
                ..
            } => {
                used_cache = u;
                fallback = f;
            }
            GenerationEvent::Cancelled { .. } => cancelled = true,
            GenerationEvent::Error(e) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        }
    }

    if !cancelled && !text.is_empty() {
        state.history.write().await.push(Turn {
            role: "assistant".to_string(),
            content: text.clone(),
        });
    }

    Json(GenerateResponse {
        request_id,
        text,
        completion_tokens,
        used_cache,
        fallback,
        cancelled,
        warnings,
    })
    .into_response()
}

async fn cancel(State(state): State<Arc<AppState>>) -> Response {
    let cancelled = state.engine.cancel().await;
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

// ─── Cache Management ──────────────────────────────────────────────────────

async fn register_cache(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RegisterParams>,
    blob: Bytes,
) -> Response {
    if let Err(e) = validate_id(&id) {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }
    if blob.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty state blob");
    }

    // Serialize the whole registration against other index mutations.
    let mut registry = state.registry.write().await;
    if registry.get(&id).is_some() {
        return error_response(
            StatusCode::CONFLICT,
            RegistryError::DuplicateId(id).to_string(),
        );
    }

    let document = match tokio::fs::read(&params.document_path).await {
        Ok(content) => DocumentRef {
            path: params.document_path.clone(),
            content_hash: content_hash(&content),
            // Rough heuristic: ~4 characters per token.
            token_estimate: params.token_estimate.unwrap_or(content.len() / 4),
        },
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!(
                    "document not readable: {}: {e}",
                    params.document_path.display()
                ),
            );
        }
    };

    let model = ModelRef::new(
        params.model_path.unwrap_or_else(|| state.model.path.clone()),
        params.context_size.unwrap_or(state.model.context_size),
        params
            .version_tag
            .unwrap_or_else(|| state.model.version_tag.clone()),
    );
    let fingerprint = match model.fingerprint() {
        Ok(fp) => fp,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let created_at = unix_now();
    let sidecar = SidecarMetadata {
        model_path: model.path.clone(),
        model_fingerprint: fingerprint.clone(),
        document_path: document.path.clone(),
        document_hash: document.content_hash,
        token_estimate: document.token_estimate,
        context_size: model.context_size,
        created_at,
    };

    let location = match state.store.put(&id, &blob, &sidecar).await {
        Ok(loc) => loc,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let entry = CacheEntry {
        id: id.clone(),
        document,
        model_fingerprint: fingerprint,
        blob_path: location.blob_path,
        metadata_path: location.metadata_path,
        size_bytes: location.size_bytes,
        created_at,
        last_used_at: 0,
        use_count: 0,
        is_master: params.master,
    };

    match registry.register(entry.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_caches(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.registry.read().await;
    let entries: Vec<CacheEntry> = registry.list().into_iter().cloned().collect();
    Json(entries).into_response()
}

async fn set_master(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.registry.write().await.set_master(&id).await {
        Ok(()) => Json(serde_json::json!({ "master": id })).into_response(),
        Err(RegistryError::CacheNotFound(id)) => error_response(
            StatusCode::NOT_FOUND,
            RegistryError::CacheNotFound(id).to_string(),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn select_cache(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectBody>,
) -> Response {
    if let Some(id) = &body.id {
        if state.registry.read().await.get(id).is_none() {
            return error_response(StatusCode::NOT_FOUND, format!("cache entry not found: {id}"));
        }
    }

    *state.selected.write().await = body.id.clone();
    info!(selected = ?body.id, "Session cache selection changed");
    Json(serde_json::json!({ "selected": body.id })).into_response()
}

async fn purge_cache(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let mut registry = state.registry.write().await;
    let mut usage = state.usage.write().await;

    match purge::purge(&state.store, &mut registry, &mut usage, &id).await {
        Ok(entry) => Json(serde_json::json!({
            "purged": entry.id,
            "was_master": entry.is_master,
        }))
        .into_response(),
        Err(PurgeError::CacheNotFound(id)) => error_response(
            StatusCode::NOT_FOUND,
            PurgeError::CacheNotFound(id).to_string(),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn purge_all_caches(State(state): State<Arc<AppState>>) -> Response {
    let mut registry = state.registry.write().await;
    let mut usage = state.usage.write().await;

    match purge::purge_all(&state.store, &mut registry, &mut usage).await {
        Ok(purged) => Json(serde_json::json!({ "purged": purged })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ─── Session / Health ──────────────────────────────────────────────────────

async fn get_history(State(state): State<Arc<AppState>>) -> Response {
    Json(state.history.read().await.clone()).into_response()
}

async fn clear_history(State(state): State<Arc<AppState>>) -> Response {
    state.history.write().await.clear();
    Json(serde_json::json!({ "cleared": true })).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.registry.read().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        entries: registry.len(),
        total_cache_bytes: registry.total_bytes(),
        master: registry.master().map(|e| e.id.clone()),
        model_path: state.model.path.display().to_string(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::LocalBackend;
    use crate::inference::engine::GenerationEngine;
    use tempfile::TempDir;

    async fn app_state() -> (Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();

        let model_path = dir.path().join("model.gguf");
        std::fs::write(&model_path, vec![0u8; 256]).unwrap();
        let model = ModelRef::new(model_path, 4096, "v1".into());

        let store = Arc::new(
            CacheStore::new(dir.path().join("caches"), false, 3)
                .await
                .unwrap(),
        );
        let registry = Arc::new(RwLock::new(
            CacheRegistry::load(dir.path().join("cache_registry.json"))
                .await
                .unwrap(),
        ));
        let usage = Arc::new(RwLock::new(
            UsageTracker::load(dir.path().join("usage_registry.json"))
                .await
                .unwrap(),
        ));

        let config = Arc::new(Config::default());
        let backend = Box::new(LocalBackend::load(&model).unwrap().with_answer_tokens(3));
        let engine = GenerationEngine::new(
            backend,
            store.clone(),
            registry.clone(),
            usage.clone(),
            model.clone(),
            config.generation.clone(),
        );

        let state = Arc::new(AppState {
            engine,
            store,
            registry,
            usage,
            selected: RwLock::new(None),
            history: RwLock::new(Vec::new()),
            model,
            config,
            start_time: Instant::now(),
        });
        (state, dir)
    }

    fn body(query: &str, cache_id: Option<&str>) -> GenerateBody {
        GenerateBody {
            query: query.into(),
            cache_id: cache_id.map(str::to_string),
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_rejected_generate_leaves_no_dangling_user_turn() {
        let (state, _dir) = app_state().await;

        let resp = generate(State(state.clone()), Json(body("hello?", Some("ghost")))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(state.history.read().await.is_empty());

        // An accepted request records both sides of the exchange.
        let resp = generate(State(state.clone()), Json(body("hello?", None))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let history = state.history.read().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_register_rejects_path_like_id() {
        let (state, dir) = app_state().await;

        let doc_path = dir.path().join("doc.txt");
        std::fs::write(&doc_path, "some document").unwrap();

        let resp = register_cache(
            State(state.clone()),
            Path("../victim".to_string()),
            Query(RegisterParams {
                document_path: doc_path,
                token_estimate: None,
                model_path: None,
                context_size: None,
                version_tag: None,
                master: false,
            }),
            Bytes::from_static(b"state-bytes"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.registry.read().await.is_empty());
    }
}
