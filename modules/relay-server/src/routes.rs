use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_common::{CommitError, Entity, EntityId, IdempotencyToken, Mutation, UserPayload};
use relay_fanout::{
    Applied, CacheAdapter, Coordinator, MetricsSnapshot, ReportSnapshot, SearchDocument,
    SearchIndex, SearchQuery,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub cache: Arc<CacheAdapter>,
    pub search: Arc<dyn SearchIndex>,
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user).put(update_user))
        .route("/api/search", get(search_users))
        .route("/api/metrics", get(metrics))
        .route("/health", get(health))
        .layer(cors)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
        .with_state(state)
}

// --- Errors ---

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: EntityId) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("entity not found: {id}"),
        }
    }
}

impl From<CommitError> for ApiError {
    fn from(err: CommitError) -> Self {
        let status = match &err {
            CommitError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CommitError::NotFound(_) => StatusCode::NOT_FOUND,
            CommitError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct UserResponse {
    #[serde(flatten)]
    entity: Entity,
    replayed: bool,
    propagation: ReportSnapshot,
}

impl From<Applied> for UserResponse {
    fn from(applied: Applied) -> Self {
        Self {
            entity: applied.entity,
            replayed: applied.replayed,
            propagation: applied.status,
        }
    }
}

/// Token from the `Idempotency-Key` header, or a fresh one.
fn idempotency_token(headers: &HeaderMap) -> IdempotencyToken {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(IdempotencyToken::new)
        .unwrap_or_else(IdempotencyToken::generate)
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UserPayload>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let mutation = Mutation::create(payload.normalized(), idempotency_token(&headers));
    let applied = state.coordinator.apply(mutation).await.inspect_err(|e| {
        warn!(error = %e, "Create failed");
    })?;

    let status = if applied.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(applied.into())))
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<EntityId>,
    headers: HeaderMap,
    Json(payload): Json<UserPayload>,
) -> Result<Json<UserResponse>, ApiError> {
    let mutation = Mutation::update(id, payload.normalized(), idempotency_token(&headers));
    let applied = state.coordinator.apply(mutation).await.inspect_err(|e| {
        warn!(entity_id = id, error = %e, "Update failed");
    })?;
    Ok(Json(applied.into()))
}

/// Read-through: the cache first, then the primary store.
async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<EntityId>,
) -> Result<Json<Entity>, ApiError> {
    if let Some(entity) = state.cache.get(id) {
        return Ok(Json(entity));
    }
    match state.coordinator.get(id).await? {
        Some(entity) => Ok(Json(entity)),
        None => Err(ApiError::not_found(id)),
    }
}

async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchDocument>>, ApiError> {
    let hits = state.search.search(&query).await.map_err(|e| {
        warn!(error = %e, "Search failed");
        ApiError {
            status: if e.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_REQUEST
            },
            message: e.to_string(),
        }
    })?;
    Ok(Json(hits))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.coordinator.metrics())
}

async fn health() -> &'static str {
    "ok"
}
