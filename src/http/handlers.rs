//! HTTP Handlers
//!
//! Delta ingestion, health, search, and index management endpoints.

use crate::auth::{GroupSet, ALLOWED_GROUPS_HEADER};
use crate::http::error::RestError;
use crate::http::AppState;
use crate::index_manager::READY_TIMEOUT;
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Resolve the caller's allowed groups: from the request header when
/// present, otherwise by letting the authorizing proxy answer a trivial ASK
/// and adopting the groups it attaches to the response.
async fn caller_groups(state: &AppState, headers: &HeaderMap) -> Result<GroupSet, RestError> {
    if let Some(raw) = headers.get(ALLOWED_GROUPS_HEADER) {
        let raw = raw
            .to_str()
            .map_err(|_| RestError::unauthorized("Unreadable allowed-groups header"))?;
        return GroupSet::parse_header(raw)
            .map_err(|e| RestError::unauthorized(format!("Invalid allowed-groups header: {e}")));
    }
    match state.rdf.resolve_groups().await {
        Ok(Some(groups)) => Ok(groups),
        Ok(None) => Err(RestError::unauthorized("Allowed groups could not be resolved")),
        Err(e) => Err(RestError::internal(e.to_string())),
    }
}

// ── Delta ingestion ─────────────────────────────────────────────────────────

/// `POST /update` — accept a delta message and enqueue it for dispatch.
///
/// Always answers success once the body is read: the delta producer fires
/// and forgets, so a malformed message is logged and discarded rather than
/// bounced.
pub async fn post_update(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match state.delta.handle_message(&body) {
        Ok(count) => {
            if count > 0 {
                info!(triples = count, "delta_accepted");
            }
            (StatusCode::ACCEPTED, Json(json!({ "triples": count })))
        }
        Err(e) => {
            warn!(error = %e, "delta_discarded");
            (StatusCode::ACCEPTED, Json(json!({ "triples": 0 })))
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────────

/// `GET /health` — liveness plus a sudo round-trip to the triple store.
pub async fn health(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, RestError> {
    let database = state.rdf.health_check().await.is_ok();
    let engine = state.search.health().await.is_ok();
    Ok(Json(json!({
        "status": if database && engine { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "search_engine": engine,
        "queue_length": state.updates.len(),
    })))
}

// ── Search ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub from: usize,
}

fn default_size() -> usize {
    10
}

/// `POST /:type/search` — resolve the caller's index partitions, wait for
/// readiness, and run a match query.
pub async fn search(
    Extension(state): Extension<Arc<AppState>>,
    Path(on_path): Path<String>,
    Query(params): Query<SearchParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, RestError> {
    let type_def = state
        .schema
        .type_on_path(&on_path)
        .ok_or_else(|| RestError::not_found(format!("No type on path '{on_path}'")))?;
    let groups = caller_groups(&state, &headers).await?;

    let indexes = state
        .manager
        .fetch_indexes(&type_def.name, &groups, false)
        .await?;
    for index in &indexes {
        if !state.manager.wait_until_ready(index, READY_TIMEOUT).await {
            return Err(RestError::not_ready(format!(
                "Index '{}' is still rebuilding",
                index.name
            )));
        }
    }

    let query = match &params.q {
        Some(q) => json!({ "simple_query_string": { "query": q } }),
        None => json!({ "match_all": {} }),
    };
    let body = json!({
        "query": query,
        "size": params.size,
        "from": params.from,
    });

    let names: Vec<String> = indexes.iter().map(|i| i.name.clone()).collect();
    let result = state
        .search
        .search(&names, &body)
        .await
        .map_err(|e| match e {
            crate::search_client::SearchError::BadRequest(m) => RestError::bad_request(m),
            other => RestError::internal(other.to_string()),
        })?;

    Ok(Json(result))
}

/// `POST /:type/search/raw` — pass a caller-supplied engine query through
/// unchanged. Gated behind `enable_raw_dsl_endpoint`.
pub async fn search_raw(
    Extension(state): Extension<Arc<AppState>>,
    Path(on_path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, RestError> {
    if !state.config.enable_raw_dsl_endpoint {
        return Err(RestError::not_found("Raw query endpoint is disabled"));
    }
    let type_def = state
        .schema
        .type_on_path(&on_path)
        .ok_or_else(|| RestError::not_found(format!("No type on path '{on_path}'")))?;
    let groups = caller_groups(&state, &headers).await?;

    let indexes = state
        .manager
        .fetch_indexes(&type_def.name, &groups, false)
        .await?;
    for index in &indexes {
        if !state.manager.wait_until_ready(index, READY_TIMEOUT).await {
            return Err(RestError::not_ready(format!(
                "Index '{}' is still rebuilding",
                index.name
            )));
        }
    }

    let names: Vec<String> = indexes.iter().map(|i| i.name.clone()).collect();
    let result = state
        .search
        .search(&names, &body)
        .await
        .map_err(|e| match e {
            crate::search_client::SearchError::BadRequest(m) => RestError::bad_request(m),
            other => RestError::internal(other.to_string()),
        })?;
    Ok(Json(result))
}

// ── Index management ────────────────────────────────────────────────────────

/// `POST /:type/index` — force a rebuild of the caller's partitions.
pub async fn reindex(
    Extension(state): Extension<Arc<AppState>>,
    Path(on_path): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, RestError> {
    let type_def = state
        .schema
        .type_on_path(&on_path)
        .ok_or_else(|| RestError::not_found(format!("No type on path '{on_path}'")))?;
    let groups = caller_groups(&state, &headers).await?;

    let indexes = state
        .manager
        .fetch_indexes(&type_def.name, &groups, true)
        .await?;
    Ok(Json(json!({
        "indexes": indexes.iter().map(|i| i.name.clone()).collect::<Vec<_>>()
    })))
}

/// `POST /:type/invalidate` — flip matching indexes to invalid. `_all`
/// matches every type.
pub async fn invalidate(
    Extension(state): Extension<Arc<AppState>>,
    Path(on_path): Path<String>,
) -> Result<Json<Value>, RestError> {
    let type_name = resolve_type_filter(&state, &on_path)?;
    let invalidated = state.manager.invalidate_indexes(type_name.as_deref(), None);
    Ok(Json(json!({ "invalidated": invalidated.len() })))
}

/// `DELETE /:type` — delete matching physical indexes and their registry
/// entries. `_all` matches every type.
pub async fn remove(
    Extension(state): Extension<Arc<AppState>>,
    Path(on_path): Path<String>,
) -> Result<Json<Value>, RestError> {
    let type_name = resolve_type_filter(&state, &on_path)?;
    let removed = state.manager.remove_indexes(type_name.as_deref(), None).await;
    Ok(Json(json!({ "removed": removed.len() })))
}

fn resolve_type_filter(state: &AppState, on_path: &str) -> Result<Option<String>, RestError> {
    if on_path == "_all" {
        return Ok(None);
    }
    state
        .schema
        .type_on_path(on_path)
        .map(|t| Some(t.name.clone()))
        .ok_or_else(|| RestError::not_found(format!("No type on path '{on_path}'")))
}
