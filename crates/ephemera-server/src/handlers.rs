use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{store::StoreError, AppState};

/// Largest accepted secret, in bytes.
pub const MAX_SECRET_BYTES: usize = 1_048_576;

/// Shown for both an unknown id and a token that fails to open the secret.
pub const NOT_FOUND_MESSAGE: &str = "secret not found or already used";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Save ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveResponse {
    pub id: String,
    pub token: String,
    /// Relative share link, `c/{id}/{token}`.
    pub link: String,
}

pub async fn save_secret(State(state): State<AppState>, Json(body): Json<SaveRequest>) -> Response {
    if body.secret.is_empty() {
        return bad_request("secret must not be empty");
    }
    if body.secret.len() > MAX_SECRET_BYTES {
        return bad_request("secret exceeds 1 MiB limit");
    }

    let store = state.store.clone();
    let saved = tokio::task::spawn_blocking(move || store.save(&body.secret)).await;

    match saved {
        Ok(Ok((id, token))) => {
            info!(id = %id, "secret saved");
            let link = format!("c/{id}/{token}");
            (StatusCode::CREATED, Json(SaveResponse { id, token, link })).into_response()
        }
        Ok(Err(e)) => store_error(e),
        Err(e) => internal_error(e),
    }
}

// ── Retrieve ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub secret: String,
}

pub async fn retrieve_secret(
    State(state): State<AppState>,
    Json(body): Json<RetrieveRequest>,
) -> Response {
    let store = state.store.clone();
    let id = body.id.clone();
    let retrieved = tokio::task::spawn_blocking(move || store.retrieve(&body.id, &body.token)).await;

    match retrieved {
        Ok(Ok(secret)) => {
            info!(id = %id, "secret retrieved");
            Json(RetrieveResponse { secret }).into_response()
        }
        Ok(Err(e)) => store_error(e),
        Err(e) => internal_error(e),
    }
}

// ── Open link ─────────────────────────────────────────────────────────────────

/// Landing step for a share link. Echoes the pair without touching the store
/// so opening a link never consumes the secret; the client then posts it to
/// `/secrets/retrieve`.
pub async fn open_link(Path((id, token)): Path<(String, String)>) -> impl IntoResponse {
    Json(json!({ "id": id, "token": token }))
}

// ── Errors ────────────────────────────────────────────────────────────────────

fn store_error(e: StoreError) -> Response {
    if e.is_not_found() {
        return (StatusCode::NOT_FOUND, Json(json!({"error": NOT_FOUND_MESSAGE}))).into_response();
    }
    internal_error(e)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
