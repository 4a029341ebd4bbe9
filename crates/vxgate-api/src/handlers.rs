// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Management API handlers.
//!
//! The contract the web UI consumes:
//!
//! - `GET /api/config` — the applied configuration as JSON
//! - `POST /api/config` — validate, then overwrite the file
//! - `POST /api/reload` — re-read the file and restart adapters
//! - `GET /api/admin/locks` — lock ownership by device name

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use vxgate_config::GatewayConfig;

use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/config
pub async fn get_config(State(state): State<AppState>) -> Json<GatewayConfig> {
    Json(state.config.read().await.clone())
}

/// POST /api/config
///
/// The document is fully validated before a byte reaches disk; a rejected
/// body leaves the existing file untouched. Applying the new configuration
/// is a separate, explicit reload.
pub async fn post_config(
    State(state): State<AppState>,
    Json(config): Json<GatewayConfig>,
) -> ApiResult<Json<Value>> {
    state.loader.save(&state.config_path, &config)?;
    info!(path = %state.config_path.display(), "configuration overwritten via API");
    Ok(Json(json!({ "status": "saved" })))
}

/// POST /api/reload
pub async fn post_reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let devices = state.reload().await?;
    Ok(Json(json!({ "status": "reloaded", "devices": devices })))
}

/// GET /api/admin/locks
pub async fn get_locks(State(state): State<AppState>) -> Json<Value> {
    let owners = state.engine.lock_owners().await;
    Json(json!({ "owners": owners }))
}
