// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Management API server.

use std::io;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::state::AppState;

/// The management HTTP server.
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    /// Creates a server over the shared state.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Builds the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );

        Router::new()
            .route(
                "/api/config",
                get(handlers::get_config).post(handlers::post_config),
            )
            .route("/api/reload", post(handlers::post_reload))
            .route("/api/admin/locks", get(handlers::get_locks))
            .layer(middleware)
            .with_state(self.state.clone())
    }

    /// Serves until `shutdown` resolves.
    pub async fn run_with_shutdown<F>(self, addr: SocketAddr, shutdown: F) -> io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "management API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    use vxgate_adapters::DefaultAdapterFactory;
    use vxgate_config::{ConfigLoader, GatewayConfig};
    use vxgate_core::GatewayEngine;

    const SAMPLE: &str = r#"
server:
  port: 1024
devices:
  echo:
    type: loopback
"#;

    async fn state() -> (AppState, tempfile::NamedTempFile) {
        use std::io::Write as _;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let loader = ConfigLoader::new();
        let (config, devices) = loader.load_and_compile(file.path()).unwrap();

        let engine = Arc::new(GatewayEngine::new(Arc::new(DefaultAdapterFactory::new())));
        engine.install_devices(devices);

        (AppState::new(engine, file.path(), config), file)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_config() {
        let (state, _file) = state().await;
        let router = ApiServer::new(state).router();

        let response = router
            .oneshot(Request::get("/api/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["server"]["port"], 1024);
        assert!(json["devices"]["echo"].is_object());
    }

    #[tokio::test]
    async fn test_get_locks_shape() {
        let (state, _file) = state().await;
        let router = ApiServer::new(state).router();

        let response = router
            .oneshot(Request::get("/api/admin/locks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert!(json["owners"]["echo"].is_null());
    }

    #[tokio::test]
    async fn test_post_invalid_config_is_rejected() {
        let (state, file) = state().await;
        let router = ApiServer::new(state).router();

        // Mapping for an undefined device fails validation.
        let bad = serde_json::json!({
            "devices": {},
            "mappings": { "ghost": [{ "pattern": "X", "response": "Y" }] }
        });
        let response = router
            .oneshot(
                Request::post("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(bad.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // The file on disk is untouched.
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("echo"));
    }

    #[tokio::test]
    async fn test_post_config_then_reload() {
        let (state, file) = state().await;
        let router = ApiServer::new(state.clone()).router();

        let updated: GatewayConfig = serde_yaml::from_str(
            r#"
devices:
  echo: { type: loopback }
  second: { type: loopback }
"#,
        )
        .unwrap();
        let response = router
            .clone()
            .oneshot(
                Request::post("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&updated).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(std::fs::read_to_string(file.path()).unwrap().contains("second"));

        let response = router
            .oneshot(Request::post("/api/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["devices"], 2);
        assert_eq!(state.engine.devices().len(), 2);
    }
}
