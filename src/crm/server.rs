use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::controller::PipelineSettings;
use super::db::{CrmDb, DbHandle};
use super::ws;
use crate::config::MultitalkToml;

/// Configuration for the lead pipeline server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub settings: PipelineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".multitalk/leads.db"),
            dev_mode: false,
            settings: PipelineSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Server settings from a loaded config, with the database resolved
    /// against `project_dir`.
    pub fn from_toml(config: &MultitalkToml, project_dir: &std::path::Path) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.database_path(project_dir),
            dev_mode: config.server.dev_mode,
            settings: config.pipeline_settings(),
        }
    }
}

/// Build the full application router with the JSON API and event stream.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the lead pipeline server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = CrmDb::new(&config.db_path).context("Failed to initialize lead database")?;
    let state = Arc::new(AppState::new(Arc::new(DbHandle::new(db)), config.settings));

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, db = %config.db_path.display(), "Multi Talk lead pipeline listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(CrmDb::new_in_memory().unwrap());
        let state = Arc::new(AppState::new(Arc::new(db), PipelineSettings::default()));
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/board")
            .header("x-account-id", "acct-1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder()
            .uri("/ws?account=acct-1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = test_router();
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_from_toml() {
        let mut toml = MultitalkToml::default();
        toml.server.port = 8088;
        toml.pipeline.request_timeout_secs = 2;
        let config = ServerConfig::from_toml(&toml, std::path::Path::new("/srv"));
        assert_eq!(config.port, 8088);
        assert_eq!(config.db_path, PathBuf::from("/srv/.multitalk/leads.db"));
        assert_eq!(config.settings.request_timeout.as_secs(), 2);
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.dev_mode);
    }
}
