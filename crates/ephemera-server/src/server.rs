use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    handlers::{health, open_link, retrieve_secret, save_secret},
    store::{Store, StoreConfig, SweepConfig, Sweeper},
    AppState,
};

pub const DEFAULT_PORT: u16 = 8834;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub sweep: SweepConfig,
    /// Comma-separated allowed origins; any origin when unset.
    pub cors_origins: Option<String>,
}

impl ServerConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            store,
            sweep: SweepConfig::default(),
            cors_origins: None,
        }
    }
}

/// All routes, without the CORS and tracing layers `run` adds.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/secrets", post(save_secret))
        .route("/secrets/retrieve", post(retrieve_secret))
        .route("/c/{id}/{token}", get(open_link))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let store = Store::open(&cfg.store).context("open secret store")?;
    info!(
        backend = store.backend_name(),
        id_length = cfg.store.id_length,
        token_length = cfg.store.token_length,
        "secret store ready"
    );

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    let sweeper = Sweeper::spawn(store.clone(), cfg.sweep.clone());

    let app = router(AppState { store })
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    info!(%addr, "ephemera server listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    sweeper.shutdown().await;
    info!("ephemera server stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(list) => cors.allow_origin(parse_origins(list)),
        None => cors.allow_origin(Any),
    }
}

fn parse_origins(list: &str) -> Vec<HeaderValue> {
    let mut origins = Vec::new();
    for origin in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match origin.parse::<HeaderValue>() {
            Ok(value) => origins.push(value),
            Err(e) => warn!(origin = %origin.escape_debug(), error = %e, "ignoring invalid CORS origin"),
        }
    }
    if origins.is_empty() {
        warn!("CORS_ORIGINS has no valid entries; cross-origin requests will be refused");
    }
    origins
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::new(StoreConfig::new("server-fragment-24-bytes"));
        assert_eq!(cfg.port, 8834);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.sweep.interval.as_secs(), 30 * 60);
        assert_eq!(cfg.sweep.ttl.as_secs(), 24 * 60 * 60);
    }

    #[tokio::test]
    async fn run_fails_fast_on_bad_key_length() {
        let cfg = ServerConfig::new(StoreConfig::new("short"));
        let err = run(cfg).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid key length"));
    }

    #[tokio::test]
    async fn run_fails_on_bad_host_before_serving() {
        let cfg = ServerConfig {
            host: "not a host".into(),
            ..ServerConfig::new(StoreConfig::new("server-fragment-24-bytes"))
        };
        let err = run(cfg).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid host/port"));
    }

    #[test]
    fn invalid_cors_origins_are_skipped() {
        let origins = parse_origins("https://a.example, ,bad\norigin,https://b.example");
        assert_eq!(
            origins,
            vec![
                HeaderValue::from_static("https://a.example"),
                HeaderValue::from_static("https://b.example"),
            ]
        );
        assert!(parse_origins("bad\norigin").is_empty());
    }
}
