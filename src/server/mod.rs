pub mod api;
pub mod dtos;
pub mod error;
pub mod services;
pub mod utils;

pub use self::error::{AppResult, Error};
pub use self::services::edge_services::EdgeServices;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::{Extension, Router, ServiceExt, routing::get};
use once_cell::sync::Lazy;
use tower::Layer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;

use self::api::health_controller::health_endpoint;
use self::api::proxy_controller::ProxyController;
use self::api::sources_controller::SourcesController;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        // pin the uptime clock to process start, not first health check
        Lazy::force(&START_TIME);

        let services = EdgeServices::new(config.clone());
        let cors = Self::cors_layer(&config.cors_origin)?;

        // the proxy routes manage their CORS headers by hand because every
        // response needs the wildcard no matter what origin asked
        let router = Router::new()
            .nest("/api/v1/proxy", ProxyController::app())
            .nest("/api/v1/sources", SourcesController::app().layer(cors))
            .route("/api/v1/health", get(health_endpoint))
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http());

        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind port {}", config.port))?;

        info!("edge server listening on port {}", config.port);

        axum::serve(listener, ServiceExt::<axum::extract::Request>::into_make_service(app))
            .await
            .context("server stopped unexpectedly")?;

        Ok(())
    }

    fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

        if origin.trim() == "*" {
            return Ok(layer.allow_origin(Any));
        }

        let origins = origin
            .split(',')
            .map(|o| o.trim().parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .context("invalid cors origin list")?;

        Ok(layer.allow_origin(AllowOrigin::list(origins)))
    }
}
