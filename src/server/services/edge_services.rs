use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::AppConfig;

use super::megaup_services::MegaUpService;
use super::source_cache_services::SourceCacheService;
use super::{DynMegaUpService, DynSourceCacheService};

/// everything the handlers need, cloned into each request via Extension
#[derive(Clone)]
pub struct EdgeServices {
    pub source_cache: DynSourceCacheService,
    pub megaup: DynMegaUpService,
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

impl EdgeServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        info!("starting edge services...");

        // forwarding client: bounded connect, but no total timeout because
        // segment bodies stream for as long as the client keeps watching
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let source_cache = Arc::new(SourceCacheService::new()) as DynSourceCacheService;
        let megaup =
            Arc::new(MegaUpService::new(config.decode_service_url.clone())) as DynMegaUpService;

        info!("edge services ok");

        Self {
            source_cache,
            megaup,
            http,
            config,
        }
    }
}
