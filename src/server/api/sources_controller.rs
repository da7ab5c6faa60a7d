use axum::{Extension, Json, Router, extract::Query, routing::get};
use serde::Deserialize;
use tracing::debug;

use crate::server::{
    dtos::sources_dto::ResolvedSources,
    error::AppResult,
    services::edge_services::EdgeServices,
    utils::{
        retry_utils::{RetryPolicy, is_retryable_resolution_error, with_retry},
        strategy_utils::validate_target,
    },
};

#[derive(Deserialize)]
struct SourcesQuery {
    session: String,
    episode: String,
    /// megaup /media/ endpoint for this episode
    media: String,
    /// embed landing page, enables the cookie step and the /e/ referer
    landing: Option<String>,
}

pub struct SourcesController;

impl SourcesController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::sources_get))
    }

    /// cache-first episode resolution. a miss runs the megaup pipeline once,
    /// retried only for transient upstream failures. concurrent misses for
    /// the same episode may both fetch, last write wins, which is fine for a
    /// payload that stays valid for an hour
    async fn sources_get(
        Extension(services): Extension<EdgeServices>,
        Query(params): Query<SourcesQuery>,
    ) -> AppResult<Json<ResolvedSources>> {
        if let Some(cached) = services
            .source_cache
            .get(&params.session, &params.episode)
            .await
        {
            debug!(
                "returning cached sources for {}:{}",
                params.session, params.episode
            );
            return Ok(Json(cached));
        }

        // same vetting as the proxy endpoint, before any fetch happens
        validate_target(&params.media)?;
        if let Some(landing) = &params.landing {
            validate_target(landing)?;
        }

        let policy = RetryPolicy::default();
        let resolved = with_retry(&policy, is_retryable_resolution_error, || {
            services
                .megaup
                .resolve_sources(params.media.clone(), params.landing.clone())
        })
        .await?;

        services
            .source_cache
            .set(&params.session, &params.episode, resolved.clone())
            .await;

        Ok(Json(resolved))
    }
}
