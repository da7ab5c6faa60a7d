use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::{
    Extension, Router,
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;

use edge::config::AppConfig;
use edge::server::api::sources_controller::SourcesController;
use edge::server::dtos::sources_dto::{ResolvedSources, VideoSource};
use edge::server::error::Error;
use edge::server::services::edge_services::EdgeServices;
use edge::server::services::megaup_services::{DynMegaUpService, MockMegaUpServiceTrait};
use edge::server::services::source_cache_services::{DynSourceCacheService, SourceCacheService};

fn payload() -> ResolvedSources {
    ResolvedSources {
        sources: vec![VideoSource {
            url: "https://s41.megaup.cc/stream/index.m3u8".to_string(),
            is_m3u8: true,
            quality: "1080p".to_string(),
        }],
        tracks: Vec::new(),
    }
}

fn test_app(megaup: MockMegaUpServiceTrait) -> Router {
    let services = EdgeServices {
        source_cache: Arc::new(SourceCacheService::new()) as DynSourceCacheService,
        megaup: Arc::new(megaup) as DynMegaUpService,
        http: reqwest::Client::new(),
        config: Arc::new(AppConfig::default()),
    };
    SourcesController::app().layer(Extension(services))
}

fn sources_request() -> Request<Body> {
    Request::builder()
        .uri("/?session=sess1&episode=ep1&media=https%3A%2F%2Fs41.megaup.cc%2Fmedia%2Fxyz")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_resolved_sources_are_cached_for_the_next_request() {
    let mut megaup = MockMegaUpServiceTrait::new();
    // one upstream resolution, the second request must come from the cache
    megaup
        .expect_resolve_sources()
        .times(1)
        .returning(|_, _| Ok(payload()));

    let app = test_app(megaup);

    let first = app.clone().oneshot(sources_request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(sources_request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_transient_resolution_failure_is_retried_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut megaup = MockMegaUpServiceTrait::new();
    megaup.expect_resolve_sources().times(2).returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::Network("upstream timed out".to_string()))
        } else {
            Ok(payload())
        }
    });

    let response = test_app(megaup).oneshot(sources_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cloudflare_challenge_surfaces_as_403_without_retry() {
    let mut megaup = MockMegaUpServiceTrait::new();
    // a challenge is deterministic, retrying would just hammer cloudflare
    megaup
        .expect_resolve_sources()
        .times(1)
        .returning(|_, _| Err(Error::CloudflareChallenge));

    let response = test_app(megaup).oneshot(sources_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("cloudflare_challenge"));
}

#[tokio::test]
async fn test_empty_source_lists_surface_as_404() {
    let mut megaup = MockMegaUpServiceTrait::new();
    megaup
        .expect_resolve_sources()
        .times(1)
        .returning(|_, _| Err(Error::NoSourcesFound));

    let response = test_app(megaup).oneshot(sources_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_denylisted_media_url_never_reaches_the_pipeline() {
    let megaup = MockMegaUpServiceTrait::new();

    let response = test_app(megaup)
        .oneshot(
            Request::builder()
                .uri("/?session=sess1&episode=ep1&media=http%3A%2F%2Flocalhost%2Fmedia")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
