// the edge forwarder. validates the target, disguises the request with the
// per-host header strategy, and either streams the body straight back or
// rewrites it when it turns out to be a playlist
use axum::{
    Router,
    body::Body,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::io::Read;

use axum::Extension;
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{debug, error, warn};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    services::edge_services::EdgeServices,
    utils::{
        manifest_utils::{RewriteContext, rewrite_manifest},
        retry_utils::{LadderOutcome, with_header_ladder},
        strategy_utils::{
            DEFAULT_ACCEPT_ENCODING, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT, HeaderVariant,
            RequestKind, classify_request, is_vault_host, select_headers, unwrap_broken_key_proxy,
            validate_target,
        },
    },
};

const UPSTREAM_PREVIEW_LIMIT: usize = 500;
const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl; charset=utf-8";

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
    referer: Option<String>,
    origin: Option<String>,
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::proxy_get).options(Self::proxy_options))
    }

    async fn proxy_get(
        Extension(services): Extension<EdgeServices>,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params.url.as_deref().ok_or(Error::MissingUrl)?;
        let decoded = Self::decode_url(raw)?;
        let mut target = validate_target(&decoded)?;

        // the wrapped key proxy 403s server-to-server fetches no matter what,
        // so the original key url it embeds is fetched directly instead
        if let Some(unwrapped) = unwrap_broken_key_proxy(&target) {
            debug!("unwrapping key proxy target to {}", unwrapped);
            target = validate_target(unwrapped.as_str())?;
        }

        let kind = classify_request(&target);
        let mut plan = select_headers(&target, kind, params.referer.as_deref());
        if let Some(origin) = &params.origin {
            plan.primary.origin = Some(origin.clone());
        }

        debug!("proxying {:?} request: {}", kind, target);

        // the Range header has to travel upstream untouched or seeking breaks
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let use_ladder = kind == RequestKind::Key
            && target.host_str().is_some_and(is_vault_host)
            && !plan.fallbacks.is_empty();

        let response = if use_ladder {
            let client = &services.http;
            let target_ref = &target;
            let range_ref = range.as_deref();
            with_header_ladder(&plan.primary, &plan.fallbacks, |variant| async move {
                let response =
                    Self::build_upstream_request(client, target_ref, &variant, range_ref)
                        .send()
                        .await
                        .map_err(|e| Error::Network(format!("key fetch failed: {}", e)))?;
                if response.status() == reqwest::StatusCode::FORBIDDEN {
                    Ok(LadderOutcome::Rejected(response))
                } else {
                    Ok(LadderOutcome::Accepted(response))
                }
            })
            .await?
        } else {
            Self::build_upstream_request(&services.http, &target, &plan.primary, range.as_deref())
                .send()
                .await
                .map_err(|e| {
                    error!("upstream request failed: {}", e);
                    Error::Network(format!("upstream request failed: {}", e))
                })?
        };

        let status = response.status();
        debug!("upstream answered {} for {}", status, target);

        if !status.is_success() {
            // surface the real upstream status, a masked 200 would make the
            // player loop on a broken stream. body preview is capped, the
            // full thing is usually a cloudflare html page
            let preview: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(UPSTREAM_PREVIEW_LIMIT)
                .collect();
            warn!("upstream returned {} for {}", status, target);
            return Err(Error::UpstreamNon2xx {
                status: status.as_u16(),
                preview,
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let is_manifest = kind == RequestKind::Manifest
            || content_type.contains("mpegurl")
            || content_type.contains("m3u8");

        if is_manifest {
            let content_encoding = response
                .headers()
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let bytes = response.bytes().await.map_err(|e| {
                error!("failed to read manifest body: {}", e);
                Error::Network(format!("failed to read manifest body: {}", e))
            })?;

            let decompressed = Self::decompress(&bytes, content_encoding.as_deref())?;
            let text = String::from_utf8(decompressed).map_err(|e| {
                error!("manifest is not valid utf-8: {}", e);
                Error::InternalServerErrorWithContext("manifest is not valid utf-8".to_string())
            })?;

            // relative references resolve against the post-redirect url, a
            // CDN that bounces the manifest to another path would otherwise
            // produce dead segment urls
            let ctx = RewriteContext {
                base_url: final_url,
                caller_referer: params.referer.clone(),
                proxy_base: services.config.proxy_base.clone(),
            };
            let rewritten = rewrite_manifest(&text, &ctx);

            Ok(Self::manifest_response(rewritten))
        } else {
            Ok(Self::stream_response(response))
        }
    }

    async fn proxy_options() -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "*".parse().expect("Static header value should parse"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, OPTIONS"
                .parse()
                .expect("Static header value should parse"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "*".parse().expect("Static header value should parse"),
        );
        (StatusCode::NO_CONTENT, headers)
    }

    /// browser-shaped defaults plus the (referer, origin) pair picked by the
    /// strategy table. the Sec-Fetch triad cuts down bot-detection false
    /// positives on the pickier CDNs
    fn build_upstream_request(
        client: &reqwest::Client,
        target: &Url,
        variant: &HeaderVariant,
        range: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = client
            .get(target.clone())
            .header(header::USER_AGENT, DEFAULT_USER_AGENT)
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, DEFAULT_ACCEPT_LANGUAGE)
            .header(header::ACCEPT_ENCODING, DEFAULT_ACCEPT_ENCODING)
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "cross-site");

        if let Some(referer) = &variant.referer {
            builder = builder.header(header::REFERER, referer);
        }
        if let Some(origin) = &variant.origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        if let Some(range) = range {
            builder = builder.header(header::RANGE, range);
        }

        builder
    }

    fn manifest_response(body: String) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            MANIFEST_CONTENT_TYPE
                .parse()
                .expect("Static header value should parse"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            "no-store".parse().expect("Static header value should parse"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "*".parse().expect("Static header value should parse"),
        );

        (StatusCode::OK, headers, body).into_response()
    }

    /// non-manifest bodies stream through untouched. dropping the response
    /// future (client went away) drops the stream and aborts the upstream
    /// fetch with it
    fn stream_response(response: reqwest::Response) -> Response {
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);

        let mut headers = HeaderMap::new();
        for name in [
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::CONTENT_ENCODING,
            header::ACCEPT_RANGES,
        ] {
            if let Some(value) = response.headers().get(&name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers.insert(
            header::CACHE_CONTROL,
            "no-store".parse().expect("Static header value should parse"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "*".parse().expect("Static header value should parse"),
        );

        (status, headers, Body::from_stream(response.bytes_stream())).into_response()
    }

    fn decompress(bytes: &[u8], content_encoding: Option<&str>) -> AppResult<Vec<u8>> {
        match content_encoding {
            Some("zstd") => zstd::decode_all(bytes).map_err(|e| {
                error!("failed to decompress zstd manifest: {}", e);
                Error::InternalServerErrorWithContext("failed to decompress response".to_string())
            }),
            Some("gzip") => {
                let mut decoder = GzDecoder::new(bytes);
                let mut decompressed = Vec::new();
                decoder.read_to_end(&mut decompressed).map_err(|e| {
                    error!("failed to decompress gzip manifest: {}", e);
                    Error::InternalServerErrorWithContext(
                        "failed to decompress response".to_string(),
                    )
                })?;
                Ok(decompressed)
            }
            _ => Ok(bytes.to_vec()),
        }
    }

    // the url param arrives either percent-encoded or as unpadded url-safe
    // base64 depending on which caller built it
    fn decode_url(url_param: &str) -> AppResult<String> {
        if url_param.starts_with("http://") || url_param.starts_with("https://") {
            urlencoding::decode(url_param)
                .map(|s| s.to_string())
                .map_err(|e| Error::InvalidUrl(format!("bad percent encoding: {}", e)))
        } else {
            let mut padded = url_param.to_string();
            while !padded.len().is_multiple_of(4) {
                padded.push('=');
            }

            URL_SAFE
                .decode(&padded)
                .map_err(|e| Error::InvalidUrl(format!("bad base64 encoding: {}", e)))
                .and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|e| Error::InvalidUrl(format!("bad utf-8 in url: {}", e)))
                })
        }
    }
}
