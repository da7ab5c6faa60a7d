// megaup resolution pipeline: visit the landing page for a cookie, pull the
// encrypted payload off the /media/ endpoint, hand it to the external decode
// service, normalize whatever comes back
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::server::dtos::sources_dto::{ResolvedSources, SubtitleTrack, VideoSource};
use crate::server::error::{AppResult, Error};
use crate::server::utils::strategy_utils::{
    DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT, is_megaup_landing_referer,
};

/// markers that show up when cloudflare serves an interstitial instead of the
/// payload. decoding that html would just produce garbage, so the pipeline
/// bails out early
const CLOUDFLARE_MARKERS: &[&str] = &["challenge-platform", "Just a moment"];

const UPSTREAM_PREVIEW_LIMIT: usize = 500;

pub type DynMegaUpService = Arc<dyn MegaUpServiceTrait + Send + Sync>;

#[automock]
#[async_trait]
pub trait MegaUpServiceTrait {
    /// runs the full pipeline for one media url. the landing url is optional,
    /// without it the pipeline runs cookie-less
    async fn resolve_sources(
        &self,
        media_url: String,
        landing_url: Option<String>,
    ) -> AppResult<ResolvedSources>;
}

/// request state accumulated across the pipeline steps, dropped after decode
struct DecryptSession {
    media_url: Url,
    landing_url: Option<Url>,
    session_cookie: Option<String>,
}

#[derive(Serialize)]
struct DecodeRequest<'a> {
    text: &'a str,
    agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie: Option<&'a str>,
}

#[derive(Deserialize)]
struct DecodeEnvelope {
    result: Option<DecodedMedia>,
}

#[derive(Deserialize)]
struct DecodedMedia {
    #[serde(default)]
    sources: Vec<DecodedSource>,
    #[serde(default)]
    tracks: Vec<DecodedTrack>,
}

#[derive(Deserialize)]
struct DecodedSource {
    file: String,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct DecodedTrack {
    file: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// the /media/ endpoint answers either json or the raw encrypted string
/// depending on which CDN node you hit, both shapes are accepted
fn extract_encrypted_payload(body: &str) -> String {
    #[derive(Deserialize)]
    struct MediaEnvelope {
        result: String,
    }

    match serde_json::from_str::<MediaEnvelope>(body) {
        Ok(envelope) => envelope.result,
        Err(_) => body.trim().to_string(),
    }
}

fn is_cloudflare_challenge(body: &str) -> bool {
    CLOUDFLARE_MARKERS.iter().any(|marker| body.contains(marker))
}

fn truncate_preview(body: &str) -> String {
    body.chars().take(UPSTREAM_PREVIEW_LIMIT).collect()
}

pub struct MegaUpService {
    http_client: reqwest::Client,
    decode_service_url: String,
}

impl MegaUpService {
    pub fn new(decode_service_url: String) -> Self {
        // the media endpoint sits behind bot detection, so the client looks
        // like a real browser and never hangs past 30s into the retry ladder
        let http_client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client,
            decode_service_url,
        }
    }

    /// optional first step: grab a session cookie off the landing page.
    /// failure is non-fatal, plenty of mirrors work without the cookie
    async fn visit_landing(&self, session: &mut DecryptSession) {
        let Some(landing) = session.landing_url.clone() else {
            return;
        };

        info!("visiting landing page for session cookie: {}", landing);

        let response = self
            .http_client
            .get(landing.clone())
            .header(header::ACCEPT, "text/html,application/xhtml+xml,*/*;q=0.8")
            .header(header::ACCEPT_LANGUAGE, DEFAULT_ACCEPT_LANGUAGE)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("landing page fetch failed, continuing without cookie: {}", e);
                return;
            }
        };

        // only the name=value part of each Set-Cookie matters for replay
        let cookies: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|c| c.split(';').next())
            .map(|c| c.trim().to_string())
            .collect();

        if cookies.is_empty() {
            warn!("landing page set no cookies, running in degraded mode");
        } else {
            session.session_cookie = Some(cookies.join("; "));
        }
    }

    async fn fetch_media(&self, session: &DecryptSession) -> AppResult<String> {
        // megaup validates the landing page as the requester, not the
        // fragment host, so an /e/ landing url is forwarded verbatim
        let landing_referer = session
            .landing_url
            .as_ref()
            .map(|u| u.as_str().to_string())
            .filter(|r| is_megaup_landing_referer(r));
        let (referer, origin) = match landing_referer {
            Some(landing) => (landing.clone(), landing),
            None => {
                let origin = session.media_url.origin().ascii_serialization();
                (origin.clone(), origin)
            }
        };

        let mut request = self
            .http_client
            .get(session.media_url.clone())
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, DEFAULT_ACCEPT_LANGUAGE)
            .header(header::REFERER, referer)
            .header(header::ORIGIN, origin)
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-site");

        if let Some(cookie) = &session.session_cookie {
            request = request.header(header::COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("media fetch failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read media response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::UpstreamNon2xx {
                status: status.as_u16(),
                preview: truncate_preview(&body),
            });
        }

        if is_cloudflare_challenge(&body) {
            warn!("media endpoint served a cloudflare challenge");
            return Err(Error::CloudflareChallenge);
        }

        Ok(extract_encrypted_payload(&body))
    }

    async fn decode(&self, session: &DecryptSession, encrypted: &str) -> AppResult<DecodedMedia> {
        info!("posting {} chars to decode service", encrypted.len());

        let request = DecodeRequest {
            text: encrypted,
            agent: DEFAULT_USER_AGENT,
            cookie: session.session_cookie.as_deref(),
        };

        let response = self
            .http_client
            .post(&self.decode_service_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::DecodeFailure(format!("decode service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::DecodeFailure(format!(
                "decode service returned status {}",
                response.status()
            )));
        }

        let envelope: DecodeEnvelope = response
            .json()
            .await
            .map_err(|e| Error::DecodeFailure(format!("unparseable decode response: {}", e)))?;

        envelope
            .result
            .ok_or_else(|| Error::DecodeFailure("decode response is missing result".to_string()))
    }

    fn normalize(decoded: DecodedMedia) -> AppResult<ResolvedSources> {
        let sources: Vec<VideoSource> = decoded
            .sources
            .into_iter()
            .map(|s| VideoSource {
                is_m3u8: s.file.contains(".m3u8"),
                quality: s.label.unwrap_or_else(|| "default".to_string()),
                url: s.file,
            })
            .collect();

        if sources.is_empty() {
            return Err(Error::NoSourcesFound);
        }

        let tracks = decoded
            .tracks
            .into_iter()
            .map(|t| SubtitleTrack {
                url: t.file,
                lang: t.label.unwrap_or_else(|| "und".to_string()),
                kind: t.kind.unwrap_or_else(|| "captions".to_string()),
            })
            .collect();

        Ok(ResolvedSources { sources, tracks })
    }
}

#[async_trait]
impl MegaUpServiceTrait for MegaUpService {
    async fn resolve_sources(
        &self,
        media_url: String,
        landing_url: Option<String>,
    ) -> AppResult<ResolvedSources> {
        let media_url = Url::parse(&media_url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", media_url, e)))?;
        let landing_url = match landing_url {
            Some(raw) => Some(
                Url::parse(&raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?,
            ),
            None => None,
        };

        let mut session = DecryptSession {
            media_url,
            landing_url,
            session_cookie: None,
        };

        self.visit_landing(&mut session).await;
        let encrypted = self.fetch_media(&session).await?;
        let decoded = self.decode(&session, &encrypted).await?;
        let resolved = Self::normalize(decoded)?;

        info!(
            "resolved {} sources and {} tracks from megaup",
            resolved.sources.len(),
            resolved.tracks.len()
        );

        Ok(resolved)
    }
}
