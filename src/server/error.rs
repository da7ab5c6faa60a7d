use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type AppResult<T> = Result<T, Error>;

/// error taxonomy for the proxy path
///
/// everything that reaches a handler boundary becomes one of these so the
/// client always sees a status code that mirrors the underlying cause instead
/// of a blanket 500
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing url parameter")]
    MissingUrl,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("target host is not allowed: {0}")]
    ForbiddenTarget(String),

    /// upstream answered with a non-2xx status, preview is capped at 500
    /// chars because cloudflare error pages clog the logs otherwise
    #[error("upstream returned status {status}")]
    UpstreamNon2xx { status: u16, preview: String },

    #[error("upstream request failed: {0}")]
    Network(String),

    #[error("upstream is serving a cloudflare challenge")]
    CloudflareChallenge,

    #[error("decode service failure: {0}")]
    DecodeFailure(String),

    #[error("no playable sources found")]
    NoSourcesFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("internal server error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingUrl | Error::InvalidUrl(_) | Error::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ForbiddenTarget(_) | Error::CloudflareChallenge => StatusCode::FORBIDDEN,
            Error::UpstreamNon2xx { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Network(_) | Error::DecodeFailure(_) => StatusCode::BAD_GATEWAY,
            Error::NoSourcesFound => StatusCode::NOT_FOUND,
            Error::InternalServerError | Error::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// stable machine-readable code for the json body
    fn code(&self) -> &'static str {
        match self {
            Error::MissingUrl => "missing_url",
            Error::InvalidUrl(_) => "invalid_url",
            Error::ForbiddenTarget(_) => "forbidden_target",
            Error::UpstreamNon2xx { .. } => "upstream_error",
            Error::Network(_) => "network_error",
            Error::CloudflareChallenge => "cloudflare_challenge",
            Error::DecodeFailure(_) => "decode_failure",
            Error::NoSourcesFound => "no_sources_found",
            Error::BadRequest(_) => "bad_request",
            Error::InternalServerError | Error::InternalServerErrorWithContext(_) => {
                "internal_error"
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            Error::UpstreamNon2xx { status, preview } => json!({
                "error": self.code(),
                "message": self.to_string(),
                "upstream_status": status,
                "upstream_body": preview,
            }),
            _ => json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            "*".parse().expect("Static header value should parse"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            "no-store".parse().expect("Static header value should parse"),
        );

        response
    }
}
