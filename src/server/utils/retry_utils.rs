use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::server::error::Error;
use crate::server::utils::strategy_utils::HeaderVariant;

/// bounded retry with a fixed delay. the upstream failures we see are either
/// a one-off 502/timeout (retry helps) or deterministic rejection (it never
/// does), so there is no point in exponential backoff here
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// total attempts including the first one
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(500),
        }
    }
}

/// runs `op` up to `policy.max_attempts` times, sleeping `policy.delay`
/// between attempts, and only when `is_retryable` says the error is worth it.
/// the last error is propagated untouched
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut is_retryable: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                warn!(
                    "attempt {}/{} failed with retryable error, retrying: {}",
                    attempt, policy.max_attempts, e
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// classifier used around episode-source resolution: a 502 from the upstream
/// api, a timeout, or a dropped connection is transient, everything else is
/// not worth a second fetch
pub fn is_retryable_resolution_error(error: &Error) -> bool {
    match error {
        Error::UpstreamNon2xx { status, .. } => *status == 502,
        Error::Network(_) => true,
        _ => false,
    }
}

/// outcome of one ladder attempt. `Rejected` means the upstream said 403 and
/// the next header variant should be tried
#[derive(Debug)]
pub enum LadderOutcome<T> {
    Accepted(T),
    Rejected(T),
}

/// walks the header-variant fallback ladder: the failure mode on the vault
/// CDN is deterministic header rejection rather than load, so instead of
/// re-sending the identical request we vary it. stops at the first non-403
/// outcome, and if every variant is rejected the last response is returned
/// so the caller surfaces the real upstream status
pub async fn with_header_ladder<T, E, F, Fut>(
    primary: &HeaderVariant,
    fallbacks: &[HeaderVariant],
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(HeaderVariant) -> Fut,
    Fut: Future<Output = Result<LadderOutcome<T>, E>>,
{
    let mut last = match attempt(primary.clone()).await? {
        LadderOutcome::Accepted(value) => return Ok(value),
        LadderOutcome::Rejected(value) => value,
    };

    for (i, variant) in fallbacks.iter().enumerate() {
        warn!(
            "upstream rejected header variant, escalating to fallback {}/{}",
            i + 1,
            fallbacks.len()
        );
        match attempt(variant.clone()).await? {
            LadderOutcome::Accepted(value) => return Ok(value),
            LadderOutcome::Rejected(value) => last = value,
        }
    }

    Ok(last)
}
