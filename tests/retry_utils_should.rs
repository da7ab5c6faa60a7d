use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use edge::server::error::Error;
use edge::server::utils::retry_utils::{
    LadderOutcome, RetryPolicy, is_retryable_resolution_error, with_header_ladder, with_retry,
};
use edge::server::utils::strategy_utils::{RequestKind, select_headers};
use url::Url;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn test_retryable_failure_then_success_runs_exactly_twice() {
    let calls = AtomicU32::new(0);

    let result: Result<u32, Error> = with_retry(&fast_policy(), is_retryable_resolution_error, || {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(Error::Network("connection timed out".to_string()))
            } else {
                Ok(42)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_retryable_failure_runs_exactly_once() {
    let calls = AtomicU32::new(0);

    let result: Result<u32, Error> = with_retry(&fast_policy(), is_retryable_resolution_error, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::NoSourcesFound) }
    })
    .await;

    assert!(matches!(result, Err(Error::NoSourcesFound)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attempts_are_bounded_and_last_error_propagates() {
    let calls = AtomicU32::new(0);

    let result: Result<u32, Error> = with_retry(&fast_policy(), is_retryable_resolution_error, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Err(Error::UpstreamNon2xx {
                status: 502,
                preview: String::new(),
            })
        }
    })
    .await;

    assert!(matches!(
        result,
        Err(Error::UpstreamNon2xx { status: 502, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_resolution_error_classification() {
    assert!(is_retryable_resolution_error(&Error::Network(
        "timeout".to_string()
    )));
    assert!(is_retryable_resolution_error(&Error::UpstreamNon2xx {
        status: 502,
        preview: String::new(),
    }));
    assert!(!is_retryable_resolution_error(&Error::UpstreamNon2xx {
        status: 404,
        preview: String::new(),
    }));
    assert!(!is_retryable_resolution_error(&Error::CloudflareChallenge));
    assert!(!is_retryable_resolution_error(&Error::NoSourcesFound));
}

#[tokio::test]
async fn test_ladder_escalates_past_403_to_the_working_variant() {
    // the vault key plan: full pair -> no Origin -> no trailing slash. the
    // upstream here rejects any variant that still carries an Origin header
    let target = Url::parse("https://vault-x.owocdn.top/k.key").unwrap();
    let plan = select_headers(&target, RequestKind::Key, None);
    let calls = AtomicU32::new(0);

    let status: Result<u16, Error> =
        with_header_ladder(&plan.primary, &plan.fallbacks, |variant| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if variant.origin.is_some() {
                    Ok(LadderOutcome::Rejected(403))
                } else {
                    Ok(LadderOutcome::Accepted(200))
                }
            }
        })
        .await;

    assert_eq!(status.unwrap(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ladder_surfaces_last_rejection_when_all_variants_fail() {
    let target = Url::parse("https://vault-x.owocdn.top/k.key").unwrap();
    let plan = select_headers(&target, RequestKind::Key, None);
    let calls = AtomicU32::new(0);

    let status: Result<u16, Error> =
        with_header_ladder(&plan.primary, &plan.fallbacks, |_variant| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(LadderOutcome::Rejected(403)) }
        })
        .await;

    // all three variants tried, the caller still gets the real status back
    assert_eq!(status.unwrap(), 403);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
