use edge::server::utils::strategy_utils::{
    KWIK_ORIGIN, KWIK_REFERER, RequestKind, select_headers,
};
use url::Url;

#[test]
fn test_vault_key_referer_ignores_caller() {
    // the vault CDN only accepts the kwik player as a key requester, caller
    // referers must never leak through
    let target = Url::parse("https://vault-3.owocdn.top/keys/ep1.key").unwrap();

    for caller in [None, Some("https://somewhere.else/page"), Some("garbage")] {
        let plan = select_headers(&target, RequestKind::Key, caller);
        assert_eq!(plan.primary.referer.as_deref(), Some(KWIK_REFERER));
        assert_eq!(plan.primary.origin.as_deref(), Some(KWIK_ORIGIN));
    }
}

#[test]
fn test_vault_key_fallback_ladder_order() {
    let target = Url::parse("https://vault-3.owocdn.top/keys/ep1.key").unwrap();
    let plan = select_headers(&target, RequestKind::Key, None);

    assert_eq!(plan.fallbacks.len(), 2);

    // second variant: same referer, Origin dropped
    assert_eq!(plan.fallbacks[0].referer.as_deref(), Some(KWIK_REFERER));
    assert_eq!(plan.fallbacks[0].origin, None);

    // third variant: trailing slash stripped
    assert_eq!(
        plan.fallbacks[1].referer.as_deref(),
        Some("https://kwik.cx")
    );
    assert_eq!(plan.fallbacks[1].origin, None);
}

#[test]
fn test_vault_manifest_defaults_to_kwik_without_caller_referer() {
    let target = Url::parse("https://vault-3.owocdn.top/v/index.m3u8").unwrap();

    let plan = select_headers(&target, RequestKind::Manifest, None);
    assert_eq!(plan.primary.referer.as_deref(), Some(KWIK_REFERER));

    let plan = select_headers(
        &target,
        RequestKind::Manifest,
        Some("https://caller.example/page"),
    );
    assert_eq!(
        plan.primary.referer.as_deref(),
        Some("https://caller.example/page")
    );
}

#[test]
fn test_megaup_landing_referer_is_forwarded_verbatim() {
    let target = Url::parse("https://s41.megaup.cc/media/xyz").unwrap();
    let landing = "https://megaup.cc/e/abcdef";

    let plan = select_headers(&target, RequestKind::Segment, Some(landing));
    assert_eq!(plan.primary.referer.as_deref(), Some(landing));
    assert_eq!(plan.primary.origin.as_deref(), Some(landing));
}

#[test]
fn test_megaup_without_landing_uses_fragment_origin() {
    let target = Url::parse("https://s41.megaup.cc/media/xyz").unwrap();

    // a non-landing referer does not count
    let plan = select_headers(&target, RequestKind::Segment, Some("https://other.site/"));
    assert_eq!(
        plan.primary.referer.as_deref(),
        Some("https://s41.megaup.cc")
    );
    assert_eq!(plan.primary.origin.as_deref(), Some("https://s41.megaup.cc"));
}

#[test]
fn test_generic_hosts_use_caller_referer_or_own_origin() {
    let target = Url::parse("https://cdn.example.com/v/seg1.ts").unwrap();

    let plan = select_headers(
        &target,
        RequestKind::Segment,
        Some("https://player.example.net/watch"),
    );
    assert_eq!(
        plan.primary.referer.as_deref(),
        Some("https://player.example.net/watch")
    );
    assert!(plan.fallbacks.is_empty());

    let plan = select_headers(&target, RequestKind::Segment, None);
    assert_eq!(
        plan.primary.referer.as_deref(),
        Some("https://cdn.example.com")
    );
}
