// per-host header strategy for the upstream CDNs. everything in here is a
// pure lookup, the retry ladder in retry_utils is what actually walks the
// fallback variants
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::server::error::{AppResult, Error};

/// the vault CDNs validate key requests against the kwik player page, nothing
/// else gets through
pub const KWIK_REFERER: &str = "https://kwik.cx/";
pub const KWIK_ORIGIN: &str = "https://kwik.cx";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
/// requested from upstream even though the client may want identity, we
/// decompress manifests ourselves before rewriting
pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, zstd";

static VAULT_HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^vault-[0-9a-z]+\.(owocdn|uwucdn)\.top$").expect("vault host pattern is valid")
});

/// fragment hosts of the megaup family, matched by suffix so the rotating
/// numbered subdomains all hit
const MEGAUP_FRAGMENT_HOSTS: &[&str] = &["megaup.cc", "megaup.live", "megaupcdn.net"];

/// CDNs that serve segments to any origin once the referer is known, so
/// wrapping their segment urls in the proxy is just a wasted hop
const DIRECT_CORS_HOSTS: &[&str] = &["padorupado.ru"];

/// third-party proxies that already disguise the request for us, rewriting
/// their urls again would double-wrap them
const PASSTHROUGH_PROXY_HOSTS: &[&str] = &["m3u8-proxy.modistreams.org"];

/// key proxy that 403s on server-to-server fetches no matter what headers we
/// send, its embedded original url is extracted and fetched directly instead
const BROKEN_KEY_PROXY_HOSTS: &[&str] = &["key.vodvidl.site"];

/// hosts that must never be proxied regardless of how they resolve
const DENYLISTED_HOSTS: &[&str] = &["localhost", "metadata.google.internal"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Manifest,
    Segment,
    Key,
    Thumbnail,
}

/// one concrete (referer, origin) pair to try against the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderVariant {
    pub referer: Option<String>,
    pub origin: Option<String>,
}

/// what to send for a given target, `fallbacks` is walked in order by the
/// retry ladder when the primary variant gets a 403
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPlan {
    pub primary: HeaderVariant,
    pub fallbacks: Vec<HeaderVariant>,
}

pub fn is_vault_host(host: &str) -> bool {
    VAULT_HOST_RE.is_match(&host.to_ascii_lowercase())
}

pub fn is_megaup_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    MEGAUP_FRAGMENT_HOSTS
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
}

pub fn is_direct_cors_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();
    is_vault_host(&lowered) || DIRECT_CORS_HOSTS.iter().any(|h| lowered == *h)
}

pub fn is_passthrough_proxy_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();
    PASSTHROUGH_PROXY_HOSTS.iter().any(|h| lowered == *h)
}

pub fn is_broken_key_proxy_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();
    BROKEN_KEY_PROXY_HOSTS.iter().any(|h| lowered == *h)
}

/// a megaup referer only works when it is the landing page url, which always
/// carries the /e/ embed path
pub fn is_megaup_landing_referer(referer: &str) -> bool {
    referer.contains("/e/")
}

pub fn classify_request(target: &Url) -> RequestKind {
    let path = target.path().to_ascii_lowercase();

    if path.contains(".key") || is_broken_key_proxy_host(target.host_str().unwrap_or("")) {
        RequestKind::Key
    } else if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        RequestKind::Manifest
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") || path.ends_with(".png") {
        RequestKind::Thumbnail
    } else {
        RequestKind::Segment
    }
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// picks the (referer, origin) pair for an upstream request, rules in
/// priority order: vault family, megaup family, generic
pub fn select_headers(
    target: &Url,
    kind: RequestKind,
    caller_referer: Option<&str>,
) -> HeaderPlan {
    let host = target.host_str().unwrap_or("");

    if is_vault_host(host) {
        if kind == RequestKind::Key {
            // key validation on the vault CDN is stricter than segment
            // validation, caller-supplied referers are ignored outright.
            // escalation order: full pair -> drop Origin -> strip the
            // trailing slash
            return HeaderPlan {
                primary: HeaderVariant {
                    referer: Some(KWIK_REFERER.to_string()),
                    origin: Some(KWIK_ORIGIN.to_string()),
                },
                fallbacks: vec![
                    HeaderVariant {
                        referer: Some(KWIK_REFERER.to_string()),
                        origin: None,
                    },
                    HeaderVariant {
                        referer: Some(KWIK_REFERER.trim_end_matches('/').to_string()),
                        origin: None,
                    },
                ],
            };
        }

        let referer = caller_referer
            .map(|r| r.to_string())
            .unwrap_or_else(|| KWIK_REFERER.to_string());
        return HeaderPlan {
            primary: HeaderVariant {
                referer: Some(referer),
                origin: None,
            },
            fallbacks: Vec::new(),
        };
    }

    if is_megaup_host(host) {
        // megaup validates that the landing page issued the request, not the
        // fragment's own origin, so a landing referer is forwarded verbatim
        // as both Referer and Origin
        let variant = match caller_referer.filter(|r| is_megaup_landing_referer(r)) {
            Some(landing) => HeaderVariant {
                referer: Some(landing.to_string()),
                origin: Some(landing.to_string()),
            },
            None => HeaderVariant {
                referer: Some(origin_of(target)),
                origin: Some(origin_of(target)),
            },
        };
        return HeaderPlan {
            primary: variant,
            fallbacks: Vec::new(),
        };
    }

    HeaderPlan {
        primary: HeaderVariant {
            referer: Some(
                caller_referer
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| origin_of(target)),
            ),
            origin: None,
        },
        fallbacks: Vec::new(),
    }
}

/// if the target is the broken third-party key proxy, pull out the original
/// key url it wraps so we can fetch that directly
pub fn unwrap_broken_key_proxy(target: &Url) -> Option<Url> {
    if !is_broken_key_proxy_host(target.host_str()?) {
        return None;
    }

    target
        .query_pairs()
        .find(|(name, _)| name == "url")
        .and_then(|(_, value)| Url::parse(&value).ok())
}

fn is_ipv4_blocked(addr: &Ipv4Addr) -> bool {
    if addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_unspecified()
        || *addr == Ipv4Addr::BROADCAST
    {
        return true;
    }

    // carrier-grade NAT (100.64.0.0/10)
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

fn is_ipv6_blocked(addr: &Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_multicast() || addr.is_unspecified() {
        return true;
    }

    let segments = addr.segments();
    let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    if is_unique_local || is_link_local {
        return true;
    }

    // IPv4-mapped addresses reuse the v4 checks
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_ipv4_blocked(&mapped);
    }

    false
}

pub fn is_denylisted_host(host: &str) -> bool {
    let lowered = host.to_ascii_lowercase();

    if DENYLISTED_HOSTS.iter().any(|h| lowered == *h) || lowered.ends_with(".onion") {
        return true;
    }

    match lowered.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => is_ipv4_blocked(&addr),
        Ok(IpAddr::V6(addr)) => is_ipv6_blocked(&addr),
        Err(_) => false,
    }
}

/// parses and vets a proxy target before any network call happens
pub fn validate_target(raw: &str) -> AppResult<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("url has no host".to_string()))?;

    if is_denylisted_host(host) {
        return Err(Error::ForbiddenTarget(host.to_string()));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_hosts_match_both_cdn_families() {
        assert!(is_vault_host("vault-1.owocdn.top"));
        assert!(is_vault_host("vault-77.uwucdn.top"));
        assert!(is_vault_host("VAULT-1.OWOCDN.TOP"));
        assert!(!is_vault_host("vault-1.owocdn.top.evil.com"));
        assert!(!is_vault_host("owocdn.top"));
    }

    #[test]
    fn megaup_hosts_match_by_suffix() {
        assert!(is_megaup_host("megaup.cc"));
        assert!(is_megaup_host("s41.megaup.cc"));
        assert!(!is_megaup_host("notmegaup.cc"));
    }

    #[test]
    fn denylist_blocks_private_addresses_and_onion() {
        assert!(is_denylisted_host("localhost"));
        assert!(is_denylisted_host("127.0.0.1"));
        assert!(is_denylisted_host("10.0.0.5"));
        assert!(is_denylisted_host("192.168.1.1"));
        assert!(is_denylisted_host("169.254.1.1"));
        assert!(is_denylisted_host("100.64.0.1"));
        assert!(is_denylisted_host("::1"));
        assert!(is_denylisted_host("example.onion"));
        assert!(!is_denylisted_host("vault-1.owocdn.top"));
        assert!(!is_denylisted_host("8.8.8.8"));
    }

    #[test]
    fn validate_target_rejects_bad_schemes() {
        assert!(validate_target("ftp://example.com/a").is_err());
        assert!(validate_target("not a url").is_err());
        assert!(validate_target("https://example.com/a.m3u8").is_ok());
    }

    #[test]
    fn classify_by_url_shape() {
        let key = Url::parse("https://vault-1.owocdn.top/k/1.key").unwrap();
        let manifest = Url::parse("https://cdn.example.com/v/index.m3u8").unwrap();
        let thumb = Url::parse("https://cdn.example.com/v/preview-01.jpg").unwrap();
        let seg = Url::parse("https://cdn.example.com/v/seg-001.ts").unwrap();

        assert_eq!(classify_request(&key), RequestKind::Key);
        assert_eq!(classify_request(&manifest), RequestKind::Manifest);
        assert_eq!(classify_request(&thumb), RequestKind::Thumbnail);
        assert_eq!(classify_request(&seg), RequestKind::Segment);
    }

    #[test]
    fn broken_key_proxy_unwraps_to_embedded_url() {
        let wrapped = Url::parse(
            "https://key.vodvidl.site/fetch?url=https%3A%2F%2Fcdn.example.com%2Fenc.key",
        )
        .unwrap();
        let unwrapped = unwrap_broken_key_proxy(&wrapped).unwrap();
        assert_eq!(unwrapped.as_str(), "https://cdn.example.com/enc.key");

        let plain = Url::parse("https://cdn.example.com/enc.key").unwrap();
        assert!(unwrap_broken_key_proxy(&plain).is_none());
    }
}
