// m3u8 rewriting. every uri in the playlist gets resolved, classified, and
// either wrapped in a proxy url or deliberately left alone. line count,
// ordering and terminators of the input are preserved exactly so an already
// rewritten manifest survives a second pass untouched
use tracing::{debug, error};
use url::Url;

use crate::server::utils::strategy_utils::{
    is_broken_key_proxy_host, is_direct_cors_host, is_megaup_host, is_passthrough_proxy_host,
    is_vault_host, unwrap_broken_key_proxy,
};

/// everything the rewriter needs to know about the request it is serving
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// the final upstream response url, used to resolve relative references.
    /// deliberately the post-redirect url, a CDN that redirects to a
    /// different path before serving the manifest would otherwise break
    /// every relative segment
    pub base_url: Url,
    pub caller_referer: Option<String>,
    /// self url (path or absolute) that proxied sub-urls are built on
    pub proxy_base: String,
}

pub fn rewrite_manifest(text: &str, ctx: &RewriteContext) -> String {
    // unencrypted playlists from CORS-friendly CDNs can be played directly
    // by the browser, wrapping every segment would just add a hop
    if !has_encryption_key(text) && host_allows_direct(&ctx.base_url) {
        debug!(
            "unencrypted manifest from {} passes through untouched",
            ctx.base_url.host_str().unwrap_or("")
        );
        return text.to_string();
    }

    let mut output = String::with_capacity(text.len() + 256);

    // split('\n') keeps a trailing empty element for a trailing newline, so
    // joining on '\n' reproduces the terminator layout exactly. CRLF lines
    // are handled by peeling the '\r' off and putting it back
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            output.push('\n');
        }

        let (core, carriage) = match line.strip_suffix('\r') {
            Some(stripped) => (stripped, "\r"),
            None => (line, ""),
        };

        output.push_str(&process_line(core, ctx));
        output.push_str(carriage);
    }

    output
}

/// true when the playlist declares an AES key to fetch
pub fn has_encryption_key(text: &str) -> bool {
    text.lines()
        .any(|line| line.starts_with("#EXT-X-KEY") && line.contains("URI="))
}

fn host_allows_direct(url: &Url) -> bool {
    url.host_str().is_some_and(is_direct_cors_host)
}

fn process_line(line: &str, ctx: &RewriteContext) -> String {
    if line.trim().is_empty() {
        return line.to_string();
    }

    if line.starts_with('#') {
        return rewrite_attribute_uri(line, ctx);
    }

    // a non-comment, non-blank line is a segment or sub-playlist reference
    let trimmed = line.trim();
    match rewrite_content_reference(trimmed, ctx) {
        Some(rewritten) => splice(line, trimmed, &rewritten),
        None => line.to_string(),
    }
}

/// replaces `needle` inside `line` while keeping surrounding whitespace
fn splice(line: &str, needle: &str, replacement: &str) -> String {
    let start = line.find(needle).unwrap_or(0);
    let end = start + needle.len();
    let mut out = String::with_capacity(line.len() + replacement.len());
    out.push_str(&line[..start]);
    out.push_str(replacement);
    out.push_str(&line[end..]);
    out
}

/// handles `URI="…"` attributes on tag lines, which covers #EXT-X-KEY,
/// #EXT-X-MEDIA audio tracks, #EXT-X-MAP and anything else the playlist
/// grows later
fn rewrite_attribute_uri(line: &str, ctx: &RewriteContext) -> String {
    const NEEDLE: &str = "URI=\"";

    let Some(start) = line.find(NEEDLE) else {
        return line.to_string();
    };
    let value_start = start + NEEDLE.len();
    let Some(end_offset) = line[value_start..].find('"') else {
        // half-open quote, better to pass the line through than to corrupt it
        error!("malformed URI attribute left untouched: {}", line);
        return line.to_string();
    };
    let value_end = value_start + end_offset;
    let value = &line[value_start..value_end];

    // a manifest that has already been rewritten must not be wrapped again
    if is_already_proxied(value, ctx) {
        return line.to_string();
    }

    let resolved = match resolve_reference(value, &ctx.base_url) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("failed to resolve attribute uri {}: {}", value, e);
            return line.to_string();
        }
    };

    let rewritten = if is_key_reference(&resolved) {
        rewrite_key_reference(resolved, ctx)
    } else {
        // non-key attribute uris (audio sub-playlists and friends) always go
        // through the proxy with the caller's referer
        proxy_wrap(ctx, &resolved, ctx.caller_referer.as_deref())
    };

    let mut out = String::with_capacity(line.len() + rewritten.len());
    out.push_str(&line[..value_start]);
    out.push_str(&rewritten);
    out.push_str(&line[value_end..]);
    out
}

/// segment / sub-playlist lines. returns None when the line should be kept
/// verbatim. the order of the special cases is load-bearing
fn rewrite_content_reference(trimmed: &str, ctx: &RewriteContext) -> Option<String> {
    if is_already_proxied(trimmed, ctx) {
        return None;
    }

    let resolved = match resolve_reference(trimmed, &ctx.base_url) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("failed to resolve reference {}: {}", trimmed, e);
            return None;
        }
    };
    let host = resolved.host_str().unwrap_or("").to_string();
    let path = resolved.path().to_ascii_lowercase();

    // already behind someone else's disguise
    if is_passthrough_proxy_host(&host) {
        return None;
    }

    // megaup fragments are fetched by the player itself, which injects the
    // landing-page referer through its own request hook. the proxy cannot do
    // that for it, so the absolute url is handed over as-is
    if is_megaup_host(&host) && !path.ends_with(".m3u8") && !path.contains(".key") {
        return Some(resolved.to_string());
    }

    if is_key_reference(&resolved) {
        return Some(rewrite_key_reference(resolved, ctx));
    }

    // thumbnails are non-critical and some CDNs block relayed image fetches
    if is_thumbnail(&path) {
        return Some(resolved.to_string());
    }

    // CDNs that allow direct cross-origin segment fetches need no hop
    if is_direct_cors_host(&host) || caller_referer_allows_direct(ctx) {
        return Some(resolved.to_string());
    }

    Some(proxy_wrap(ctx, &resolved, ctx.caller_referer.as_deref()))
}

fn is_key_reference(resolved: &Url) -> bool {
    resolved.path().to_ascii_lowercase().contains(".key")
        || is_broken_key_proxy_host(resolved.host_str().unwrap_or(""))
}

/// keys get their own referer rules. vault keys are emitted untouched, the
/// browser fetches them directly with the playlist url as its natural
/// referer, which the CDN accepts where a server-relayed fetch would 403
fn rewrite_key_reference(resolved: Url, ctx: &RewriteContext) -> String {
    let resolved = match unwrap_broken_key_proxy(&resolved) {
        Some(unwrapped) => {
            debug!("unwrapped broken key proxy to {}", unwrapped);
            unwrapped
        }
        None => resolved,
    };

    let host = resolved.host_str().unwrap_or("");
    if is_vault_host(host) {
        return resolved.to_string();
    }

    let referer = if resolved.origin() == ctx.base_url.origin() {
        ctx.base_url.as_str().to_string()
    } else {
        resolved.origin().ascii_serialization()
    };

    proxy_wrap(ctx, &resolved, Some(&referer))
}

fn is_thumbnail(path: &str) -> bool {
    path.ends_with(".jpg") || path.ends_with(".jpeg") || path.ends_with(".png")
}

fn caller_referer_allows_direct(ctx: &RewriteContext) -> bool {
    ctx.caller_referer
        .as_deref()
        .and_then(|r| Url::parse(r).ok())
        .and_then(|u| u.host_str().map(is_direct_cors_host))
        .unwrap_or(false)
}

fn is_already_proxied(value: &str, ctx: &RewriteContext) -> bool {
    value.contains(&ctx.proxy_base)
}

fn resolve_reference(reference: &str, base: &Url) -> Result<Url, url::ParseError> {
    base.join(reference).or_else(|_| Url::parse(reference))
}

/// builds the proxied form of a url, the same shape the proxy endpoint
/// itself accepts
pub fn proxy_wrap(ctx: &RewriteContext, target: &Url, referer: Option<&str>) -> String {
    match referer.filter(|r| !r.is_empty()) {
        Some(referer) => format!(
            "{}?url={}&referer={}",
            ctx.proxy_base,
            urlencoding::encode(target.as_str()),
            urlencoding::encode(referer)
        ),
        None => format!(
            "{}?url={}",
            ctx.proxy_base,
            urlencoding::encode(target.as_str())
        ),
    }
}
