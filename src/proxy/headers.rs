//! Privacy filter for relayed headers
//!
//! Routing metadata (`X-Rotor-*` headers, `rotor-*` cookies, proxy
//! credentials) must never reach the origin, and must never reach the client
//! unless the relay itself put it there.

use std::net::IpAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, COOKIE, SET_COOKIE};
use tracing::trace;

/// Prefix of every relay-internal header
pub const INTERNAL_HEADER_PREFIX: &str = "x-rotor-";
/// Sticky proxy id, read from clients and sent back as a diagnostic
pub const HEADER_PROXYNAME: &str = "x-rotor-proxyname";
/// Client opt-in for tunnel mode
pub const HEADER_MODE: &str = "x-rotor-mode";
/// Error message on relay-generated responses
pub const HEADER_PROXYERROR: &str = "x-rotor-proxyerror";

/// Prefix of every relay-internal cookie
pub const INTERNAL_COOKIE_PREFIX: &str = "rotor-";
/// Sticky proxy id cookie
pub const COOKIE_PROXYNAME: &str = "rotor-proxyname";

const MAX_ERROR_HEADER_LEN: usize = 512;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn is_internal_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(INTERNAL_HEADER_PREFIX)
}

/// Remove internal, credential and hop-by-hop headers
///
/// Headers listed in `Connection` are removed too.
pub fn strip_internal_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            is_internal_header(name)
                || is_hop_by_hop_header(name.as_str())
                || listed.iter().any(|l| l == name.as_str())
        })
        .cloned()
        .collect();

    for name in doomed {
        trace!(header = %name, "Stripping header");
        headers.remove(&name);
    }
}

fn cookie_name(pair: &str) -> &str {
    pair.split_once('=').map(|(n, _)| n).unwrap_or(pair).trim()
}

fn is_internal_cookie(name: &str) -> bool {
    name.len() >= INTERNAL_COOKIE_PREFIX.len()
        && name[..INTERNAL_COOKIE_PREFIX.len()].eq_ignore_ascii_case(INTERNAL_COOKIE_PREFIX)
}

/// Remove internal cookies from `Cookie` and `Set-Cookie` headers
pub fn strip_internal_cookies(headers: &mut HeaderMap) {
    let cookies: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .map(str::trim)
                .filter(|pair| !pair.is_empty() && !is_internal_cookie(cookie_name(pair)))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|v| !v.is_empty())
        .collect();

    if headers.contains_key(COOKIE) {
        headers.remove(COOKIE);
        for cookie in cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(COOKIE, value);
            }
        }
    }

    if headers.contains_key(SET_COOKIE) {
        let kept: Vec<HeaderValue> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter(|v| {
                let raw = v.to_str().unwrap_or_default();
                let first = raw.split(';').next().unwrap_or_default();
                !is_internal_cookie(cookie_name(first))
            })
            .cloned()
            .collect();
        headers.remove(SET_COOKIE);
        for value in kept {
            headers.append(SET_COOKIE, value);
        }
    }
}

/// Read the sticky proxy id from the request, header first then cookie
///
/// Both carriers are removed from the map.
pub fn take_sticky_hint(headers: &mut HeaderMap) -> Option<String> {
    let from_header = headers
        .get(HEADER_PROXYNAME)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let from_cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.trim().eq_ignore_ascii_case(COOKIE_PROXYNAME) && !value.trim().is_empty() {
                Some(value.trim().to_string())
            } else {
                None
            }
        });

    headers.remove(HEADER_PROXYNAME);
    strip_internal_cookies(headers);

    from_header.or(from_cookie)
}

/// Turn an arbitrary message into a header-safe value
pub fn sanitize_header_value(message: &str) -> HeaderValue {
    let mut clean: String = message
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect();
    if clean.len() > MAX_ERROR_HEADER_LEN {
        clean.truncate(MAX_ERROR_HEADER_LEN);
    }
    let clean = clean.trim();
    HeaderValue::from_str(clean).unwrap_or_else(|_| HeaderValue::from_static("error"))
}

/// Cookie domain for a `Host` value: the last two labels of a DNS name
///
/// IP literals and single-label hosts have no cookie domain.
pub fn parse_domain(host: &str) -> Option<String> {
    let host = host.trim();
    let hostname = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        host.rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(h, _)| h)
            .unwrap_or(host)
    };

    if hostname.parse::<IpAddr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = hostname
        .trim_end_matches('.')
        .split('.')
        .filter(|l| !l.is_empty())
        .collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join(".").to_ascii_lowercase())
}

fn cookie_values(base: String, domain: Option<&str>, secure: bool) -> Vec<HeaderValue> {
    let flags = if secure {
        "HttpOnly; Secure; SameSite=None"
    } else {
        "HttpOnly"
    };
    let mut cookies = Vec::with_capacity(2);
    if let Some(domain) = domain {
        cookies.push(format!("{}; Domain=.{}; {}", base, domain, flags));
    }
    cookies.push(format!("{}; {}", base, flags));

    cookies
        .iter()
        .filter_map(|c| HeaderValue::from_str(c).ok())
        .collect()
}

/// `Set-Cookie` values binding the client to `proxy_id`
///
/// The `Domain` variant is only emitted when the host has a cookie domain.
pub fn session_cookies(proxy_id: &str, domain: Option<&str>, secure: bool) -> Vec<HeaderValue> {
    cookie_values(format!("{}={}", COOKIE_PROXYNAME, proxy_id), domain, secure)
}

/// `Set-Cookie` values clearing a stale session cookie
pub fn expired_session_cookies(domain: Option<&str>, secure: bool) -> Vec<HeaderValue> {
    cookie_values(format!("{}=", COOKIE_PROXYNAME), domain, secure)
        .into_iter()
        .filter_map(|v| {
            let expired = format!("{}; expires=Thu, 01 Jan 1970 00:00:00 GMT", v.to_str().ok()?);
            HeaderValue::from_str(&expired).ok()
        })
        .collect()
}
