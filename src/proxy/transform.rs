//! Path rewriting, header filtering and JSON body re-encoding for forwarded requests.

use axum::body::Bytes;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// External prefix every service is mounted under.
pub const SERVICES_PREFIX: &str = "/services/";

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Split `/services/{name}/rest` into `("name", "/rest")`. An empty remainder becomes `/`.
pub fn split_service_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(SERVICES_PREFIX)?;
    let (name, remainder) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if name.is_empty() {
        return None;
    }
    Some((name, remainder))
}

/// `{base}{remainder}?{query}`.
pub fn rewrite_url(upstream_base: &str, remainder: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", upstream_base.trim_end_matches('/'), remainder);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

fn is_hop_by_hop(name: &HeaderName, connection_listed: &[String]) -> bool {
    let n = name.as_str();
    HOP_BY_HOP.contains(&n) || connection_listed.iter().any(|c| c == n)
}

/// Header names listed in `Connection`, which are hop-by-hop as well.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// End-to-end request headers: drops hop-by-hop, `host` and `content-length`.
pub fn request_headers(inbound: &HeaderMap) -> HeaderMap {
    let listed = connection_tokens(inbound);
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name, &listed) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// End-to-end response headers: drops hop-by-hop, `content-length` and `server`.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_tokens(upstream);
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name, &listed)
            || name == header::CONTENT_LENGTH
            || name == header::SERVER
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// `application/json` or any `+json` media type.
pub fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let media = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            media == "application/json" || media.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Parse and re-serialize a JSON body. Non-JSON or unparsable bodies pass through untouched.
pub fn reencode_body(headers: &HeaderMap, body: Bytes) -> Bytes {
    if body.is_empty() || !is_json_content_type(headers) {
        return body;
    }
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(_) => body,
        },
        Err(e) => {
            tracing::debug!(error = %e, "JSON body did not parse, relaying raw bytes");
            body
        }
    }
}

/// Set `content-length` from the payload actually being sent.
pub fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}
