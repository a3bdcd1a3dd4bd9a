use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AppError;
use crate::middleware::metrics::METRICS;
use crate::proxy::transform;
use crate::AppState;

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "service not found" })),
    )
        .into_response()
}

fn unavailable(service: &str) -> Response {
    AppError::ServiceUnavailable(service.to_string()).into_response()
}

/// Gateway for `/services/{serviceName}/...`.
///
/// Looks the prefix up in the live route table on every request, forwards with
/// the prefix stripped and answers once with the fully buffered upstream response.
#[tracing::instrument(skip(state, headers, body), fields(service = tracing::field::Empty))]
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((service_name, remainder)) = transform::split_service_path(uri.path()) else {
        return not_found();
    };
    tracing::Span::current().record("service", service_name);

    let Some(target) = state.routes.lookup(service_name).await else {
        tracing::debug!(path = %uri.path(), "no route for service");
        METRICS.record_gateway_request(service_name, 404, None);
        return not_found();
    };

    let url = transform::rewrite_url(&target.base_url(), remainder, uri.query());
    let mut upstream_headers = transform::request_headers(&headers);
    let payload = transform::reencode_body(&headers, body);
    if !payload.is_empty() {
        transform::set_content_length(&mut upstream_headers, payload.len());
    }

    let start = Instant::now();
    let upstream_resp = match tokio::time::timeout(
        state.config.forward_timeout(),
        state
            .upstream
            .forward(method.clone(), &url, upstream_headers, payload),
    )
    .await
    {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => {
            tracing::warn!(upstream = %url, error = %e, "upstream request failed");
            METRICS.record_upstream_failure(service_name, "connect");
            METRICS.record_gateway_request(service_name, 503, None);
            return unavailable(service_name);
        }
        Err(_) => {
            tracing::warn!(upstream = %url, "upstream request timed out");
            METRICS.record_upstream_failure(service_name, "timeout");
            METRICS.record_gateway_request(service_name, 503, None);
            return unavailable(service_name);
        }
    };

    let status = upstream_resp.status();
    let resp_headers = transform::response_headers(upstream_resp.headers());
    let resp_body = match upstream_resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(upstream = %url, error = %e, "upstream body read failed");
            METRICS.record_upstream_failure(service_name, "body");
            METRICS.record_gateway_request(service_name, 503, None);
            return unavailable(service_name);
        }
    };

    let elapsed = start.elapsed();
    METRICS.record_gateway_request(service_name, status.as_u16(), Some(elapsed));
    tracing::debug!(
        %method,
        upstream = %url,
        status = status.as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "forwarded"
    );

    let mut response = Response::new(Body::from(resp_body));
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    response
}
