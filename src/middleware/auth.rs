use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::Permission;
use crate::errors::AppError;
use crate::AppState;

/// Email of the verified caller, `None` when authentication is disabled.
#[derive(Debug, Clone, Default)]
pub struct Actor(pub Option<String>);

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Permission a control API request needs. Reads and the request testing
/// helper need `Read`; everything that changes a service needs `Manage`.
pub fn required_permission(method: &Method, path: &str) -> Permission {
    if *method == Method::GET || *method == Method::HEAD {
        return Permission::Read;
    }
    if *method == Method::POST && path.trim_end_matches('/').ends_with("/test") {
        return Permission::Read;
    }
    Permission::Manage
}

/// Middleware: verifies the bearer token for the control API and stores the
/// caller as an [`Actor`] extension.
pub async fn require_permission(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let permission = required_permission(req.method(), req.uri().path());
    let identity = state
        .authorizer
        .authorize(extract_bearer_token(req.headers()), permission)
        .await?;

    let actor = Actor(identity.and_then(|i| i.email));
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_by_route() {
        assert_eq!(
            required_permission(&Method::GET, "/api/microservices"),
            Permission::Read
        );
        assert_eq!(
            required_permission(&Method::POST, "/api/microservices/abc/test"),
            Permission::Read
        );
        assert_eq!(
            required_permission(&Method::POST, "/api/microservices"),
            Permission::Manage
        );
        assert_eq!(
            required_permission(&Method::POST, "/api/microservices/abc/stop"),
            Permission::Manage
        );
        assert_eq!(
            required_permission(&Method::DELETE, "/api/microservices/abc"),
            Permission::Manage
        );
    }

    #[test]
    fn test_bearer_extraction() {
        let mut h = HeaderMap::new();
        assert_eq!(extract_bearer_token(&h), None);
        h.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&h), Some("abc"));
        h.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&h), None);
    }
}
