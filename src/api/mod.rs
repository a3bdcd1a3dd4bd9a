use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::AppState;

pub mod handlers;

/// Build the control API router. Routes are relative; the caller mounts it under `/api`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let services = Router::new()
        .route(
            "/microservices",
            get(handlers::list_services).post(handlers::create_service),
        )
        .route(
            "/microservices/:id",
            get(handlers::get_service)
                .put(handlers::update_service)
                .delete(handlers::delete_service),
        )
        .route("/microservices/:id/test", post(handlers::test_endpoint))
        .route("/microservices/:id/:action", post(handlers::service_action))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::require_permission,
        ));

    Router::new()
        .merge(services)
        .route("/auth/login", post(handlers::login))
        .route("/auth/verify", get(handlers::verify))
        .fallback(fallback_404)
}

async fn fallback_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "route not found", "code": "not_found" })),
    )
}
