//! msgate: build, run and route single-file microservices behind one gateway.
//!
//! The binary in `main.rs` wires these modules together; integration tests in
//! `tests/` drive the same router against the in-memory container runtime.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod lifecycle;
pub mod manager;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod store;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use auth::{Authorizer, IdentityProvider};
use config::Config;
use lifecycle::{ContainerLifecycleController, LifecycleSettings};
use manager::ServiceManager;
use pipeline::BuildPipeline;
use probe::RequestProbe;
use proxy::routes::RouteTable;
use proxy::upstream::UpstreamClient;
use registry::ServiceRegistry;
use runtime::ContainerRuntime;
use store::file_store::JsonFileStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<ServiceManager>,
    pub routes: RouteTable,
    pub upstream: UpstreamClient,
    pub authorizer: Authorizer,
    pub probe: RequestProbe,
}

impl AppState {
    /// Open the registry, wire every component and restore routes of services
    /// last stored as running.
    pub async fn build(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        identity: Arc<dyn IdentityProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(ServiceRegistry::open(JsonFileStore::new(&config.data_file)).await);
        let routes = RouteTable::new();

        let pipeline = BuildPipeline::new(
            runtime.clone(),
            config.build_root.clone(),
            config.internal_port,
            config.build_concurrency,
            config.build_timeout(),
        );
        let lifecycle =
            ContainerLifecycleController::new(runtime, LifecycleSettings::from_config(&config));
        let manager = Arc::new(ServiceManager::new(
            registry,
            lifecycle,
            pipeline,
            routes.clone(),
            &config.public_base_url,
            &config.default_base_image,
        ));
        manager.restore_routes().await;

        let upstream = UpstreamClient::new(config.forward_timeout(), config.forward_retries)?;
        let probe = RequestProbe::new(&config.self_base_url, config.forward_timeout())?;
        let authorizer = Authorizer::new(identity, &config.auth);

        Ok(Arc::new(Self {
            config,
            manager,
            routes,
            upstream,
            authorizer,
            probe,
        }))
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "service": "msgate",
        "microservicesCount": state.manager.registry().len().await,
        "routes": state.routes.len().await,
    }))
}

async fn metrics_handler() -> String {
    middleware::metrics::encode_metrics()
}

/// The full HTTP surface: control API, health, metrics and the service gateway.
pub fn router(state: Arc<AppState>) -> Router {
    let control = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api::api_router(state.clone()))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    // Mounted once; the handler consults the live route table per request.
    let gateway = Router::new()
        .route("/services/:name", any(proxy::handler::gateway_handler))
        .route("/services/:name/", any(proxy::handler::gateway_handler))
        .route("/services/:name/*rest", any(proxy::handler::gateway_handler));

    let dashboard_origin = state.config.dashboard_origin.clone();

    Router::new()
        .merge(control)
        .merge(gateway)
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == dashboard_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true)
        })
        .layer(axum::middleware::from_fn(request_id_middleware))
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers for the control plane. Gateway responses keep
/// whatever the service sent.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::http::HeaderValue;

    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");
    resp
}
