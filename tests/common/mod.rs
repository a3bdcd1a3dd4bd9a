//! Shared harness: a full router over the in-memory runtime and a temp data dir.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use msgate::auth::roble::RobleIdentityProvider;
use msgate::config::Config;
use msgate::proxy::routes::RouteTarget;
use msgate::runtime::memory::MemoryRuntime;
use msgate::runtime::ContainerRuntime;
use msgate::AppState;

pub struct Harness {
    pub state: Arc<AppState>,
    pub app: Router,
    pub runtime: Arc<MemoryRuntime>,
    pub dir: TempDir,
}

pub fn local_config(dir: &TempDir) -> Config {
    Config::for_local(dir.path().join("microservices.json"), dir.path().join("builds"))
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let cfg = local_config(&dir);
    harness_with(dir, cfg).await
}

pub async fn harness_with(dir: TempDir, cfg: Config) -> Harness {
    harness_on(dir, cfg, Arc::new(MemoryRuntime::new())).await
}

/// Build against an existing runtime, e.g. to simulate a gateway restart.
pub async fn harness_on(dir: TempDir, cfg: Config, runtime: Arc<MemoryRuntime>) -> Harness {
    let identity = Arc::new(RobleIdentityProvider::new(&cfg.auth.base_url, &cfg.auth.contract).unwrap());
    let state = AppState::build(cfg, runtime.clone() as Arc<dyn ContainerRuntime>, identity)
        .await
        .unwrap();
    let app = msgate::router(state.clone());
    Harness {
        state,
        app,
        runtime,
        dir,
    }
}

pub const SUMA_CODE: &str = r#"
const express = require('express');
const app = express();
app.get('/api/suma', (req, res) => {
  const resultado = Number(req.query.num1) + Number(req.query.num2);
  res.json({ success: true, resultado });
});
app.listen(process.env.PORT || 3000);
"#;

pub fn suma_submission() -> Value {
    serde_json::json!({
        "name": "Suma",
        "code": SUMA_CODE,
        "dependencies": ["express"],
        "description": "adds two numbers",
        "endpoints": [{ "method": "GET", "path": "/api/suma", "description": "num1 + num2" }],
    })
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(app: &Router, req: Request<Body>) -> Reply {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Reply {
        status,
        headers,
        body,
    }
}

pub async fn get(app: &Router, uri: &str) -> Reply {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn post_json(app: &Router, uri: &str, body: &Value) -> Reply {
    send(
        app,
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

pub async fn delete(app: &Router, uri: &str) -> Reply {
    send(app, Request::delete(uri).body(Body::empty()).unwrap()).await
}

/// Create a service through the API and return its JSON record.
pub async fn create(app: &Router, submission: &Value) -> Value {
    let reply = post_json(app, "/api/microservices", submission).await;
    assert_eq!(reply.status, StatusCode::OK, "create failed: {}", reply.body);
    reply.body["microservice"].clone()
}

/// Point a service's route at a local address instead of its container.
pub async fn route_to(state: &AppState, service_name: &str, uri: &str) {
    let url = url::Url::parse(uri).unwrap();
    let target = RouteTarget {
        host: url.host_str().unwrap().to_string(),
        port: url.port().unwrap(),
    };
    state.routes.register(service_name, target).await;
}
