use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::manager::ServiceAction;
use crate::middleware::auth::{extract_bearer_token, Actor};
use crate::models::service::ServicePatch;
use crate::pipeline::ServiceSubmission;
use crate::probe::ProbeRequest;
use crate::AppState;

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("service {}", raw)))
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    if body.is_empty() {
        return serde_json::from_value(Value::Object(Default::default()))
            .map_err(|e| AppError::Validation(e.to_string()));
    }
    serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("invalid JSON body: {}", e)))
}

// ── Services ─────────────────────────────────────────────────

pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<Value> {
    let list = state.manager.list().await;
    Json(json!({
        "success": true,
        "count": list.services.len(),
        "reconciled": list.reconciled,
        "microservices": list.services,
    }))
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let service = state.manager.get(parse_id(&id)?).await?;
    Ok(Json(json!({ "success": true, "microservice": service })))
}

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Extension(Actor(actor)): Extension<Actor>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid JSON body: {}", e)))?;
    let submission = ServiceSubmission::from_json(&raw)?;
    let service = state.manager.create(submission, actor).await?;
    Ok(Json(json!({
        "success": true,
        "message": "service created and deployed",
        "microservice": service,
    })))
}

pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Extension(Actor(actor)): Extension<Actor>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let patch: ServicePatch = parse_json(&body)?;
    let service = state.manager.update(id, patch, actor).await?;
    Ok(Json(json!({
        "success": true,
        "message": "service updated",
        "microservice": service,
    })))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let report = state.manager.delete(parse_id(&id)?).await?;
    Ok(Json(json!({
        "success": true,
        "message": "service deleted",
        "warnings": report.failures,
    })))
}

pub async fn service_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let action: ServiceAction = action.parse()?;
    let service = state.manager.action(id, action).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("service {} succeeded", action.as_str()),
        "microservice": service,
    })))
}

pub async fn test_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let service = state.manager.find(parse_id(&id)?).await?;
    let req: ProbeRequest = parse_json(&body)?;
    let resp = state.probe.send(&service.service_name, &req).await?;
    Ok(Json(json!({
        "success": true,
        "status": resp.status,
        "headers": resp.headers,
        "data": resp.data,
    })))
}

// ── Identity relay ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req: LoginRequest = serde_json::from_slice(&body)
        .map_err(|_| AppError::Validation("email and password are required".into()))?;
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(AppError::Validation("email and password are required".into()));
    }
    let outcome = state
        .authorizer
        .provider()
        .login(req.email.trim(), &req.password)
        .await?;
    Ok(Json(json!({
        "success": true,
        "token": outcome.token,
        "data": outcome.data,
    })))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let token = extract_bearer_token(&headers).ok_or(AppError::Unauthorized)?;
    let verification = state.authorizer.provider().verify_token(token).await?;
    match verification.identity {
        Some(identity) if verification.valid => Ok(Json(json!({
            "success": true,
            "valid": true,
            "user": identity.user,
            "role": identity.role,
        }))),
        _ => Err(AppError::Unauthorized),
    }
}
