use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Length of the id prefix appended to the slug in `service_name`.
pub const ID_PREFIX_LEN: usize = 8;

/// Prefix for container names, image tags and scratch build directories.
pub const CONTAINER_PREFIX: &str = "ms-";

/// Status as last reconciled against the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Exited,
    Stopped,
    Pending,
    Error,
}

impl ServiceStatus {
    /// Map a runtime container state string (`running`, `exited`, ...) to a status.
    pub fn from_container_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => ServiceStatus::Running,
            "exited" => ServiceStatus::Exited,
            "created" | "restarting" => ServiceStatus::Pending,
            "paused" | "removing" => ServiceStatus::Stopped,
            _ => ServiceStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Exited => "exited",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Pending => "pending",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-declared endpoint. Informational only; the gateway does not enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_auth: bool,
}

/// A deployed (or once-deployed) microservice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub service_name: String,
    pub container_name: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub base_image: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl Service {
    /// Gateway URL for a service name under the given public base URL.
    pub fn gateway_url(public_base_url: &str, service_name: &str) -> String {
        format!(
            "{}/services/{}",
            public_base_url.trim_end_matches('/'),
            service_name
        )
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}

/// Partial update accepted by `PUT /api/microservices/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "scalar_env")]
    pub env: Option<BTreeMap<String, String>>,
}

/// Env values arrive as JSON scalars; numbers and booleans are stored in their text form.
fn scalar_env<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    raw.map(|map| {
        map.into_iter()
            .map(|(k, v)| match scalar_to_string(&v) {
                Some(s) => Ok((k, s)),
                None => Err(D::Error::custom(format!(
                    "env value for '{}' must be a string, number or boolean",
                    k
                ))),
            })
            .collect()
    })
    .transpose()
}

/// Text form of a JSON scalar, as written into a container's environment.
pub fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ServicePatch {
    /// Apply the patch: replace name/description when non-empty, shallow-merge env.
    pub fn apply(&self, service: &mut Service, actor: Option<String>) {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            service.name = name.to_string();
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            service.description = description.to_string();
        }
        if let Some(env) = &self.env {
            for (k, v) in env {
                service.env.insert(k.clone(), v.clone());
            }
        }
        service.updated_at = Some(Utc::now());
        service.updated_by = actor;
    }
}

/// URL-safe slug of a display name: lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "service".to_string()
    } else {
        slug
    }
}

/// `{slug}-{first 8 chars of id}`.
pub fn derive_service_name(name: &str, id: &Uuid) -> String {
    let id = id.to_string();
    format!("{}-{}", slugify(name), &id[..ID_PREFIX_LEN])
}

pub fn derive_container_name(service_name: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, service_name)
}
