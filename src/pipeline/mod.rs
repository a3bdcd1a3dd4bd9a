//! Build pipeline: submission validation, build context synthesis and image builds.
//!
//! Builds run on a bounded pool (one spawned task per build, gated by a
//! semaphore) so forwarding traffic never waits behind an image build.

pub mod context;
pub mod manifest;
pub mod recipe;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::middleware::metrics::METRICS;
use crate::models::service::{scalar_to_string, Endpoint};
use crate::runtime::{ContainerRuntime, RuntimeError};
use context::BuildContext;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to prepare build context: {0}")]
    Context(#[from] std::io::Error),

    #[error("failed to render manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("build exceeded {0}s")]
    Timeout(u64),

    #[error("build worker failed: {0}")]
    Worker(String),
}

/// Rejected submission. Raised before any side effect.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Validated creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSubmission {
    pub name: String,
    pub code: String,
    pub dependencies: Vec<String>,
    pub base_image: Option<String>,
    pub description: String,
    pub env: BTreeMap<String, String>,
    pub endpoints: Vec<Endpoint>,
}

impl ServiceSubmission {
    /// Validate a raw JSON body.
    pub fn from_json(body: &Value) -> Result<Self, ValidationError> {
        let obj = body
            .as_object()
            .ok_or_else(|| ValidationError("request body must be a JSON object".into()))?;

        let name = required_str(obj.get("name"), "name")?;
        let code = required_str(obj.get("code"), "code")?;

        let dependencies = match obj.get("dependencies") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ValidationError("dependencies must be a list of package names".into())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(ValidationError("dependencies must be an array".into())),
            None => return Err(ValidationError("dependencies is required".into())),
        };

        let base_image = optional_str(obj.get("baseImage"), "baseImage")?
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string());
        let description = optional_str(obj.get("description"), "description")?.unwrap_or_default();

        let env = match obj.get("env") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    scalar_to_string(v).map(|s| (k.clone(), s)).ok_or_else(|| {
                        ValidationError(format!("env value for '{}' must be a scalar", k))
                    })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?,
            Some(_) => return Err(ValidationError("env must be an object".into())),
        };

        let endpoints = match obj.get("endpoints") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value::<Vec<Endpoint>>(v.clone())
                .map_err(|e| ValidationError(format!("invalid endpoints: {}", e)))?,
        };

        Ok(Self {
            name,
            code,
            dependencies,
            base_image,
            description,
            env,
            endpoints,
        })
    }
}

fn required_str(v: Option<&Value>, field: &str) -> Result<String, ValidationError> {
    match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(ValidationError(format!("{} is required", field))),
    }
}

fn optional_str(v: Option<&Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError(format!("{} must be a string", field))),
    }
}

/// Everything one image build needs.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Image tag and scratch directory name.
    pub container_name: String,
    pub base_image: String,
    pub dependencies: Vec<String>,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub image_tag: String,
    pub context_dir: PathBuf,
}

pub struct BuildPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    build_root: PathBuf,
    internal_port: u16,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl BuildPipeline {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        build_root: PathBuf,
        internal_port: u16,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            build_root,
            internal_port,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn build_root(&self) -> &std::path::Path {
        &self.build_root
    }

    /// Synthesize the context, write it to the scratch directory and build the image.
    ///
    /// On failure the scratch directory is left behind.
    pub async fn build(&self, req: BuildRequest) -> Result<BuildArtifact, BuildError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BuildError::Worker("build pool closed".into()))?;

        let runtime = self.runtime.clone();
        let build_root = self.build_root.clone();
        let internal_port = self.internal_port;
        let tag = req.container_name.clone();

        let started = Instant::now();
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            let manifest = manifest::render(&req.container_name, &req.dependencies);
            let recipe = recipe::render(&req.base_image, internal_port);
            let ctx = BuildContext::new(&manifest, &req.code, recipe)?;
            let context_dir = ctx.write_to(&build_root, &req.container_name).await?;
            let archive = ctx.to_tar()?;
            tracing::info!(
                image = %req.container_name,
                base_image = %req.base_image,
                bytes = archive.len(),
                "building image"
            );
            runtime.build_image(&req.container_name, archive).await?;
            Ok::<_, BuildError>(BuildArtifact {
                image_tag: req.container_name,
                context_dir,
            })
        });

        let result = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BuildError::Worker(join_err.to_string())),
            Err(_) => {
                handle.abort();
                Err(BuildError::Timeout(self.timeout.as_secs()))
            }
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                METRICS.record_build("success", elapsed);
                tracing::info!(image = %tag, elapsed_ms = elapsed.as_millis() as u64, "image build finished");
            }
            Err(BuildError::Timeout(_)) => {
                METRICS.record_build("timeout", elapsed);
                tracing::error!(image = %tag, "image build timed out");
            }
            Err(e) => {
                METRICS.record_build("failure", elapsed);
                tracing::error!(image = %tag, error = %e, "image build failed");
            }
        }
        result
    }
}
