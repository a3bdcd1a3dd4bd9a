//! Container runtime capability.
//!
//! The lifecycle controller and the build pipeline only talk to containers
//! through [`ContainerRuntime`]. `docker` is the production backend (bollard);
//! `memory` is an in-process backend used for Docker-less development and tests.

pub mod docker;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a container runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The runtime refused to start a container that is already started.
    #[error("container {0} is already running")]
    AlreadyRunning(String),

    #[error("runtime operation failed: {0}")]
    Operation(String),
}

/// Everything needed to create one service container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub internal_port: u16,
    /// `KEY=VALUE` pairs, one per key.
    pub env: Vec<String>,
}

/// Minimal view of a container as returned by the runtime's list operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Runtime state string (`running`, `exited`, `created`, ...).
    pub state: String,
}

impl ContainerInfo {
    /// True when `stored_id` names this container, in either short or long form.
    pub fn matches_id(&self, stored_id: &str) -> bool {
        if stored_id.is_empty() || self.id.is_empty() {
            return false;
        }
        self.id == stored_id || self.id.starts_with(stored_id) || stored_id.starts_with(&self.id)
    }
}

/// Abstraction over container runtimes (Docker, in-memory).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image tagged `tag` from a tar archive of the build context.
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> Result<(), RuntimeError>;

    /// Make sure the internal service network exists.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create a container (not started). Returns the runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a container. Starting a running container yields `AlreadyRunning`.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, grace_secs: u32) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str, grace_secs: u32) -> Result<(), RuntimeError>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;

    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Look up one container by id or name.
    async fn inspect_container(&self, id_or_name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;
}
