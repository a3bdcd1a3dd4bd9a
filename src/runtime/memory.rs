//! In-process container runtime.
//!
//! Keeps images and containers in memory and follows Docker's observable
//! semantics for the operations the gateway uses (already-started signal,
//! 404 on unknown ids, forced removal). Selected with `MSGATE_RUNTIME=memory`
//! and used as the fake runtime in tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub info: ContainerInfo,
    pub spec: ContainerSpec,
}

#[derive(Default)]
struct MemoryState {
    images: HashSet<String>,
    networks: HashSet<String>,
    containers: Vec<MemoryContainer>,
    build_failure: Option<String>,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent build fail with `message`.
    pub fn fail_builds_with(&self, message: impl Into<String>) {
        self.lock().build_failure = Some(message.into());
    }

    /// Delay every operation, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Drop a container behind the gateway's back, like `docker rm -f` from a shell.
    pub fn remove_out_of_band(&self, id_or_name: &str) -> bool {
        let mut state = self.lock();
        let before = state.containers.len();
        state
            .containers
            .retain(|c| !(c.info.name == id_or_name || c.info.matches_id(id_or_name)));
        before != state.containers.len()
    }

    /// Force a container into a state, like a crash would.
    pub fn set_state(&self, id_or_name: &str, new_state: &str) {
        let mut state = self.lock();
        if let Some(c) = find_mut(&mut state.containers, id_or_name) {
            c.info.state = new_state.to_string();
        }
    }

    pub fn containers(&self) -> Vec<MemoryContainer> {
        self.lock().containers.clone()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.lock().images.contains(tag)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-operation; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

fn find_mut<'a>(
    containers: &'a mut [MemoryContainer],
    id_or_name: &str,
) -> Option<&'a mut MemoryContainer> {
    containers
        .iter_mut()
        .find(|c| c.info.name == id_or_name || c.info.matches_id(id_or_name))
}

fn new_container_id() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> Result<(), RuntimeError> {
        self.pause().await;
        let mut state = self.lock();
        if let Some(msg) = &state.build_failure {
            return Err(RuntimeError::BuildFailed(msg.clone()));
        }
        if context_tar.is_empty() {
            return Err(RuntimeError::BuildFailed("empty build context".to_string()));
        }
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.pause().await;
        let mut state = self.lock();
        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("image {}", spec.image)));
        }
        if !state.networks.contains(&spec.network) {
            return Err(RuntimeError::NotFound(format!("network {}", spec.network)));
        }
        if state.containers.iter().any(|c| c.info.name == spec.name) {
            return Err(RuntimeError::Operation(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        let id = new_container_id();
        state.containers.push(MemoryContainer {
            info: ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                state: "created".to_string(),
            },
            spec: spec.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.pause().await;
        let mut state = self.lock();
        let c = find_mut(&mut state.containers, id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if c.info.state == "running" {
            return Err(RuntimeError::AlreadyRunning(id.to_string()));
        }
        c.info.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace_secs: u32) -> Result<(), RuntimeError> {
        self.pause().await;
        let mut state = self.lock();
        let c = find_mut(&mut state.containers, id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.info.state = "exited".to_string();
        Ok(())
    }

    async fn restart_container(&self, id: &str, _grace_secs: u32) -> Result<(), RuntimeError> {
        self.pause().await;
        let mut state = self.lock();
        let c = find_mut(&mut state.containers, id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.info.state = "running".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.remove_out_of_band(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        if self.lock().images.remove(tag) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("image {}", tag)))
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.pause().await;
        Ok(self.lock().containers.iter().map(|c| c.info.clone()).collect())
    }

    async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> Result<Option<ContainerInfo>, RuntimeError> {
        let mut state = self.lock();
        Ok(find_mut(&mut state.containers, id_or_name).map(|c| c.info.clone()))
    }
}
