use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use super::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};

/// Docker Engine backend built on bollard.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to Docker through `socket_path`, or auto-detect when `None`.
    pub fn connect(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => {
                #[cfg(unix)]
                let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

                #[cfg(windows)]
                let result =
                    Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

                result.map_err(|e| {
                    RuntimeError::Unavailable(format!(
                        "failed to connect to Docker at {}: {}",
                        path, e
                    ))
                })?
            }
            None => Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::Unavailable(format!(
                    "failed to connect to Docker: {} (is the daemon running and the socket readable?)",
                    e
                ))
            })?,
        };

        Ok(Self { docker })
    }

    /// Verify the Docker daemon answers.
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("cannot reach Docker daemon: {}", e)))?;
        Ok(())
    }
}

/// Translate bollard errors into runtime errors, keeping 404 and 304 distinct.
fn map_err(subject: &str, e: DockerError) -> RuntimeError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        } => RuntimeError::NotFound(subject.to_string()),
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        } => RuntimeError::AlreadyRunning(subject.to_string()),
        DockerError::DockerResponseServerError { message, .. }
            if message.contains("already started") =>
        {
            RuntimeError::AlreadyRunning(subject.to_string())
        }
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Operation(format!("{} ({}): {}", subject, status_code, message)),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> Result<(), RuntimeError> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context_tar.into()));

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(err) = info.error {
                        return Err(RuntimeError::BuildFailed(err));
                    }
                    if let Some(line) = info.stream.as_deref().map(str::trim) {
                        if !line.is_empty() {
                            debug!(image = %tag, "{}", line);
                        }
                    }
                }
                Err(e) => return Err(RuntimeError::BuildFailed(e.to_string())),
            }
        }

        info!(image = %tag, "image built");
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    check_duplicate: true,
                    driver: "bridge".to_string(),
                    ..Default::default()
                };
                self.docker
                    .create_network(options)
                    .await
                    .map_err(|e| map_err(name, e))?;
                info!(network = %name, "created service network");
                Ok(())
            }
            Err(e) => Err(map_err(name, e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        // No port bindings: services are only reachable over the internal network.
        let host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", spec.internal_port), HashMap::new());

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let res = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(&spec.name, e))?;

        info!(container = %spec.name, id = %res.id, "container created");
        Ok(res.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn stop_container(&self, id: &str, grace_secs: u32) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace_secs as i64,
                }),
            )
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn restart_container(&self, id: &str, grace_secs: u32) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: grace_secs as isize,
                }),
            )
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(tag, Some(options), None)
            .await
            .map(|_| ())
            .map_err(|e| map_err(tag, e))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err("containers", e))?;

        Ok(summaries
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let state = inspect
                    .state
                    .and_then(|s| s.status)
                    .map(|s| format!("{:?}", s).to_ascii_lowercase())
                    .unwrap_or_default();
                Ok(Some(ContainerInfo {
                    id: inspect.id.unwrap_or_default(),
                    name: inspect
                        .name
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    state,
                }))
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_err(id_or_name, e)),
        }
    }
}
