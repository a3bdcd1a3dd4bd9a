//! Container lifecycle: create/start, stop, restart, teardown and reconciliation.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::middleware::metrics::METRICS;
use crate::models::service::{Service, ServiceStatus};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{operation} did not finish within {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub network: String,
    pub internal_port: u16,
    pub collaborator_base_url: String,
    pub collaborator_project_id: String,
    pub stop_grace_secs: u32,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub restart_timeout: Duration,
    pub build_root: PathBuf,
}

impl LifecycleSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            network: cfg.network.clone(),
            internal_port: cfg.internal_port,
            collaborator_base_url: cfg.collaborator_base_url.clone(),
            collaborator_project_id: cfg.collaborator_project_id.clone(),
            stop_grace_secs: cfg.stop_grace_secs,
            start_timeout: cfg.start_timeout(),
            stop_timeout: cfg.stop_timeout(),
            restart_timeout: cfg.restart_timeout(),
            build_root: cfg.build_root.clone(),
        }
    }
}

/// Failures collected during a best-effort teardown.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TeardownReport {
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, err: impl std::fmt::Display) {
        tracing::warn!(step, error = %err, "teardown step failed");
        self.failures.push(format!("{}: {}", step, err));
    }
}

/// What the runtime says about one stored service.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: ServiceStatus,
    /// Runtime id of the matched container, if any.
    pub container_id: Option<String>,
}

/// Environment for a service container as `KEY=VALUE` pairs.
///
/// Defaults come first in fixed order; a user key with the same name replaces
/// the default value in place. Remaining user keys follow in sorted order.
pub fn container_env(service: &Service, settings: &LifecycleSettings) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = vec![
        ("SERVICE_NAME".into(), service.name.clone()),
        ("PORT".into(), settings.internal_port.to_string()),
        ("ROBLE_BASE_URL".into(), settings.collaborator_base_url.clone()),
        ("ROBLE_PROJECT_ID".into(), settings.collaborator_project_id.clone()),
    ];

    for (key, value) in &service.env {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }

    pairs.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Match a stored service against the runtime's container list.
pub fn observe(containers: &[ContainerInfo], service: &Service) -> Observation {
    let found = match service.container_id.as_deref() {
        Some(id) if !id.is_empty() => containers.iter().find(|c| c.matches_id(id)),
        // created but never recorded (e.g. start timed out)
        _ => containers.iter().find(|c| c.name == service.container_name),
    };

    match found {
        Some(c) => Observation {
            status: ServiceStatus::from_container_state(&c.state),
            container_id: Some(c.id.clone()),
        },
        None => Observation {
            status: ServiceStatus::Stopped,
            container_id: service.container_id.clone(),
        },
    }
}

pub struct ContainerLifecycleController {
    runtime: Arc<dyn ContainerRuntime>,
    settings: LifecycleSettings,
}

impl ContainerLifecycleController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: LifecycleSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        limit: Duration,
        fut: F,
    ) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, LifecycleError>>,
    {
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(LifecycleError::Timeout {
                operation,
                secs: limit.as_secs(),
            }),
        };
        METRICS.record_lifecycle(operation, result.is_ok());
        result
    }

    /// Resolve the container backing `service`, by stored id first, then by name.
    async fn locate(&self, service: &Service) -> Result<Option<ContainerInfo>, RuntimeError> {
        if let Some(id) = service.container_id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(info) = self.runtime.inspect_container(id).await? {
                return Ok(Some(info));
            }
        }
        self.runtime.inspect_container(&service.container_name).await
    }

    /// Create the container when missing, then start it. Returns the container id.
    ///
    /// A container that is already running counts as started.
    pub async fn start(&self, service: &Service) -> Result<String, LifecycleError> {
        self.bounded("start", self.settings.start_timeout, async {
            let id = match self.locate(service).await? {
                Some(existing) => existing.id,
                None => {
                    self.runtime.ensure_network(&self.settings.network).await?;
                    let spec = ContainerSpec {
                        name: service.container_name.clone(),
                        image: service.container_name.clone(),
                        network: self.settings.network.clone(),
                        internal_port: self.settings.internal_port,
                        env: container_env(service, &self.settings),
                    };
                    self.runtime.create_container(&spec).await?
                }
            };

            match self.runtime.start_container(&id).await {
                Ok(()) => {
                    tracing::info!(service = %service.service_name, container_id = %id, "container started");
                }
                Err(RuntimeError::AlreadyRunning(_)) => {
                    tracing::debug!(service = %service.service_name, "container already running");
                }
                Err(e) => return Err(e.into()),
            }
            Ok::<_, LifecycleError>(id)
        })
        .await
    }

    fn require_container_id<'a>(&self, service: &'a Service) -> Result<&'a str, LifecycleError> {
        service
            .container_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("container for {}", service.service_name)).into()
            })
    }

    pub async fn stop(&self, service: &Service) -> Result<ServiceStatus, LifecycleError> {
        let id = self.require_container_id(service)?;
        self.bounded("stop", self.settings.stop_timeout, async {
            match self
                .runtime
                .stop_container(id, self.settings.stop_grace_secs)
                .await
            {
                // 304 on stop: already stopped
                Ok(()) | Err(RuntimeError::AlreadyRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(service = %service.service_name, "container stopped");
            Ok::<_, LifecycleError>(ServiceStatus::Exited)
        })
        .await
    }

    pub async fn restart(&self, service: &Service) -> Result<ServiceStatus, LifecycleError> {
        let id = self.require_container_id(service)?;
        self.bounded("restart", self.settings.restart_timeout, async {
            self.runtime
                .restart_container(id, self.settings.stop_grace_secs)
                .await?;
            tracing::info!(service = %service.service_name, "container restarted");
            Ok::<_, LifecycleError>(ServiceStatus::Running)
        })
        .await
    }

    /// Best-effort teardown: stop, remove container, remove image, remove scratch dir.
    ///
    /// Never fails; anything that went wrong is in the report.
    pub async fn remove(&self, service: &Service) -> TeardownReport {
        let mut report = TeardownReport::default();

        let target = service
            .container_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| service.container_name.clone());

        let stop = tokio::time::timeout(
            self.settings.stop_timeout,
            self.runtime.stop_container(&target, self.settings.stop_grace_secs),
        )
        .await;
        match stop {
            Ok(Ok(()))
            | Ok(Err(RuntimeError::NotFound(_)))
            | Ok(Err(RuntimeError::AlreadyRunning(_))) => {}
            Ok(Err(e)) => report.record("stop container", e),
            Err(_) => report.record("stop container", "timed out"),
        }

        match self.runtime.remove_container(&target).await {
            Ok(()) => tracing::debug!(container = %target, "container removed"),
            Err(RuntimeError::NotFound(_)) => {
                tracing::debug!(container = %target, "container already gone")
            }
            Err(e) => report.record("remove container", e),
        }

        match self.runtime.remove_image(&service.container_name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => report.record("remove image", e),
        }

        let scratch = self.settings.build_root.join(&service.container_name);
        match tokio::fs::remove_dir_all(&scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => report.record("remove build context", e),
        }

        METRICS.record_lifecycle("remove", report.is_clean());
        report
    }

    /// Observe every service against a single container listing.
    pub async fn reconcile(&self, services: &[Service]) -> Result<Vec<Observation>, LifecycleError> {
        let containers = self.runtime.list_containers().await?;
        Ok(services.iter().map(|s| observe(&containers, s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::MemoryRuntime;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn settings(root: PathBuf) -> LifecycleSettings {
        LifecycleSettings {
            network: "microservices-network".into(),
            internal_port: 3000,
            collaborator_base_url: "https://roble.example".into(),
            collaborator_project_id: "proj_1".into(),
            stop_grace_secs: 1,
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(5),
            build_root: root,
        }
    }

    fn service(env: BTreeMap<String, String>) -> Service {
        Service {
            id: Uuid::new_v4(),
            name: "Suma".into(),
            service_name: "suma-12345678".into(),
            container_name: "ms-suma-12345678".into(),
            container_id: None,
            status: ServiceStatus::Pending,
            url: None,
            description: String::new(),
            endpoints: vec![],
            env,
            base_image: "node:18-alpine".into(),
            dependencies: vec![],
            created_at: Utc::now(),
            created_by: None,
            updated_at: None,
            updated_by: None,
        }
    }

    #[test]
    fn test_user_env_overrides_default_once() {
        let svc = service(BTreeMap::from([
            ("ROBLE_PROJECT_ID".to_string(), "mine".to_string()),
            ("ZED".to_string(), "1".to_string()),
            ("ALPHA".to_string(), "2".to_string()),
        ]));
        let env = container_env(&svc, &settings("tmp".into()));
        assert_eq!(
            env,
            vec![
                "SERVICE_NAME=Suma",
                "PORT=3000",
                "ROBLE_BASE_URL=https://roble.example",
                "ROBLE_PROJECT_ID=mine",
                "ALPHA=2",
                "ZED=1",
            ]
        );
    }

    #[test]
    fn test_observe_missing_container_is_stopped() {
        let mut svc = service(BTreeMap::new());
        svc.container_id = Some("deadbeef".into());
        let obs = observe(&[], &svc);
        assert_eq!(obs.status, ServiceStatus::Stopped);
    }

    #[test]
    fn test_observe_matches_short_id() {
        let mut svc = service(BTreeMap::new());
        svc.container_id = Some("abcdef1234567890abcdef".into());
        let containers = vec![ContainerInfo {
            id: "abcdef123456".into(),
            name: "other-name".into(),
            state: "exited".into(),
        }];
        assert_eq!(observe(&containers, &svc).status, ServiceStatus::Exited);
    }

    async fn ready_runtime(svc: &Service) -> Arc<MemoryRuntime> {
        let rt = Arc::new(MemoryRuntime::new());
        rt.build_image(&svc.container_name, vec![1]).await.unwrap();
        rt
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut svc = service(BTreeMap::new());
        let rt = ready_runtime(&svc).await;
        let ctl = ContainerLifecycleController::new(rt.clone(), settings("tmp".into()));

        let id = ctl.start(&svc).await.unwrap();
        svc.container_id = Some(id.clone());
        let again = ctl.start(&svc).await.unwrap();
        assert_eq!(id, again);
        assert!(rt.has_network("microservices-network"));
        assert_eq!(rt.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_then_restart() {
        let mut svc = service(BTreeMap::new());
        let rt = ready_runtime(&svc).await;
        let ctl = ContainerLifecycleController::new(rt.clone(), settings("tmp".into()));
        svc.container_id = Some(ctl.start(&svc).await.unwrap());

        assert_eq!(ctl.stop(&svc).await.unwrap(), ServiceStatus::Exited);
        assert_eq!(ctl.restart(&svc).await.unwrap(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_without_container_is_not_found() {
        let svc = service(BTreeMap::new());
        let ctl = ContainerLifecycleController::new(
            Arc::new(MemoryRuntime::new()),
            settings("tmp".into()),
        );
        let err = ctl.stop(&svc).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let svc = service(BTreeMap::new());
        let rt = ready_runtime(&svc).await;
        rt.set_delay(Some(Duration::from_secs(5)));
        let mut s = settings("tmp".into());
        s.start_timeout = Duration::from_millis(50);
        let ctl = ContainerLifecycleController::new(rt, s);

        let err = ctl.start(&svc).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { operation: "start", .. }));
    }

    #[tokio::test]
    async fn test_remove_after_out_of_band_delete_is_clean() {
        let root = tempfile::tempdir().unwrap();
        let mut svc = service(BTreeMap::new());
        let rt = ready_runtime(&svc).await;
        let ctl = ContainerLifecycleController::new(rt.clone(), settings(root.path().into()));
        svc.container_id = Some(ctl.start(&svc).await.unwrap());
        std::fs::create_dir_all(root.path().join(&svc.container_name)).unwrap();

        assert!(rt.remove_out_of_band(&svc.container_name));
        let report = ctl.remove(&svc).await;
        assert!(report.is_clean(), "{:?}", report);
        assert!(!rt.has_image(&svc.container_name));
        assert!(!root.path().join(&svc.container_name).exists());
    }

    #[tokio::test]
    async fn test_reconcile_reports_each_service() {
        let mut svc = service(BTreeMap::new());
        let rt = ready_runtime(&svc).await;
        let ctl = ContainerLifecycleController::new(rt.clone(), settings("tmp".into()));
        svc.container_id = Some(ctl.start(&svc).await.unwrap());

        let obs = ctl.reconcile(std::slice::from_ref(&svc)).await.unwrap();
        assert_eq!(obs[0].status, ServiceStatus::Running);

        rt.set_state(&svc.container_name, "exited");
        let obs = ctl.reconcile(std::slice::from_ref(&svc)).await.unwrap();
        assert_eq!(obs[0].status, ServiceStatus::Exited);
    }
}
