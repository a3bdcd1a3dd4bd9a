//! ServiceManager: the control flows that tie the build pipeline, the
//! lifecycle controller, the route table and the registry together.
//!
//! Operations on one service (update, start, stop, restart, delete) are
//! serialized by a per-service lock; different services proceed in parallel.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::lifecycle::{ContainerLifecycleController, LifecycleError, Observation, TeardownReport};
use crate::models::service::{
    derive_container_name, derive_service_name, Service, ServicePatch, ServiceStatus,
};
use crate::pipeline::{BuildPipeline, BuildRequest, ServiceSubmission, ValidationError};
use crate::proxy::routes::{RouteTable, RouteTarget};
use crate::registry::{ServiceRegistry, StatusUpdate, Versioned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

impl FromStr for ServiceAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(ValidationError(format!(
                "unknown action '{}' (expected start, stop or restart)",
                other
            ))),
        }
    }
}

/// Result of a listing. `reconciled` is false when the runtime could not be queried
/// and the stored statuses were returned as-is.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceList {
    pub services: Vec<Service>,
    pub reconciled: bool,
}

pub struct ServiceManager {
    registry: Arc<ServiceRegistry>,
    lifecycle: ContainerLifecycleController,
    pipeline: BuildPipeline,
    routes: RouteTable,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    public_base_url: String,
    internal_port: u16,
    default_base_image: String,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        lifecycle: ContainerLifecycleController,
        pipeline: BuildPipeline,
        routes: RouteTable,
        public_base_url: &str,
        default_base_image: &str,
    ) -> Self {
        let internal_port = lifecycle.settings().internal_port;
        Self {
            registry,
            lifecycle,
            pipeline,
            routes,
            locks: DashMap::new(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            internal_port,
            default_base_image: default_base_image.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn target_for(&self, service: &Service) -> RouteTarget {
        RouteTarget::for_container(&service.container_name, self.internal_port)
    }

    fn url_for(&self, service: &Service) -> String {
        Service::gateway_url(&self.public_base_url, &service.service_name)
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    async fn find_locked(&self, id: Uuid) -> Result<Service, AppError> {
        match self.registry.get(id).await {
            Some(s) => Ok(s),
            None => {
                self.locks.remove(&id);
                Err(AppError::NotFound(format!("service {}", id)))
            }
        }
    }

    /// Build, start, route and persist a new service.
    pub async fn create(
        &self,
        submission: ServiceSubmission,
        actor: Option<String>,
    ) -> Result<Service, AppError> {
        let id = Uuid::new_v4();
        let service_name = derive_service_name(&submission.name, &id);
        let container_name = derive_container_name(&service_name);
        let base_image = submission
            .base_image
            .clone()
            .unwrap_or_else(|| self.default_base_image.clone());

        tracing::info!(%id, service = %service_name, "creating service");

        self.pipeline
            .build(BuildRequest {
                container_name: container_name.clone(),
                base_image: base_image.clone(),
                dependencies: submission.dependencies.clone(),
                code: submission.code,
            })
            .await?;

        let mut service = Service {
            id,
            name: submission.name,
            service_name,
            container_name,
            container_id: None,
            status: ServiceStatus::Pending,
            url: None,
            description: submission.description,
            endpoints: submission.endpoints,
            env: submission.env,
            base_image,
            dependencies: submission.dependencies,
            created_at: Utc::now(),
            created_by: actor,
            updated_at: None,
            updated_by: None,
        };

        match self.lifecycle.start(&service).await {
            Ok(container_id) => {
                service.container_id = Some(container_id);
                service.status = ServiceStatus::Running;
                service.url = Some(self.url_for(&service));
            }
            Err(e @ LifecycleError::Timeout { .. }) => {
                service.status = ServiceStatus::Error;
                self.registry.insert(service).await?;
                return Err(e.into());
            }
            Err(e) => {
                let report = self.lifecycle.remove(&service).await;
                if !report.is_clean() {
                    tracing::warn!(service = %service.service_name, failures = ?report.failures, "cleanup after failed start was incomplete");
                }
                return Err(e.into());
            }
        }

        // Record first, route second, both under the service lock: a
        // concurrent reconciliation either skips the id or sees both.
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        if let Err(e) = self.registry.insert(service.clone()).await {
            self.locks.remove(&id);
            return Err(e.into());
        }
        self.routes
            .register(&service.service_name, self.target_for(&service))
            .await;

        tracing::info!(%id, service = %service.service_name, url = ?service.url, "service deployed");
        Ok(service)
    }

    /// Drop routes whose record is gone. The route table is read before the
    /// registry, and records are inserted before their route, so a route of a
    /// service being created is never mistaken for an orphan.
    async fn drop_orphan_routes(&self) {
        let routed = self.routes.list().await;
        if routed.is_empty() {
            return;
        }
        let known: HashSet<String> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.service_name)
            .collect();
        for (name, _) in routed {
            if !known.contains(&name) {
                self.routes.unregister(&name).await;
            }
        }
    }

    /// Make one route agree with its record. Call with the service lock held.
    async fn sync_route(&self, service: &Service) {
        if service.is_running() {
            if self.routes.lookup(&service.service_name).await.is_none() {
                self.routes
                    .register(&service.service_name, self.target_for(service))
                    .await;
            }
        } else {
            self.routes.unregister(&service.service_name).await;
        }
    }

    fn status_update(&self, seen: &Versioned, obs: Observation) -> StatusUpdate {
        let url = (obs.status == ServiceStatus::Running).then(|| self.url_for(&seen.service));
        StatusUpdate {
            id: seen.service.id,
            revision: seen.revision,
            status: obs.status,
            container_id: obs.container_id,
            url,
        }
    }

    /// All services, reconciled against the runtime.
    ///
    /// A service with an operation in flight keeps its stored status; the
    /// operation commits the authoritative one. Observations are committed
    /// only against the revision they were taken at.
    pub async fn list(&self) -> ServiceList {
        let snapshot = self.registry.versioned_snapshot().await;
        let services: Vec<Service> = snapshot.iter().map(|v| v.service.clone()).collect();
        let observations = match self.lifecycle.reconcile(&services).await {
            Ok(observations) => observations,
            Err(e) => {
                tracing::warn!(error = %e, "runtime unavailable, returning stored statuses");
                return ServiceList {
                    services,
                    reconciled: false,
                };
            }
        };

        let mut guards = Vec::with_capacity(snapshot.len());
        let mut updates = Vec::with_capacity(snapshot.len());
        for (seen, obs) in snapshot.iter().zip(observations) {
            let Ok(guard) = self.lock_for(seen.service.id).try_lock_owned() else {
                tracing::debug!(service = %seen.service.service_name, "operation in flight, skipping");
                continue;
            };
            guards.push(guard);
            updates.push(self.status_update(seen, obs));
        }

        let services = self.registry.record_statuses(&updates).await;
        for update in &updates {
            match services.iter().find(|s| s.id == update.id) {
                Some(current) => self.sync_route(current).await,
                None => {
                    self.locks.remove(&update.id);
                }
            }
        }
        self.drop_orphan_routes().await;
        drop(guards);

        ServiceList {
            services,
            reconciled: true,
        }
    }

    /// One service, reconciled against the runtime. Returns the stored record
    /// while another operation on the service is in flight.
    pub async fn get(&self, id: Uuid) -> Result<Service, AppError> {
        let lock = self.lock_for(id);
        let Ok(_guard) = lock.try_lock() else {
            return self.find(id).await;
        };
        let Some(seen) = self.registry.get_versioned(id).await else {
            self.locks.remove(&id);
            return Err(AppError::NotFound(format!("service {}", id)));
        };

        let mut observations = match self
            .lifecycle
            .reconcile(std::slice::from_ref(&seen.service))
            .await
        {
            Ok(obs) => obs,
            Err(e) => {
                tracing::warn!(error = %e, "runtime unavailable, returning stored status");
                return Ok(seen.service);
            }
        };
        let Some(obs) = observations.pop() else {
            return Ok(seen.service);
        };
        let update = self.status_update(&seen, obs);
        let services = self.registry.record_statuses(&[update]).await;
        let Some(current) = services.into_iter().find(|s| s.id == id) else {
            return Err(AppError::NotFound(format!("service {}", id)));
        };
        self.sync_route(&current).await;
        Ok(current)
    }

    /// Stored record, without reconciliation.
    pub async fn find(&self, id: Uuid) -> Result<Service, AppError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("service {}", id)))
    }

    /// Metadata update. Does not rebuild or restart the container.
    pub async fn update(
        &self,
        id: Uuid,
        patch: ServicePatch,
        actor: Option<String>,
    ) -> Result<Service, AppError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.find_locked(id).await?;

        self.registry
            .update(id, |s| patch.apply(s, actor))
            .await
            .ok_or_else(|| AppError::NotFound(format!("service {}", id)))
    }

    pub async fn action(&self, id: Uuid, action: ServiceAction) -> Result<Service, AppError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let service = self.find_locked(id).await?;

        tracing::info!(%id, service = %service.service_name, action = action.as_str(), "lifecycle action");

        let outcome = match action {
            ServiceAction::Start => self
                .lifecycle
                .start(&service)
                .await
                .map(|cid| (ServiceStatus::Running, Some(cid))),
            ServiceAction::Stop => self
                .lifecycle
                .stop(&service)
                .await
                .map(|status| (status, service.container_id.clone())),
            ServiceAction::Restart => self
                .lifecycle
                .restart(&service)
                .await
                .map(|status| (status, service.container_id.clone())),
        };

        let (status, container_id) = match outcome {
            Ok(v) => v,
            Err(e @ LifecycleError::Timeout { .. }) => {
                self.registry
                    .update(id, |s| {
                        s.status = ServiceStatus::Error;
                        s.url = None;
                    })
                    .await;
                self.routes.unregister(&service.service_name).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let url = (status == ServiceStatus::Running).then(|| self.url_for(&service));
        let updated = self
            .registry
            .update(id, |s| {
                s.status = status;
                s.container_id = container_id;
                s.url = url;
            })
            .await
            .ok_or_else(|| AppError::NotFound(format!("service {}", id)))?;

        if updated.is_running() {
            self.routes
                .register(&updated.service_name, self.target_for(&updated))
                .await;
        } else {
            self.routes.unregister(&updated.service_name).await;
        }
        Ok(updated)
    }

    /// Best-effort teardown, then removal of route and record. Teardown
    /// failures are reported but never block the removal.
    pub async fn delete(&self, id: Uuid) -> Result<TeardownReport, AppError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let service = self.find_locked(id).await?;

        self.routes.unregister(&service.service_name).await;
        let report = self.lifecycle.remove(&service).await;
        if !report.is_clean() {
            tracing::warn!(
                %id,
                service = %service.service_name,
                failures = ?report.failures,
                "teardown incomplete, removing record anyway"
            );
        }
        self.registry.remove(id).await;
        self.locks.remove(&id);
        tracing::info!(%id, service = %service.service_name, "service deleted");
        Ok(report)
    }

    /// Re-register routes for services last stored as running. The container is
    /// not checked; the next reconciliation corrects stale entries.
    pub async fn restore_routes(&self) -> usize {
        let mut restored = 0;
        for service in self.registry.snapshot().await {
            if service.status == ServiceStatus::Running {
                self.routes
                    .register(&service.service_name, self.target_for(&service))
                    .await;
                restored += 1;
            }
        }
        tracing::info!(count = restored, "restored routes from registry");
        restored
    }
}
