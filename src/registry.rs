//! ServiceRegistry: the authoritative, persisted collection of services.
//!
//! One async mutex guards the collection and is held across the file write,
//! so mutations and writes are serialized and the last completed write wins.
//! A failed write is logged; memory stays authoritative for this process.
//!
//! Every record carries an in-memory revision, bumped on each mutation.
//! Reconciliation commits an observation only against the revision it
//! observed, so a status written by a lifecycle action in the meantime wins.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::service::{Service, ServiceStatus};
use crate::store::file_store::JsonFileStore;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service name '{0}' is already registered")]
    DuplicateServiceName(String),

    #[error("service id {0} is already registered")]
    DuplicateId(Uuid),
}

/// Reconciled runtime view of one service, valid against `revision`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub revision: u64,
    pub status: ServiceStatus,
    pub container_id: Option<String>,
    pub url: Option<String>,
}

/// A record as seen at one revision.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub service: Service,
    pub revision: u64,
}

#[derive(Default)]
struct Records {
    services: Vec<Service>,
    revisions: HashMap<Uuid, u64>,
}

impl Records {
    fn revision(&self, id: Uuid) -> u64 {
        self.revisions.get(&id).copied().unwrap_or(0)
    }

    fn bump(&mut self, id: Uuid) {
        *self.revisions.entry(id).or_insert(0) += 1;
    }
}

pub struct ServiceRegistry {
    records: Mutex<Records>,
    store: JsonFileStore,
}

impl ServiceRegistry {
    /// Load the persisted collection. An unreadable or corrupt document is
    /// logged and the registry starts empty.
    pub async fn open(store: JsonFileStore) -> Self {
        let services = match store.load().await {
            Ok(services) => {
                tracing::info!(
                    path = %store.path().display(),
                    count = services.len(),
                    "loaded service registry"
                );
                services
            }
            Err(e) => {
                tracing::error!(error = %e, "could not load service registry, starting empty");
                Vec::new()
            }
        };
        Self {
            records: Mutex::new(Records {
                services,
                revisions: HashMap::new(),
            }),
            store,
        }
    }

    async fn persist(&self, services: &[Service]) {
        if let Err(e) = self.store.save(services).await {
            tracing::error!(error = %e, "failed to persist service registry");
        }
    }

    pub async fn snapshot(&self) -> Vec<Service> {
        self.records.lock().await.services.clone()
    }

    /// Every record with its current revision.
    pub async fn versioned_snapshot(&self) -> Vec<Versioned> {
        let records = self.records.lock().await;
        records
            .services
            .iter()
            .map(|s| Versioned {
                service: s.clone(),
                revision: records.revision(s.id),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.services.is_empty()
    }

    pub async fn get(&self, id: Uuid) -> Option<Service> {
        self.records
            .lock()
            .await
            .services
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn get_versioned(&self, id: Uuid) -> Option<Versioned> {
        let records = self.records.lock().await;
        let service = records.services.iter().find(|s| s.id == id)?.clone();
        Some(Versioned {
            revision: records.revision(id),
            service,
        })
    }

    /// Append a new record. Rejects a duplicate id or `serviceName`.
    pub async fn insert(&self, service: Service) -> Result<(), RegistryError> {
        let mut records = self.records.lock().await;
        if records.services.iter().any(|s| s.id == service.id) {
            return Err(RegistryError::DuplicateId(service.id));
        }
        if records
            .services
            .iter()
            .any(|s| s.service_name == service.service_name)
        {
            return Err(RegistryError::DuplicateServiceName(service.service_name));
        }
        tracing::debug!(id = %service.id, service = %service.service_name, "registry insert");
        records.bump(service.id);
        records.services.push(service);
        self.persist(&records.services).await;
        Ok(())
    }

    /// Mutate one record in place and persist. Returns the updated record.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Option<Service>
    where
        F: FnOnce(&mut Service),
    {
        let mut records = self.records.lock().await;
        let service = records.services.iter_mut().find(|s| s.id == id)?;
        f(service);
        let updated = service.clone();
        records.bump(id);
        self.persist(&records.services).await;
        Some(updated)
    }

    /// Apply reconciled statuses. Ids removed meanwhile, and records whose
    /// revision moved past the one the update was observed against, are
    /// skipped. Persists only when something changed. Returns the resulting
    /// collection.
    pub async fn record_statuses(&self, updates: &[StatusUpdate]) -> Vec<Service> {
        let mut guard = self.records.lock().await;
        let records = &mut *guard;
        let mut changed = false;
        for update in updates {
            let current = records.revision(update.id);
            let Some(service) = records.services.iter_mut().find(|s| s.id == update.id) else {
                continue;
            };
            if current != update.revision {
                tracing::debug!(
                    service = %service.service_name,
                    observed = update.revision,
                    current,
                    "stale observation discarded"
                );
                continue;
            }
            if service.status != update.status
                || service.container_id != update.container_id
                || service.url != update.url
            {
                if service.status != update.status {
                    tracing::info!(
                        service = %service.service_name,
                        from = %service.status,
                        to = %update.status,
                        "status reconciled"
                    );
                }
                service.status = update.status;
                service.container_id = update.container_id.clone();
                service.url = update.url.clone();
                *records.revisions.entry(update.id).or_insert(0) += 1;
                changed = true;
            }
        }
        if changed {
            self.persist(&records.services).await;
        }
        records.services.clone()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Service> {
        let mut records = self.records.lock().await;
        let idx = records.services.iter().position(|s| s.id == id)?;
        let removed = records.services.remove(idx);
        records.revisions.remove(&id);
        self.persist(&records.services).await;
        tracing::debug!(id = %id, service = %removed.service_name, "registry remove");
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn svc(name: &str) -> Service {
        let id = Uuid::new_v4();
        let service_name = crate::models::service::derive_service_name(name, &id);
        Service {
            id,
            name: name.into(),
            container_name: crate::models::service::derive_container_name(&service_name),
            service_name,
            container_id: None,
            status: ServiceStatus::Running,
            url: None,
            description: String::new(),
            endpoints: vec![],
            env: Default::default(),
            base_image: "node:18-alpine".into(),
            dependencies: vec![],
            created_at: Utc::now(),
            created_by: None,
            updated_at: None,
            updated_by: None,
        }
    }

    #[tokio::test]
    async fn test_insert_persists_and_reloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("microservices.json");
        let reg = ServiceRegistry::open(JsonFileStore::new(&path)).await;
        let a = svc("A");
        let b = svc("B");
        reg.insert(a.clone()).await.unwrap();
        reg.insert(b.clone()).await.unwrap();

        let reloaded = ServiceRegistry::open(JsonFileStore::new(&path)).await;
        let ids: Vec<Uuid> = reloaded.snapshot().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_duplicate_service_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::open(JsonFileStore::new(dir.path().join("r.json"))).await;
        let a = svc("A");
        let mut clash = svc("B");
        clash.service_name = a.service_name.clone();
        reg.insert(a).await.unwrap();
        assert!(matches!(
            reg.insert(clash).await,
            Err(RegistryError::DuplicateServiceName(_))
        ));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_statuses_skips_removed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::open(JsonFileStore::new(dir.path().join("r.json"))).await;
        let a = svc("A");
        reg.insert(a.clone()).await.unwrap();

        let after = reg
            .record_statuses(&[
                StatusUpdate {
                    id: a.id,
                    revision: 1,
                    status: ServiceStatus::Stopped,
                    container_id: None,
                    url: None,
                },
                StatusUpdate {
                    id: Uuid::new_v4(),
                    revision: 0,
                    status: ServiceStatus::Running,
                    container_id: None,
                    url: None,
                },
            ])
            .await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_observation_older_than_update_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ServiceRegistry::open(JsonFileStore::new(dir.path().join("r.json"))).await;
        let a = svc("A");
        reg.insert(a.clone()).await.unwrap();

        let seen = reg.get_versioned(a.id).await.unwrap();
        assert_eq!(seen.service.status, ServiceStatus::Running);

        // a stop lands between the observation and its commit
        reg.update(a.id, |s| {
            s.status = ServiceStatus::Exited;
            s.url = None;
        })
        .await;

        let after = reg
            .record_statuses(&[StatusUpdate {
                id: a.id,
                revision: seen.revision,
                status: ServiceStatus::Running,
                container_id: Some("abc".into()),
                url: Some("http://localhost:4000/services/a".into()),
            }])
            .await;
        assert_eq!(after[0].status, ServiceStatus::Exited);
        assert!(after[0].url.is_none());

        // a fresh observation still applies, and moves the revision on
        let fresh = reg.get_versioned(a.id).await.unwrap();
        reg.record_statuses(&[StatusUpdate {
            id: a.id,
            revision: fresh.revision,
            status: ServiceStatus::Stopped,
            container_id: None,
            url: None,
        }])
        .await;
        let last = reg.get_versioned(a.id).await.unwrap();
        assert_eq!(last.service.status, ServiceStatus::Stopped);
        assert!(last.revision > fresh.revision);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.json");
        let reg = std::sync::Arc::new(ServiceRegistry::open(JsonFileStore::new(&path)).await);
        let a = svc("A");
        reg.insert(a.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.update(a.id, |s| {
                    s.env.insert(format!("K{}", i), i.to_string());
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.get(a.id).await.unwrap().env.len(), 20);
        let reloaded = ServiceRegistry::open(JsonFileStore::new(&path)).await;
        assert_eq!(reloaded.get(a.id).await.unwrap().env.len(), 20);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the document should be: every write fails
        let path = dir.path().join("occupied");
        std::fs::create_dir_all(&path).unwrap();
        let reg = ServiceRegistry::open(JsonFileStore::new(&path)).await;
        let a = svc("A");
        reg.insert(a.clone()).await.unwrap();
        assert!(reg.get(a.id).await.is_some());

        let restarted = ServiceRegistry::open(JsonFileStore::new(&path)).await;
        assert!(restarted.is_empty().await);
    }
}
