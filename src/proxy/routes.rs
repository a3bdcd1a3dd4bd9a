//! Live route table consulted by the gateway on every request.
//!
//! There is exactly one gateway handler; unregistering a name takes effect on
//! the next request because nothing is mounted per service.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Internal address a service prefix forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
}

impl RouteTarget {
    /// Target for a container on the internal network, addressed by its name.
    pub fn for_container(container_name: &str, port: u16) -> Self {
        Self {
            host: container_name.to_string(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, RouteTarget>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the route for `service_name`. Returns the replaced target.
    pub async fn register(&self, service_name: &str, target: RouteTarget) -> Option<RouteTarget> {
        let previous = self
            .routes
            .write()
            .await
            .insert(service_name.to_string(), target.clone());
        match &previous {
            Some(old) if *old != target => tracing::info!(
                service = %service_name,
                from = %old.base_url(),
                to = %target.base_url(),
                "route replaced"
            ),
            Some(_) => {}
            None => tracing::info!(service = %service_name, target = %target.base_url(), "route registered"),
        }
        previous
    }

    pub async fn unregister(&self, service_name: &str) -> Option<RouteTarget> {
        let removed = self.routes.write().await.remove(service_name);
        if removed.is_some() {
            tracing::info!(service = %service_name, "route unregistered");
        }
        removed
    }

    pub async fn lookup(&self, service_name: &str) -> Option<RouteTarget> {
        self.routes.read().await.get(service_name).cloned()
    }

    /// All routes, sorted by service name.
    pub async fn list(&self) -> Vec<(String, RouteTarget)> {
        let mut all: Vec<_> = self
            .routes
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_replaces_in_place() {
        let table = RouteTable::new();
        assert!(table
            .register("suma-1", RouteTarget::for_container("ms-suma-1", 3000))
            .await
            .is_none());
        let previous = table
            .register("suma-1", RouteTarget::for_container("ms-suma-1b", 3000))
            .await;
        assert_eq!(previous.map(|t| t.host), Some("ms-suma-1".to_string()));
        assert_eq!(table.len().await, 1);
        assert_eq!(
            table.lookup("suma-1").await.unwrap().base_url(),
            "http://ms-suma-1b:3000"
        );
    }

    #[tokio::test]
    async fn test_unregister_removes_lookup() {
        let table = RouteTable::new();
        table
            .register("a", RouteTarget::for_container("ms-a", 3000))
            .await;
        assert!(table.unregister("a").await.is_some());
        assert!(table.lookup("a").await.is_none());
        assert!(table.unregister("a").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_registers_leave_one_route() {
        let table = RouteTable::new();
        let mut handles = Vec::new();
        for i in 0..16u16 {
            let t = table.clone();
            handles.push(tokio::spawn(async move {
                t.register("same", RouteTarget::for_container("ms-same", 3000 + i))
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(table.list().await.len(), 1);
    }
}
