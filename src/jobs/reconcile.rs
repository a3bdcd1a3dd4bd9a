//! Background job: periodic reconciliation of stored statuses against the runtime.
//!
//! Keeps statuses and routes fresh between control API calls, e.g. after a
//! container crashed or was removed out of band.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::manager::ServiceManager;

/// Spawn the reconciliation task. Call this once at startup; a zero interval disables it.
pub fn spawn(manager: Arc<ServiceManager>, every: Duration) -> Option<tokio::task::JoinHandle<()>> {
    if every.is_zero() {
        tracing::info!("background reconciliation disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = time::interval(every);
        // the first tick completes immediately; startup already restored routes
        interval.tick().await;
        loop {
            interval.tick().await;
            run_once(&manager).await;
        }
    }))
}

/// One reconciliation pass. Returns how many services were seen.
pub async fn run_once(manager: &ServiceManager) -> usize {
    let list = manager.list().await;
    if list.reconciled {
        let running = list.services.iter().filter(|s| s.is_running()).count();
        tracing::debug!(total = list.services.len(), running, "reconciliation pass");
    } else {
        tracing::warn!("reconciliation skipped, runtime unavailable");
    }
    list.services.len()
}
