use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use tokio::sync::oneshot;

use crate::cond::Cond;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    None,
    Configuring,
    Ready,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::None => "none",
            Status::Configuring => "configuring",
            Status::Ready => "ready",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// The three reconciled resources of a model deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Deployment,
    Service,
    Ingress,
}

/// Aggregate status of one model deployment across its three resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeploymentStatus {
    pub deployment: Status,
    pub service: Status,
    pub ingress: Status,
    pub available_replicas: i32,
}

impl DeploymentStatus {
    /// Human readable rendering pushed to the gateway.
    pub fn status(&self) -> String {
        format!(
            "Deployment: {} Service: {} Ingress: {}",
            self.deployment, self.service, self.ingress
        )
    }

    pub fn ready(&self) -> bool {
        self.deployment == Status::Ready
            && self.service == Status::Ready
            && self.ingress == Status::Ready
    }
}

/// StatusCache tracks per-deployment aggregate status and notifies
/// subscribers on every mutation.
#[derive(Default)]
pub struct StatusCache {
    deployments: RwLock<HashMap<String, DeploymentStatus>>,
    cond: Cond,
}

impl StatusCache {
    pub fn new() -> StatusCache {
        StatusCache::default()
    }

    pub fn version(&self) -> u64 {
        self.cond.version()
    }

    pub fn register(&self, last_seen: u64) -> oneshot::Receiver<u64> {
        self.cond.register(last_seen)
    }

    pub fn set(&self, deployment_id: &str, module: Module, status: Status) {
        {
            let mut deployments = self.write();
            let entry = deployments.entry(deployment_id.to_string()).or_default();
            match module {
                Module::Deployment => entry.deployment = status,
                Module::Service => entry.service = status,
                Module::Ingress => entry.ingress = status,
            }
        }
        self.cond.notify();
    }

    pub fn set_available_replicas(&self, deployment_id: &str, replicas: i32) {
        {
            let mut deployments = self.write();
            let entry = deployments.entry(deployment_id.to_string()).or_default();
            entry.available_replicas = replicas;
        }
        self.cond.notify();
    }

    /// Returns a copy of the status, or the zero value when absent.
    pub fn get(&self, deployment_id: &str) -> DeploymentStatus {
        self.read().get(deployment_id).copied().unwrap_or_default()
    }

    pub fn delete(&self, deployment_id: &str) {
        self.write().remove(deployment_id);
        self.cond.notify();
    }

    /// Snapshot of all tracked statuses.
    pub fn list(&self) -> HashMap<String, DeploymentStatus> {
        self.read().clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeploymentStatus>> {
        self.deployments
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeploymentStatus>> {
        self.deployments
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_creates_entry_on_first_write() {
        let cache = StatusCache::new();
        cache.set("dep-1", Module::Service, Status::Configuring);

        let status = cache.get("dep-1");
        assert_eq!(status.service, Status::Configuring);
        assert_eq!(status.deployment, Status::None);
        assert_eq!(status.ingress, Status::None);
    }

    #[test]
    fn absent_id_returns_zero_value() {
        let cache = StatusCache::new();
        assert_eq!(cache.get("who"), DeploymentStatus::default());
    }

    #[test]
    fn status_renders_human_string() {
        let status = DeploymentStatus {
            deployment: Status::Ready,
            service: Status::Configuring,
            ingress: Status::None,
            available_replicas: 2,
        };
        assert_eq!(
            status.status(),
            "Deployment: ready Service: configuring Ingress: none"
        );
    }

    #[test]
    fn aggregate_is_not_ready_unless_all_modules_are() {
        let mut status = DeploymentStatus {
            deployment: Status::Ready,
            service: Status::Ready,
            ingress: Status::Configuring,
            available_replicas: 0,
        };
        assert!(!status.ready());
        status.ingress = Status::Ready;
        assert!(status.ready());
    }

    #[test]
    fn every_mutation_notifies() {
        let cache = StatusCache::new();
        let v0 = cache.version();
        cache.set("dep-1", Module::Deployment, Status::Ready);
        let v1 = cache.version();
        assert!(v1 > v0);
        cache.set_available_replicas("dep-1", 3);
        let v2 = cache.version();
        assert!(v2 > v1);
        cache.delete("dep-1");
        assert!(cache.version() > v2);
        assert_eq!(cache.get("dep-1"), DeploymentStatus::default());
    }

    #[test]
    fn list_is_a_snapshot() {
        let cache = StatusCache::new();
        cache.set("dep-1", Module::Deployment, Status::Ready);

        let mut snapshot = cache.list();
        if let Some(entry) = snapshot.get_mut("dep-1") {
            entry.deployment = Status::Error;
        }
        assert_eq!(cache.get("dep-1").deployment, Status::Ready);
    }
}
