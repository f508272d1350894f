use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tokio::sync::oneshot;

use crate::api::deployer::Deployment as ModelDeployment;
use crate::cond::Cond;
use crate::controller::annotations;

/// Meta holds the name and namespace of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Meta {
    pub namespace: String,
    pub name: String,
}

impl Meta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Meta {
        Meta {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// The object kinds the cache accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Service,
    Deployment,
    Ingress,
    ModelDeployment,
}

/// Tagged variant over the accepted object kinds; anything else is not
/// interesting to the cache.
#[derive(Debug, Clone)]
pub enum CacheObject {
    Service(Service),
    Deployment(Deployment),
    Ingress(Ingress),
    ModelDeployment(ModelDeployment),
}

/// KubernetesCache holds the observed cluster objects owned by this agent
/// and the desired model deployments received from the gateway.
///
/// Readers get deep copies; each mapping has its own lock so the reconciler
/// can walk desired and observed sides together without deadlocking, and
/// subscribers are notified only after the locks are released.
pub struct KubernetesCache {
    identifier: String,

    services: RwLock<HashMap<Meta, Service>>,
    deployments: RwLock<HashMap<Meta, Deployment>>,
    ingresses: RwLock<HashMap<Meta, Ingress>>,
    model_deployments: RwLock<HashMap<Meta, ModelDeployment>>,

    cond: Cond,
}

impl KubernetesCache {
    pub fn new(identifier: impl Into<String>) -> KubernetesCache {
        KubernetesCache {
            identifier: identifier.into(),
            services: RwLock::new(HashMap::new()),
            deployments: RwLock::new(HashMap::new()),
            ingresses: RwLock::new(HashMap::new()),
            model_deployments: RwLock::new(HashMap::new()),
            cond: Cond::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.cond.version()
    }

    pub fn register(&self, last_seen: u64) -> oneshot::Receiver<u64> {
        self.cond.register(last_seen)
    }

    /// Inserts obj into the cache, overwriting any entry with the same kind,
    /// namespace and name. Returns true if the cache accepted the object.
    /// Cluster objects are rejected unless their owner-identifier annotation
    /// matches this agent; model deployments are always accepted.
    pub fn insert(&self, obj: CacheObject) -> bool {
        let accepted = match obj {
            CacheObject::Service(service) => {
                if !self.owned_by_us(service.metadata.annotations.as_ref()) {
                    return false;
                }
                let meta = Meta::new(service.namespace().unwrap_or_default(), service.name_any());
                write_lock(&self.services).insert(meta, service);
                true
            }
            CacheObject::Deployment(deployment) => {
                if !self.owned_by_us(deployment.metadata.annotations.as_ref()) {
                    return false;
                }
                let meta = Meta::new(
                    deployment.namespace().unwrap_or_default(),
                    deployment.name_any(),
                );
                write_lock(&self.deployments).insert(meta, deployment);
                true
            }
            CacheObject::Ingress(ingress) => {
                if !self.owned_by_us(ingress.metadata.annotations.as_ref()) {
                    return false;
                }
                let meta = Meta::new(ingress.namespace().unwrap_or_default(), ingress.name_any());
                write_lock(&self.ingresses).insert(meta, ingress);
                true
            }
            CacheObject::ModelDeployment(md) => {
                let meta = Meta::new(md.namespace.clone(), md.name.clone());
                write_lock(&self.model_deployments).insert(meta, md);
                true
            }
        };

        if accepted {
            self.cond.notify();
        }
        accepted
    }

    /// Removes obj from the cache by (namespace, name); returns whether an
    /// entry was present. Subscribers are always notified.
    pub fn remove(&self, obj: &CacheObject) -> bool {
        let changed = match obj {
            CacheObject::Service(service) => {
                let meta = Meta::new(service.namespace().unwrap_or_default(), service.name_any());
                write_lock(&self.services).remove(&meta).is_some()
            }
            CacheObject::Deployment(deployment) => {
                let meta = Meta::new(
                    deployment.namespace().unwrap_or_default(),
                    deployment.name_any(),
                );
                write_lock(&self.deployments).remove(&meta).is_some()
            }
            CacheObject::Ingress(ingress) => {
                let meta = Meta::new(ingress.namespace().unwrap_or_default(), ingress.name_any());
                write_lock(&self.ingresses).remove(&meta).is_some()
            }
            CacheObject::ModelDeployment(md) => {
                let meta = Meta::new(md.namespace.clone(), md.name.clone());
                write_lock(&self.model_deployments).remove(&meta).is_some()
            }
        };

        self.cond.notify();
        changed
    }

    /// Drops every entry of the given kind whose key is not in `keep`.
    /// Used when a watch relist completes so deletes missed during a
    /// disconnect cannot orphan cluster objects.
    pub fn retain(&self, kind: ObjectKind, keep: &HashSet<Meta>) {
        let removed = match kind {
            ObjectKind::Service => {
                let mut map = write_lock(&self.services);
                let before = map.len();
                map.retain(|meta, _| keep.contains(meta));
                before - map.len()
            }
            ObjectKind::Deployment => {
                let mut map = write_lock(&self.deployments);
                let before = map.len();
                map.retain(|meta, _| keep.contains(meta));
                before - map.len()
            }
            ObjectKind::Ingress => {
                let mut map = write_lock(&self.ingresses);
                let before = map.len();
                map.retain(|meta, _| keep.contains(meta));
                before - map.len()
            }
            ObjectKind::ModelDeployment => 0,
        };

        if removed > 0 {
            log::info!("{} stale {:?} cache entries dropped after relist", removed, kind);
            self.cond.notify();
        }
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Service> {
        read_lock(&self.services)
            .get(&Meta::new(namespace, name))
            .cloned()
    }

    pub fn get_deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        read_lock(&self.deployments)
            .get(&Meta::new(namespace, name))
            .cloned()
    }

    pub fn get_ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        read_lock(&self.ingresses)
            .get(&Meta::new(namespace, name))
            .cloned()
    }

    /// Snapshot of all desired model deployments.
    pub fn model_deployments(&self) -> Vec<ModelDeployment> {
        read_lock(&self.model_deployments).values().cloned().collect()
    }

    pub fn services(&self) -> Vec<Service> {
        read_lock(&self.services).values().cloned().collect()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        read_lock(&self.deployments).values().cloned().collect()
    }

    pub fn ingresses(&self) -> Vec<Ingress> {
        read_lock(&self.ingresses).values().cloned().collect()
    }

    /// Reap lookup: is any desired deployment carrying this id?
    pub fn has_model_deployment_id(&self, id: &str) -> bool {
        read_lock(&self.model_deployments)
            .values()
            .any(|md| md.id == id)
    }

    fn owned_by_us(&self, annotations: Option<&std::collections::BTreeMap<String, String>>) -> bool {
        annotations::deployer_id(annotations) == Some(self.identifier.as_str())
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}
