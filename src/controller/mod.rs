pub mod annotations;
pub mod cache;
pub mod ingress;
pub mod logs;
pub mod reconciler;
pub mod service;
pub mod status;
pub mod watchers;
pub mod workload;

pub use cache::{CacheObject, KubernetesCache, Meta, ObjectKind};
pub use logs::{PodLogs, PodLogsGetter};
pub use reconciler::{HealthModule, Reconciler};
pub use status::{DeploymentStatus, Module, Status, StatusCache};

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::api::deployer::Deployment as ModelDeployment;
use crate::controller::annotations::{
    ANN_CONTROLLER_IDENTIFIER, ANN_DEPLOYMENT_ID, ANN_DEPLOYMENT_NAME,
};

pub(crate) const OWNER_LABEL: &str = "owner";
pub(crate) const OWNER_LABEL_VALUE: &str = "ds-deployer";

/// Cluster object name derived from a model deployment: `ds-<name>-<shortid>`
/// where shortid is the id segment before the first dash. All three owned
/// objects (workload, service, ingress) share this name.
pub fn deployment_name(md: &ModelDeployment) -> String {
    format!("ds-{}-{}", md.name, short_id(&md.id))
}

fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// Shared metadata for the three owned objects: derived name, owner label,
/// owner identifier and the back-references used by the reap phase.
pub(crate) fn object_metadata(md: &ModelDeployment, identifier: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(deployment_name(md)),
        namespace: Some(md.namespace.clone()),
        labels: Some(BTreeMap::from([(
            OWNER_LABEL.to_string(),
            OWNER_LABEL_VALUE.to_string(),
        )])),
        annotations: Some(BTreeMap::from([
            (ANN_CONTROLLER_IDENTIFIER.to_string(), identifier.to_string()),
            (ANN_DEPLOYMENT_NAME.to_string(), md.name.clone()),
            (ANN_DEPLOYMENT_ID.to_string(), md.id.clone()),
        ])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_deployment(id: &str, name: &str) -> ModelDeployment {
        ModelDeployment {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn name_derivation_uses_first_id_segment() {
        let md = model_deployment("1111-aa-bb", "cats");
        assert_eq!(deployment_name(&md), "ds-cats-1111");
    }

    #[test]
    fn name_derivation_is_pure() {
        let md = model_deployment("1111-aa-bb", "cats");
        assert_eq!(deployment_name(&md), deployment_name(&md));

        // descriptors sharing (name, first id segment) collide
        let other = model_deployment("1111-cc-dd", "cats");
        assert_eq!(deployment_name(&md), deployment_name(&other));
    }

    #[test]
    fn dashless_id_is_used_verbatim() {
        let md = model_deployment("abcdef", "dogs");
        assert_eq!(deployment_name(&md), "ds-dogs-abcdef");
    }
}
