use std::pin::Pin;

use async_trait::async_trait;
use futures_util::io::AsyncBufReadExt;
use futures_util::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::{Client, ResourceExt};

use crate::api::deployer::{Deployment as ModelDeployment, LogsContainer, LogsRequest};
use crate::error::{AppError, AppResult};

/// Newline-delimited log lines from one container.
pub type LogLines = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Narrow capability interface consumed by the gateway client to answer
/// log requests without owning the cluster plumbing.
#[async_trait]
pub trait PodLogsGetter: Send + Sync {
    async fn logs(&self, md: &ModelDeployment, request: &LogsRequest) -> AppResult<LogLines>;
}

/// Resolves a model deployment to a live pod and opens a log stream on the
/// requested container.
pub struct PodLogs {
    client: Client,
}

impl PodLogs {
    pub fn new(client: Client) -> PodLogs {
        PodLogs { client }
    }
}

#[async_trait]
impl PodLogsGetter for PodLogs {
    async fn logs(&self, md: &ModelDeployment, request: &LogsRequest) -> AppResult<LogLines> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &md.namespace);

        let selector = format!("deployment={}", md.id);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        let pod = pick_pod(list.items).ok_or_else(|| {
            AppError::KubernetesNotFound(format!("no pods found for deployment {}", md.id))
        })?;
        let pod_name = pod.name_any();

        let container = select_container(&pod, request.container()).ok_or_else(|| {
            AppError::KubernetesNotFound(format!(
                "container {:?} not found in pod {}/{}",
                request.container(),
                md.namespace,
                pod_name
            ))
        })?;

        let params = LogParams {
            container: Some(container),
            ..Default::default()
        };
        let reader = pods.log_stream(&pod_name, &params).await?;
        Ok(Box::pin(reader.lines()))
    }
}

/// Prefers a running pod, falls back to whatever the selector matched.
fn pick_pod(pods: Vec<Pod>) -> Option<Pod> {
    let running = pods.iter().position(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false)
    });
    let mut pods = pods;
    match running {
        Some(index) => Some(pods.swap_remove(index)),
        None => pods.into_iter().next(),
    }
}

/// Maps the requested container onto a container name in the pod. Current
/// pods name their containers `model` and `proxy`; pods created by older
/// agents used `ds-md-*` and `ds-mx-*` names.
fn select_container(pod: &Pod, want: LogsContainer) -> Option<String> {
    let (name, legacy_prefix) = match want {
        LogsContainer::Model => ("model", "ds-md"),
        LogsContainer::Proxy => ("proxy", "ds-mx"),
    };

    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name || c.name.starts_with(legacy_prefix))
        .map(|c| c.name.clone())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod_with_containers(names: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("ds-cats-1111-abcde".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: names
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn selects_current_container_names() {
        let pod = pod_with_containers(&["model", "proxy"]);
        assert_eq!(
            select_container(&pod, LogsContainer::Model).as_deref(),
            Some("model")
        );
        assert_eq!(
            select_container(&pod, LogsContainer::Proxy).as_deref(),
            Some("proxy")
        );
    }

    #[test]
    fn selects_legacy_container_names_by_prefix() {
        let pod = pod_with_containers(&["ds-md-cats-1111", "ds-mx-cats-1111"]);
        assert_eq!(
            select_container(&pod, LogsContainer::Model).as_deref(),
            Some("ds-md-cats-1111")
        );
        assert_eq!(
            select_container(&pod, LogsContainer::Proxy).as_deref(),
            Some("ds-mx-cats-1111")
        );
    }

    #[test]
    fn missing_container_yields_none() {
        let pod = pod_with_containers(&["model"]);
        assert_eq!(select_container(&pod, LogsContainer::Proxy), None);
    }

    #[test]
    fn running_pod_is_preferred() {
        let mut pending = pod_with_containers(&["model"]);
        pending.metadata.name = Some("pending".to_string());
        pending.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });

        let mut running = pod_with_containers(&["model"]);
        running.metadata.name = Some("running".to_string());
        running.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });

        let picked = pick_pod(vec![pending, running]).expect("a pod");
        assert_eq!(picked.metadata.name.as_deref(), Some("running"));
    }
}
