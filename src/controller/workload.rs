use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;

use crate::api::deployer::Deployment as ModelDeployment;
use crate::controller::annotations;
use crate::controller::reconciler::Reconciler;
use crate::controller::status::{Module, Status};
use crate::controller::{deployment_name, object_metadata};
use crate::error::AppResult;

pub const MODEL_CONTAINER_NAME: &str = "model";
pub const PROXY_CONTAINER_NAME: &str = "proxy";

const PROXY_TRAFFIC_PORT: i32 = 9501;
const PROXY_API_PORT: i32 = 9502;

impl Reconciler {
    pub(super) async fn synchronize_deployments(&self) -> AppResult<()> {
        let mut upserts = tokio::task::JoinSet::new();

        for md in self.cache.model_deployments() {
            let object_name = deployment_name(&md);
            match self.cache.get_deployment(&md.namespace, &object_name) {
                None => {
                    if self.status_cache.get(&md.id).deployment != Status::Configuring {
                        self.status_cache
                            .set(&md.id, Module::Deployment, Status::Configuring);
                    }

                    let client = self.client.clone();
                    let desired = to_kubernetes_deployment(&md, &self.identifier);
                    let namespace = md.namespace.clone();
                    let id = md.id.clone();
                    upserts.spawn(async move {
                        let api: Api<Deployment> = Api::namespaced(client, &namespace);
                        if let Err(e) = api.create(&PostParams::default(), &desired).await {
                            log::error!(
                                "failed to create deployment for {}: {}",
                                id,
                                e
                            );
                        }
                    });
                }
                Some(existing) => {
                    log::debug!(
                        "deployment {}/{} found, checking for updates",
                        md.namespace,
                        object_name
                    );

                    let desired = to_kubernetes_deployment(&md, &self.identifier);
                    if !deployments_equal(&desired, &existing) {
                        if self.status_cache.get(&md.id).deployment != Status::Configuring {
                            self.status_cache
                                .set(&md.id, Module::Deployment, Status::Configuring);
                        }

                        let updated = update_deployment(&existing, &md, &self.identifier);
                        let client = self.client.clone();
                        let namespace = md.namespace.clone();
                        let id = md.id.clone();
                        upserts.spawn(async move {
                            let api: Api<Deployment> = Api::namespaced(client, &namespace);
                            let name = updated.name_any();
                            if let Err(e) =
                                api.replace(&name, &PostParams::default(), &updated).await
                            {
                                log::error!(
                                    "failed to update deployment {}/{} for {}: {}",
                                    namespace,
                                    name,
                                    id,
                                    e
                                );
                            }
                        });
                    } else {
                        if self.status_cache.get(&md.id).deployment != Status::Ready {
                            self.status_cache
                                .set(&md.id, Module::Deployment, Status::Ready);
                        }
                        let available = existing
                            .status
                            .as_ref()
                            .and_then(|s| s.available_replicas)
                            .unwrap_or(0);
                        if self.status_cache.get(&md.id).available_replicas != available {
                            self.status_cache.set_available_replicas(&md.id, available);
                        }
                    }
                }
            }
        }

        while let Some(result) = upserts.join_next().await {
            if let Err(e) = result {
                log::error!("deployment upsert task failed: {}", e);
            }
        }

        // reap deployments whose descriptor has gone away
        let mut reaps = tokio::task::JoinSet::new();
        for existing in self.cache.deployments() {
            let Some(id) = annotations::deployment_id(existing.metadata.annotations.as_ref())
            else {
                continue;
            };
            if self.cache.has_model_deployment_id(id) {
                continue;
            }

            log::info!(
                "deployment {}/{} not found in model deployments, deleting",
                existing.namespace().unwrap_or_default(),
                existing.name_any()
            );
            self.status_cache.delete(id);

            let client = self.client.clone();
            reaps.spawn(async move {
                let namespace = existing.namespace().unwrap_or_default();
                let name = existing.name_any();
                let api: Api<Deployment> = Api::namespaced(client, &namespace);
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    // already gone is as good as deleted
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => {
                        log::error!("failed to delete deployment {}/{}: {}", namespace, name, e)
                    }
                }
            });
        }

        while let Some(result) = reaps.join_next().await {
            if let Err(e) = result {
                log::error!("deployment reap task failed: {}", e);
            }
        }

        Ok(())
    }
}

/// Renders the workload for a model deployment: one `model` container, plus
/// the metrics proxy sidecar when it is enabled and the model exposes at
/// least one port.
pub fn to_kubernetes_deployment(md: &ModelDeployment, identifier: &str) -> Deployment {
    let mut pod_annotations = BTreeMap::new();
    let mut containers = vec![model_container(md)];

    if let Some(proxy) = proxy_container(md) {
        containers.push(proxy);
        pod_annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        pod_annotations.insert("prometheus.io/path".to_string(), "/api/metrics".to_string());
        pod_annotations.insert(
            "prometheus.io/port".to_string(),
            PROXY_API_PORT.to_string(),
        );
    }

    Deployment {
        metadata: object_metadata(md, identifier),
        spec: Some(DeploymentSpec {
            replicas: md.deployment.as_ref().map(|d| d.replicas),
            selector: LabelSelector {
                match_labels: Some(deployment_selector(md)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(deployment_selector(md)),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment_selector(md: &ModelDeployment) -> BTreeMap<String, String> {
    BTreeMap::from([("deployment".to_string(), md.id.clone())])
}

fn model_container(md: &ModelDeployment) -> Container {
    let spec = md.deployment.as_ref();
    Container {
        name: MODEL_CONTAINER_NAME.to_string(),
        image: spec.map(|s| s.image.clone()),
        ports: spec.map(|s| {
            s.ports
                .iter()
                .map(|&p| ContainerPort {
                    container_port: p,
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    }
}

/// The proxy sidecar fronts the model's first port and exposes traffic on
/// 9501 and its own API (metrics, health) on 9502.
fn proxy_container(md: &ModelDeployment) -> Option<Container> {
    let metrics = md.metrics.as_ref()?;
    if !metrics.enabled {
        return None;
    }
    let model_port = *md.deployment.as_ref()?.ports.first()?;

    Some(Container {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: Some(metrics.image.clone()),
        env: Some(vec![
            EnvVar {
                name: "TF_SERVING_ADDR".to_string(),
                value: Some(format!("http://127.0.0.1:{}", model_port)),
                ..Default::default()
            },
            EnvVar {
                name: "TF_SERVING_PROXY_PORT".to_string(),
                value: Some(PROXY_TRAFFIC_PORT.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "TF_CLASSES".to_string(),
                value: Some(decode_classes(&metrics.classes)),
                ..Default::default()
            },
            EnvVar {
                name: "DEPLOYMENT_ID".to_string(),
                value: Some(md.id.clone()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                container_port: PROXY_TRAFFIC_PORT,
                name: Some("traffic".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: PROXY_API_PORT,
                name: Some("api".to_string()),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::Int(PROXY_API_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(30),
            timeout_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Classes arrive either base64 encoded or plain; decode when possible,
/// pass through verbatim otherwise.
pub fn decode_classes(classes: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(classes) {
        Ok(decoded) => match String::from_utf8(decoded) {
            Ok(s) => s,
            Err(_) => classes.to_string(),
        },
        Err(_) => classes.to_string(),
    }
}

/// Field-restricted equality between the rendered and the observed
/// workload; server-populated fields are ignored.
pub fn deployments_equal(desired: &Deployment, existing: &Deployment) -> bool {
    let (Some(desired_spec), Some(existing_spec)) = (desired.spec.as_ref(), existing.spec.as_ref())
    else {
        return false;
    };

    if desired_spec.replicas != existing_spec.replicas {
        return false;
    }

    if pod_label(desired_spec, "deployment") != pod_label(existing_spec, "deployment") {
        return false;
    }

    let desired_secrets = pull_secrets(desired_spec);
    let existing_secrets = pull_secrets(existing_spec);
    if desired_secrets.len() != existing_secrets.len() {
        return false;
    }
    for (d, e) in desired_secrets.iter().zip(existing_secrets.iter()) {
        if d.name != e.name {
            return false;
        }
    }

    let desired_containers = containers(desired_spec);
    let existing_containers = containers(existing_spec);
    if desired_containers.len() != existing_containers.len() {
        return false;
    }

    for (desired, existing) in desired_containers.iter().zip(existing_containers.iter()) {
        if desired.name != existing.name {
            return false;
        }
        if desired.image != existing.image {
            return false;
        }
        if !container_ports_equal(desired, existing) {
            return false;
        }
        if !env_equal(desired, existing) {
            return false;
        }
        if !probes_equal(desired, existing) {
            return false;
        }
    }

    true
}

fn pod_label<'a>(spec: &'a DeploymentSpec, key: &str) -> Option<&'a str> {
    spec.template
        .metadata
        .as_ref()?
        .labels
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

fn pull_secrets(spec: &DeploymentSpec) -> &[k8s_openapi::api::core::v1::LocalObjectReference] {
    spec.template
        .spec
        .as_ref()
        .and_then(|s| s.image_pull_secrets.as_deref())
        .unwrap_or(&[])
}

fn containers(spec: &DeploymentSpec) -> &[Container] {
    spec.template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[])
}

fn container_ports_equal(desired: &Container, existing: &Container) -> bool {
    let desired_ports = desired.ports.as_deref().unwrap_or(&[]);
    let existing_ports = existing.ports.as_deref().unwrap_or(&[]);
    if desired_ports.len() != existing_ports.len() {
        return false;
    }
    desired_ports
        .iter()
        .zip(existing_ports.iter())
        .all(|(d, e)| d.container_port == e.container_port && d.name == e.name)
}

fn env_equal(desired: &Container, existing: &Container) -> bool {
    let desired_env = desired.env.as_deref().unwrap_or(&[]);
    let existing_env = existing.env.as_deref().unwrap_or(&[]);
    if desired_env.len() != existing_env.len() {
        return false;
    }
    // the API server drops empty values, compare both sides normalized
    desired_env.iter().zip(existing_env.iter()).all(|(d, e)| {
        d.name == e.name
            && d.value.as_deref().unwrap_or("") == e.value.as_deref().unwrap_or("")
    })
}

fn probes_equal(desired: &Container, existing: &Container) -> bool {
    match (
        desired.readiness_probe.as_ref(),
        existing.readiness_probe.as_ref(),
    ) {
        (None, None) => true,
        (Some(d), Some(e)) => {
            if d.initial_delay_seconds != e.initial_delay_seconds
                || d.timeout_seconds != e.timeout_seconds
            {
                return false;
            }
            match (d.http_get.as_ref(), e.http_get.as_ref()) {
                (None, None) => true,
                (Some(dh), Some(eh)) => dh.path == eh.path && dh.port == eh.port,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Builds the updated workload from a copy of the observed object,
/// re-applying the rendered replicas, selector, pod label and containers
/// while preserving server-managed metadata.
pub fn update_deployment(
    existing: &Deployment,
    md: &ModelDeployment,
    identifier: &str,
) -> Deployment {
    let mut updated = existing.clone();
    let desired = to_kubernetes_deployment(md, identifier);

    let Some(desired_spec) = desired.spec else {
        return updated;
    };

    match updated.spec.as_mut() {
        Some(spec) => {
            spec.replicas = desired_spec.replicas;
            spec.selector = desired_spec.selector;

            let template = &mut spec.template;
            let meta = template.metadata.get_or_insert_with(Default::default);
            meta.labels
                .get_or_insert_with(Default::default)
                .insert("deployment".to_string(), md.id.clone());
            if let Some(desired_meta) = desired_spec.template.metadata {
                if let Some(desired_annotations) = desired_meta.annotations {
                    let annotations = meta.annotations.get_or_insert_with(Default::default);
                    annotations.extend(desired_annotations);
                }
            }

            match template.spec.as_mut() {
                Some(pod_spec) => {
                    if let Some(desired_pod) = desired_spec.template.spec {
                        pod_spec.containers = desired_pod.containers;
                    }
                }
                None => template.spec = desired_spec.template.spec,
            }
        }
        None => updated.spec = Some(desired_spec),
    }

    updated
}
