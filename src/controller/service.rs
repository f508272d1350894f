use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;

use crate::api::deployer::Deployment as ModelDeployment;
use crate::controller::annotations;
use crate::controller::reconciler::Reconciler;
use crate::controller::status::{Module, Status};
use crate::controller::{deployment_name, object_metadata};
use crate::error::AppResult;

const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";
const SERVICE_TYPE_NODE_PORT: &str = "NodePort";

impl Reconciler {
    pub(super) async fn synchronize_services(&self) -> AppResult<()> {
        let mut upserts = tokio::task::JoinSet::new();

        for md in self.cache.model_deployments() {
            let object_name = deployment_name(&md);
            match self.cache.get_service(&md.namespace, &object_name) {
                None => {
                    if self.status_cache.get(&md.id).service != Status::Configuring {
                        self.status_cache
                            .set(&md.id, Module::Service, Status::Configuring);
                    }

                    let client = self.client.clone();
                    let desired = to_kubernetes_service(&md, &self.identifier);
                    let namespace = md.namespace.clone();
                    let id = md.id.clone();
                    upserts.spawn(async move {
                        let api: Api<Service> = Api::namespaced(client, &namespace);
                        if let Err(e) = api.create(&PostParams::default(), &desired).await {
                            log::error!("failed to create service for {}: {}", id, e);
                        }
                    });
                }
                Some(existing) => {
                    log::debug!(
                        "service {}/{} found, checking for updates",
                        md.namespace,
                        object_name
                    );

                    if !services_equal(&to_kubernetes_service(&md, &self.identifier), &existing) {
                        if self.status_cache.get(&md.id).service != Status::Configuring {
                            self.status_cache
                                .set(&md.id, Module::Service, Status::Configuring);
                        }

                        let updated = update_service(&existing, &md);
                        let client = self.client.clone();
                        let namespace = md.namespace.clone();
                        let id = md.id.clone();
                        upserts.spawn(async move {
                            let api: Api<Service> = Api::namespaced(client, &namespace);
                            let name = updated.name_any();
                            if let Err(e) =
                                api.replace(&name, &PostParams::default(), &updated).await
                            {
                                log::error!(
                                    "failed to update service {}/{} for {}: {}",
                                    namespace,
                                    name,
                                    id,
                                    e
                                );
                            }
                        });
                    } else if self.status_cache.get(&md.id).service != Status::Ready {
                        self.status_cache.set(&md.id, Module::Service, Status::Ready);
                    }
                }
            }
        }

        while let Some(result) = upserts.join_next().await {
            if let Err(e) = result {
                log::error!("service upsert task failed: {}", e);
            }
        }

        // going through existing services to see which ones should be removed
        let mut reaps = tokio::task::JoinSet::new();
        for existing in self.cache.services() {
            let Some(id) = annotations::deployment_id(existing.metadata.annotations.as_ref())
            else {
                continue;
            };
            if self.cache.has_model_deployment_id(id) {
                continue;
            }

            log::info!(
                "service {}/{} not found in model deployments, deleting",
                existing.namespace().unwrap_or_default(),
                existing.name_any()
            );
            self.status_cache.delete(id);

            let client = self.client.clone();
            reaps.spawn(async move {
                let namespace = existing.namespace().unwrap_or_default();
                let name = existing.name_any();
                let api: Api<Service> = Api::namespaced(client, &namespace);
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => {
                        log::error!("failed to delete service {}/{}: {}", namespace, name, e)
                    }
                }
            });
        }

        while let Some(result) = reaps.join_next().await {
            if let Err(e) = result {
                log::error!("service reap task failed: {}", e);
            }
        }

        Ok(())
    }
}

pub fn to_kubernetes_service(md: &ModelDeployment, identifier: &str) -> Service {
    Service {
        metadata: object_metadata(md, identifier),
        spec: Some(ServiceSpec {
            ports: Some(service_ports(md)),
            selector: Some(BTreeMap::from([(
                "deployment".to_string(),
                md.id.clone(),
            )])),
            type_: Some(service_type(md).to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_ports(md: &ModelDeployment) -> Vec<ServicePort> {
    md.service
        .as_ref()
        .map(|spec| {
            spec.ports
                .iter()
                .map(|p| ServicePort {
                    // the API server drops empty names, keep both sides in
                    // the same shape
                    name: (!p.name.is_empty()).then(|| p.name.clone()),
                    port: p.port,
                    target_port: Some(IntOrString::Int(p.target_port)),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn service_type(md: &ModelDeployment) -> &'static str {
    match md.service.as_ref().map(|s| s.r#type.as_str()) {
        Some("loadbalancer") => SERVICE_TYPE_LOAD_BALANCER,
        _ => SERVICE_TYPE_NODE_PORT,
    }
}

/// Field-restricted service equality: type, load balancer IP and the
/// ordered port list.
pub fn services_equal(desired: &Service, existing: &Service) -> bool {
    let (Some(desired_spec), Some(existing_spec)) = (desired.spec.as_ref(), existing.spec.as_ref())
    else {
        return false;
    };

    if desired_spec.type_ != existing_spec.type_ {
        return false;
    }

    if desired_spec.load_balancer_ip != existing_spec.load_balancer_ip {
        return false;
    }

    let desired_ports = desired_spec.ports.as_deref().unwrap_or(&[]);
    let existing_ports = existing_spec.ports.as_deref().unwrap_or(&[]);
    if desired_ports.len() != existing_ports.len() {
        return false;
    }

    for (d, e) in desired_ports.iter().zip(existing_ports.iter()) {
        if d.name.as_deref().unwrap_or("") != e.name.as_deref().unwrap_or("") {
            return false;
        }
        if d.port != e.port {
            return false;
        }
        if target_port_number(d) != target_port_number(e) {
            return false;
        }
    }

    true
}

fn target_port_number(port: &ServicePort) -> i32 {
    match port.target_port.as_ref() {
        Some(IntOrString::Int(n)) => *n,
        _ => 0,
    }
}

/// Re-applies the rendered ports, type and selector onto a copy of the
/// observed service; node ports and cluster IP assigned by the server stay
/// untouched on the copy's metadata.
pub fn update_service(existing: &Service, md: &ModelDeployment) -> Service {
    let mut updated = existing.clone();

    match updated.spec.as_mut() {
        Some(spec) => {
            spec.ports = Some(service_ports(md));
            spec.type_ = Some(service_type(md).to_string());
            spec.selector = Some(BTreeMap::from([(
                "deployment".to_string(),
                md.id.clone(),
            )]));
        }
        None => {
            updated.spec = to_kubernetes_service(md, "").spec;
        }
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::deployer::{ServicePort as ModelServicePort, ServiceSpec as ModelServiceSpec};

    fn model_deployment(service_type: &str) -> ModelDeployment {
        ModelDeployment {
            id: "1111-aa-bb".to_string(),
            namespace: "ns".to_string(),
            name: "cats".to_string(),
            service: Some(ModelServiceSpec {
                r#type: service_type.to_string(),
                ports: vec![ModelServicePort {
                    name: "model-http".to_string(),
                    port: 8080,
                    target_port: 8080,
                }],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn renders_node_port_by_default() {
        let rendered = to_kubernetes_service(&model_deployment(""), "5555");
        assert_eq!(rendered.metadata.name.as_deref(), Some("ds-cats-1111"));

        let spec = rendered.spec.expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(
            spec.selector.expect("selector")["deployment"],
            "1111-aa-bb"
        );

        let ports = spec.ports.expect("ports");
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("model-http"));
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn loadbalancer_type_is_honoured() {
        let rendered = to_kubernetes_service(&model_deployment("loadbalancer"), "5555");
        assert_eq!(
            rendered.spec.expect("spec").type_.as_deref(),
            Some("LoadBalancer")
        );
    }

    #[test]
    fn rendered_service_equals_itself() {
        let md = model_deployment("");
        let desired = to_kubernetes_service(&md, "5555");
        let mut observed = to_kubernetes_service(&md, "5555");
        observed.metadata.resource_version = Some("7".to_string());
        if let Some(spec) = observed.spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.12".to_string());
        }
        assert!(services_equal(&desired, &observed));
    }

    #[test]
    fn port_change_breaks_equality() {
        let desired = to_kubernetes_service(&model_deployment(""), "5555");

        let mut changed = model_deployment("");
        if let Some(spec) = changed.service.as_mut() {
            spec.ports[0].target_port = 9000;
        }
        let observed = to_kubernetes_service(&changed, "5555");
        assert!(!services_equal(&desired, &observed));
    }

    #[test]
    fn type_change_breaks_equality() {
        let desired = to_kubernetes_service(&model_deployment(""), "5555");
        let observed = to_kubernetes_service(&model_deployment("loadbalancer"), "5555");
        assert!(!services_equal(&desired, &observed));
    }

    #[test]
    fn update_keeps_server_fields() {
        let md = model_deployment("");
        let mut existing = to_kubernetes_service(&md, "5555");
        existing.metadata.resource_version = Some("7".to_string());
        if let Some(spec) = existing.spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.12".to_string());
        }

        let mut changed = md.clone();
        if let Some(spec) = changed.service.as_mut() {
            spec.r#type = "loadbalancer".to_string();
        }

        let updated = update_service(&existing, &changed);
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));
        let spec = updated.spec.expect("spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
    }
}
