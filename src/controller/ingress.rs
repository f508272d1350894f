use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;

use crate::api::deployer::Deployment as ModelDeployment;
use crate::controller::annotations;
use crate::controller::reconciler::Reconciler;
use crate::controller::status::{Module, Status};
use crate::controller::{deployment_name, object_metadata};
use crate::error::AppResult;

pub const KUBERNETES_INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Service port name that fronts the model over HTTP; the ingress routes to
/// it and falls back to port zero when the descriptor doesn't declare one.
const MODEL_HTTP_PORT_NAME: &str = "model-http";

impl Reconciler {
    pub(super) async fn synchronize_ingresses(&self) -> AppResult<()> {
        let mut upserts = tokio::task::JoinSet::new();

        for md in self.cache.model_deployments() {
            let object_name = deployment_name(&md);
            match self.cache.get_ingress(&md.namespace, &object_name) {
                None => {
                    if self.status_cache.get(&md.id).ingress != Status::Configuring {
                        self.status_cache
                            .set(&md.id, Module::Ingress, Status::Configuring);
                    }

                    let client = self.client.clone();
                    let desired = to_kubernetes_ingress(&md, &self.identifier);
                    let namespace = md.namespace.clone();
                    let id = md.id.clone();
                    upserts.spawn(async move {
                        let api: Api<Ingress> = Api::namespaced(client, &namespace);
                        if let Err(e) = api.create(&PostParams::default(), &desired).await {
                            log::error!("failed to create ingress for {}: {}", id, e);
                        }
                    });
                }
                Some(existing) => {
                    log::debug!(
                        "ingress {}/{} found, checking for updates",
                        md.namespace,
                        object_name
                    );

                    if !ingresses_equal(&to_kubernetes_ingress(&md, &self.identifier), &existing) {
                        if self.status_cache.get(&md.id).ingress != Status::Configuring {
                            self.status_cache
                                .set(&md.id, Module::Ingress, Status::Configuring);
                        }

                        let updated = update_ingress(&existing, &md);
                        let client = self.client.clone();
                        let namespace = md.namespace.clone();
                        let id = md.id.clone();
                        upserts.spawn(async move {
                            let api: Api<Ingress> = Api::namespaced(client, &namespace);
                            let name = updated.name_any();
                            if let Err(e) =
                                api.replace(&name, &PostParams::default(), &updated).await
                            {
                                log::error!(
                                    "failed to update ingress {}/{} for {}: {}",
                                    namespace,
                                    name,
                                    id,
                                    e
                                );
                            }
                        });
                    } else if self.status_cache.get(&md.id).ingress != Status::Ready {
                        self.status_cache.set(&md.id, Module::Ingress, Status::Ready);
                    }
                }
            }
        }

        while let Some(result) = upserts.join_next().await {
            if let Err(e) = result {
                log::error!("ingress upsert task failed: {}", e);
            }
        }

        // going through existing ingresses to see which ones should be removed
        let mut reaps = tokio::task::JoinSet::new();
        for existing in self.cache.ingresses() {
            let Some(id) = annotations::deployment_id(existing.metadata.annotations.as_ref())
            else {
                continue;
            };
            if self.cache.has_model_deployment_id(id) {
                continue;
            }

            log::info!(
                "ingress {}/{} not found in model deployments, deleting",
                existing.namespace().unwrap_or_default(),
                existing.name_any()
            );
            self.status_cache.delete(id);

            let client = self.client.clone();
            reaps.spawn(async move {
                let namespace = existing.namespace().unwrap_or_default();
                let name = existing.name_any();
                let api: Api<Ingress> = Api::namespaced(client, &namespace);
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => {
                        log::error!("failed to delete ingress {}/{}: {}", namespace, name, e)
                    }
                }
            });
        }

        while let Some(result) = reaps.join_next().await {
            if let Err(e) = result {
                log::error!("ingress reap task failed: {}", e);
            }
        }

        Ok(())
    }
}

fn ingress_class(md: &ModelDeployment) -> String {
    md.ingress
        .as_ref()
        .map(|i| i.class.clone())
        .unwrap_or_default()
}

fn ingress_host(md: &ModelDeployment) -> String {
    match md.ingress.as_ref() {
        Some(i) if !i.host.is_empty() => i.host.clone(),
        // older gateways only fill the flat field
        _ => md.ingress_host.clone(),
    }
}

fn ingress_spec(md: &ModelDeployment) -> IngressSpec {
    let model_port = md
        .service
        .as_ref()
        .and_then(|s| s.ports.iter().find(|p| p.name == MODEL_HTTP_PORT_NAME))
        .map(|p| p.port)
        .unwrap_or(0);

    IngressSpec {
        rules: Some(vec![IngressRule {
            host: Some(ingress_host(md)),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: deployment_name(md),
                            port: Some(ServiceBackendPort {
                                number: Some(model_port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }]),
        ..Default::default()
    }
}

pub fn to_kubernetes_ingress(md: &ModelDeployment, identifier: &str) -> Ingress {
    let mut metadata = object_metadata(md, identifier);
    let annotations = metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(
        KUBERNETES_INGRESS_CLASS_ANNOTATION.to_string(),
        ingress_class(md),
    );
    if ingress_class(md) == "nginx" {
        annotations.insert(
            "nginx.ingress.kubernetes.io/proxy-body-size".to_string(),
            "100m".to_string(),
        );
    }

    Ingress {
        metadata,
        spec: Some(ingress_spec(md)),
        ..Default::default()
    }
}

/// Field-restricted ingress equality: rule count, class annotation, per-rule
/// host and the (path, backend service, backend port) triples.
pub fn ingresses_equal(desired: &Ingress, existing: &Ingress) -> bool {
    let (Some(desired_annotations), Some(existing_annotations)) = (
        desired.metadata.annotations.as_ref(),
        existing.metadata.annotations.as_ref(),
    ) else {
        return false;
    };

    if desired_annotations.get(KUBERNETES_INGRESS_CLASS_ANNOTATION)
        != existing_annotations.get(KUBERNETES_INGRESS_CLASS_ANNOTATION)
    {
        return false;
    }

    let desired_rules = rules(desired);
    let existing_rules = rules(existing);
    if desired_rules.len() != existing_rules.len() {
        return false;
    }

    for (d, e) in desired_rules.iter().zip(existing_rules.iter()) {
        if d.host.as_deref().unwrap_or("") != e.host.as_deref().unwrap_or("") {
            return false;
        }

        let desired_paths = paths(d);
        let existing_paths = paths(e);
        if desired_paths.len() != existing_paths.len() {
            return false;
        }

        for (dp, ep) in desired_paths.iter().zip(existing_paths.iter()) {
            if dp.path != ep.path {
                return false;
            }
            if backend_service_name(dp) != backend_service_name(ep) {
                return false;
            }
            if backend_service_port(dp) != backend_service_port(ep) {
                return false;
            }
        }
    }

    true
}

fn rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_deref())
        .unwrap_or(&[])
}

fn paths(rule: &IngressRule) -> &[HTTPIngressPath] {
    rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or(&[])
}

fn backend_service_name(path: &HTTPIngressPath) -> Option<&str> {
    path.backend.service.as_ref().map(|s| s.name.as_str())
}

fn backend_service_port(path: &HTTPIngressPath) -> Option<i32> {
    path.backend
        .service
        .as_ref()?
        .port
        .as_ref()?
        .number
}

/// Copies the observed ingress and re-applies the rendered spec and class
/// annotation.
pub fn update_ingress(existing: &Ingress, md: &ModelDeployment) -> Ingress {
    let mut updated = existing.clone();
    updated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            KUBERNETES_INGRESS_CLASS_ANNOTATION.to_string(),
            ingress_class(md),
        );
    updated.spec = Some(ingress_spec(md));
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::deployer::{
        IngressSpec as ModelIngressSpec, ServicePort as ModelServicePort,
        ServiceSpec as ModelServiceSpec,
    };

    fn model_deployment(class: &str) -> ModelDeployment {
        ModelDeployment {
            id: "1111-aa-bb".to_string(),
            namespace: "ns".to_string(),
            name: "cats".to_string(),
            service: Some(ModelServiceSpec {
                r#type: String::new(),
                ports: vec![ModelServicePort {
                    name: "model-http".to_string(),
                    port: 8080,
                    target_port: 8080,
                }],
            }),
            ingress: Some(ModelIngressSpec {
                class: class.to_string(),
                host: "foo.bar.com".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn renders_single_rule_backed_by_derived_service() {
        let rendered = to_kubernetes_ingress(&model_deployment("traefik"), "5555");
        assert_eq!(rendered.metadata.name.as_deref(), Some("ds-cats-1111"));

        let annotations = rendered.metadata.annotations.expect("annotations");
        assert_eq!(
            annotations
                .get(KUBERNETES_INGRESS_CLASS_ANNOTATION)
                .map(String::as_str),
            Some("traefik")
        );
        assert!(!annotations.contains_key("nginx.ingress.kubernetes.io/proxy-body-size"));

        let rules = rendered.spec.expect("spec").rules.expect("rules");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("foo.bar.com"));

        let paths = &rules[0].http.as_ref().expect("http").paths;
        assert_eq!(paths[0].path.as_deref(), Some("/"));
        let backend = paths[0].backend.service.as_ref().expect("backend");
        assert_eq!(backend.name, "ds-cats-1111");
        assert_eq!(
            backend.port.as_ref().and_then(|p| p.number),
            Some(8080)
        );
    }

    #[test]
    fn nginx_class_gets_body_size_override() {
        let rendered = to_kubernetes_ingress(&model_deployment("nginx"), "5555");
        let annotations = rendered.metadata.annotations.expect("annotations");
        assert_eq!(
            annotations
                .get("nginx.ingress.kubernetes.io/proxy-body-size")
                .map(String::as_str),
            Some("100m")
        );
    }

    #[test]
    fn missing_model_http_port_routes_to_zero() {
        let mut md = model_deployment("nginx");
        if let Some(spec) = md.service.as_mut() {
            spec.ports[0].name = "grpc".to_string();
        }
        let rendered = to_kubernetes_ingress(&md, "5555");
        let rules = rendered.spec.expect("spec").rules.expect("rules");
        let backend = rules[0].http.as_ref().expect("http").paths[0]
            .backend
            .service
            .as_ref()
            .expect("backend");
        assert_eq!(backend.port.as_ref().and_then(|p| p.number), Some(0));
    }

    #[test]
    fn rendered_ingress_equals_itself() {
        let md = model_deployment("nginx");
        let desired = to_kubernetes_ingress(&md, "5555");
        let mut observed = to_kubernetes_ingress(&md, "5555");
        observed.metadata.resource_version = Some("3".to_string());
        assert!(ingresses_equal(&desired, &observed));
    }

    #[test]
    fn host_change_breaks_equality() {
        let desired = to_kubernetes_ingress(&model_deployment("nginx"), "5555");
        let mut changed = model_deployment("nginx");
        if let Some(spec) = changed.ingress.as_mut() {
            spec.host = "other.bar.com".to_string();
        }
        let observed = to_kubernetes_ingress(&changed, "5555");
        assert!(!ingresses_equal(&desired, &observed));
    }

    #[test]
    fn class_change_breaks_equality() {
        let desired = to_kubernetes_ingress(&model_deployment("nginx"), "5555");
        let observed = to_kubernetes_ingress(&model_deployment("traefik"), "5555");
        assert!(!ingresses_equal(&desired, &observed));
    }

    #[test]
    fn update_reapplies_spec_and_class() {
        let md = model_deployment("nginx");
        let mut existing = to_kubernetes_ingress(&md, "5555");
        existing.metadata.resource_version = Some("3".to_string());

        let mut changed = md.clone();
        if let Some(spec) = changed.ingress.as_mut() {
            spec.class = "traefik".to_string();
            spec.host = "new.bar.com".to_string();
        }

        let updated = update_ingress(&existing, &changed);
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("3"));
        let annotations = updated.metadata.annotations.expect("annotations");
        assert_eq!(
            annotations
                .get(KUBERNETES_INGRESS_CLASS_ANNOTATION)
                .map(String::as_str),
            Some("traefik")
        );
        let rules = updated.spec.expect("spec").rules.expect("rules");
        assert_eq!(rules[0].host.as_deref(), Some("new.bar.com"));
    }
}
