use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::controller::cache::KubernetesCache;
use crate::controller::status::StatusCache;
use crate::error::{format_error_chain, AppError, AppResult};

/// How often a full sync runs regardless of cache activity.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Narrow capability interface over the gateway client: the reconciler only
/// needs to know whether the control plane is reachable before it is
/// allowed to mutate the cluster.
pub trait HealthModule: Send + Sync {
    fn ok(&self) -> bool;
}

/// Reconciler drives the cluster towards the cached desired state.
///
/// It wakes on cache changes and on a periodic tick; each wake runs one
/// `sync` which diffs desired against observed for workloads, services and
/// ingresses, issues the necessary create/update/delete calls, and records
/// per-module status.
pub struct Reconciler {
    pub(super) client: Client,
    pub(super) cache: Arc<KubernetesCache>,
    pub(super) status_cache: Arc<StatusCache>,
    pub(super) gateway: Arc<dyn HealthModule>,
    pub(super) identifier: String,
    grace_period: Duration,
}

impl Reconciler {
    pub fn new(
        client: Client,
        cache: Arc<KubernetesCache>,
        status_cache: Arc<StatusCache>,
        gateway: Arc<dyn HealthModule>,
        identifier: impl Into<String>,
        grace_period: Duration,
    ) -> Reconciler {
        Reconciler {
            client,
            cache,
            status_cache,
            gateway,
            identifier: identifier.into(),
            grace_period,
        }
    }

    /// Continuous reconciliation loop; returns when `stop` is cancelled.
    pub async fn start(&self, stop: CancellationToken) -> AppResult<()> {
        if !self.grace_period.is_zero() {
            log::info!(
                "waiting {}s before first reconciliation",
                self.grace_period.as_secs()
            );
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.grace_period) => {}
            }
        }

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + SYNC_INTERVAL,
            SYNC_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_seen = 0u64;
        loop {
            let notified = self.cache.register(last_seen);
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                version = notified => {
                    let Ok(version) = version else { continue };
                    last_seen = version;
                    match self.sync().await {
                        Ok(()) => {
                            log::info!(
                                "cache changes detected, synchronized at version {}",
                                version
                            );
                        }
                        Err(e) => self.log_sync_error(&e),
                    }
                }
                _ = ticker.tick() => {
                    log::debug!("periodic sync");
                    if let Err(e) = self.sync().await {
                        self.log_sync_error(&e);
                    }
                }
            }
        }
    }

    fn log_sync_error(&self, err: &AppError) {
        match err {
            // expected while the gateway is reconnecting, the cluster is
            // deliberately left alone
            AppError::GatewayNotHealthy => {
                log::debug!("gateway not healthy, skipping reconciliation")
            }
            other => log::error!(
                "failed to process deployment diff: {}",
                format_error_chain(other)
            ),
        }
    }

    /// Runs one desired/observed diff across the three modules. Guarded by
    /// the gateway gate: with the control plane unreachable the desired set
    /// may be empty or stale and deleting cluster objects would be wrong.
    pub async fn sync(&self) -> AppResult<()> {
        if !self.gateway.ok() {
            return Err(AppError::GatewayNotHealthy);
        }

        if let Err(e) = self.synchronize_deployments().await {
            log::error!(
                "failed to synchronize deployments: {}",
                format_error_chain(&e)
            );
        }

        if let Err(e) = self.synchronize_services().await {
            log::error!("failed to synchronize services: {}", format_error_chain(&e));
        }

        if let Err(e) = self.synchronize_ingresses().await {
            log::error!("failed to synchronize ingresses: {}", format_error_chain(&e));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::controller::annotations::{ANN_CONTROLLER_IDENTIFIER, ANN_DEPLOYMENT_ID};
    use crate::controller::cache::CacheObject;

    struct DownGateway;

    impl HealthModule for DownGateway {
        fn ok(&self) -> bool {
            false
        }
    }

    struct UpGateway;

    impl HealthModule for UpGateway {
        fn ok(&self) -> bool {
            true
        }
    }

    fn offline_client() -> Client {
        // lazy client, no connection is made until a request is issued
        let config = kube::Config::new(
            "http://127.0.0.1:8080"
                .parse::<http::Uri>()
                .expect("valid uri"),
        );
        Client::try_from(config).expect("client builds")
    }

    fn owned_workload(identifier: &str, id: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("ds-cats-1111".to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(BTreeMap::from([
                    (ANN_CONTROLLER_IDENTIFIER.to_string(), identifier.to_string()),
                    (ANN_DEPLOYMENT_ID.to_string(), id.to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn closed_gate_returns_sentinel_without_touching_anything() {
        let cache = Arc::new(KubernetesCache::new("5555"));
        // an orphaned observed workload that an unguarded sync would reap
        assert!(cache.insert(CacheObject::Deployment(owned_workload("5555", "1111-aa-bb"))));

        let status_cache = Arc::new(StatusCache::new());
        let reconciler = Reconciler::new(
            offline_client(),
            cache.clone(),
            status_cache.clone(),
            Arc::new(DownGateway),
            "5555",
            Duration::ZERO,
        );

        let err = reconciler.sync().await.expect_err("gate is closed");
        assert!(matches!(err, AppError::GatewayNotHealthy));

        // the observed object survived and no status entry was created
        assert_eq!(cache.deployments().len(), 1);
        assert!(status_cache.list().is_empty());
    }

    #[tokio::test]
    async fn open_gate_with_empty_caches_is_a_noop() {
        let cache = Arc::new(KubernetesCache::new("5555"));
        let status_cache = Arc::new(StatusCache::new());
        let reconciler = Reconciler::new(
            offline_client(),
            cache,
            status_cache.clone(),
            Arc::new(UpGateway),
            "5555",
            Duration::ZERO,
        );

        reconciler.sync().await.expect("nothing to do");
        assert!(status_cache.list().is_empty());
    }
}
