use std::collections::HashSet;
use std::time::Duration;

use crate::api::deployer::{DeployerClient, DeploymentFilter};
use crate::controller::CacheObject;
use crate::error::{AppError, AppResult};
use crate::gateway::GatewayClient;

/// How often the full desired-state list is fetched for reaping.
const LIST_INTERVAL: Duration = Duration::from_secs(60);

impl GatewayClient {
    /// Consumes the server-push stream of desired deployments and inserts
    /// every message into the object cache.
    pub(super) async fn stream_deployments(&self, mut client: DeployerClient) -> AppResult<()> {
        let request = self.request(DeploymentFilter::default());
        let mut stream = client.stream_deployments(request).await?.into_inner();

        log::info!("listening for deployments...");

        while let Some(md) = stream.message().await? {
            log::info!(
                "new deployment received: name={} namespace={} id={}",
                md.name,
                md.namespace,
                md.id
            );
            self.object_cache.insert(CacheObject::ModelDeployment(md));
        }

        Err(AppError::Internal(
            "deployments stream closed by the gateway".to_string(),
        ))
    }

    /// Periodically fetches the full desired-state list. The returned set
    /// defines truth: everything in it is (re)inserted, and any cached
    /// descriptor whose id is missing from it is reaped.
    pub(super) async fn periodic_sync(&self, mut client: DeployerClient) -> AppResult<()> {
        let mut ticker = tokio::time::interval(LIST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let response = match client
                .list_deployments(self.request(DeploymentFilter::default()))
                .await
            {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    if status.message().contains("unauthorized") {
                        return Err(AppError::Rpc(status));
                    }
                    log::error!("failed to retrieve deployments: {}", status);
                    continue;
                }
            };

            let mut configured: HashSet<String> = HashSet::new();
            for md in response.deployments {
                configured.insert(md.id.clone());
                self.object_cache.insert(CacheObject::ModelDeployment(md));
            }

            for cached in self.object_cache.model_deployments() {
                if !configured.contains(&cached.id) {
                    log::info!(
                        "deployment {} ({}/{}) no longer configured, removing from cache",
                        cached.id,
                        cached.namespace,
                        cached.name
                    );
                    self.object_cache
                        .remove(&CacheObject::ModelDeployment(cached));
                }
            }
        }
    }
}
