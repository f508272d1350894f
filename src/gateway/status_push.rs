use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::deployer::{DeployerClient, UpdateDeploymentRequest};
use crate::error::{AppError, AppResult};
use crate::gateway::{GatewayClient, UPDATE_TIMEOUT};

/// Quiet window over which status notifications are merged before one
/// outbound report is produced.
const QUIET_WINDOW: Duration = Duration::from_millis(1500);

impl GatewayClient {
    /// Subscribes to the status cache and pushes one `UpdateDeployment` per
    /// tracked id whenever a coalesced change fires.
    pub(super) async fn push_status(&self, client: DeployerClient) -> AppResult<()> {
        let (event_tx, event_rx) = mpsc::channel::<u64>(1);
        let (fire_tx, mut fire_rx) = mpsc::channel::<u64>(1);

        let feeder = async {
            let mut last_seen = 0u64;
            loop {
                let notified = self.status_cache.register(last_seen);
                match notified.await {
                    Ok(version) => {
                        last_seen = version;
                        if event_tx.send(version).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        };

        let mut client = client;
        let pusher = async {
            while let Some(version) = fire_rx.recv().await {
                log::info!(
                    "status change detected, updating deployments (version {})",
                    version
                );
                self.update_deployments_status(&mut client).await;
            }
        };

        tokio::select! {
            _ = feeder => {}
            _ = coalesce(event_rx, fire_tx) => {}
            _ = pusher => {}
        }

        Err(AppError::Internal("status pusher stopped".to_string()))
    }

    async fn update_deployments_status(&self, client: &mut DeployerClient) {
        let names: std::collections::HashMap<String, String> = self
            .object_cache
            .model_deployments()
            .into_iter()
            .map(|md| (md.id, md.name))
            .collect();

        for (id, status) in self.status_cache.list() {
            log::info!(
                "updating deployment: id={} status={} replicas={}",
                id,
                status.status(),
                status.available_replicas
            );

            let mut request = self.request(UpdateDeploymentRequest {
                id: id.clone(),
                name: names.get(&id).cloned().unwrap_or_default(),
                status: status.status(),
                available_replicas: status.available_replicas,
            });
            request.set_timeout(UPDATE_TIMEOUT);

            if let Err(e) = client.update_deployment(request).await {
                log::error!("failed to update deployment record: id={} error={}", id, e);
            }
        }
    }
}

/// Merges bursts of events into one: the first event arms a timer, further
/// events within the window replace the payload, and the latest value is
/// delivered when the timer fires.
pub(crate) async fn coalesce(mut rx: mpsc::Receiver<u64>, tx: mpsc::Sender<u64>) {
    loop {
        let Some(mut latest) = rx.recv().await else {
            return;
        };

        let deadline = tokio::time::sleep(QUIET_WINDOW);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(version) => latest = version,
                    None => break,
                }
            }
        }

        if tx.send(latest).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_event_carrying_the_latest_state() {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (fire_tx, mut fire_rx) = mpsc::channel(4);
        tokio::spawn(coalesce(event_rx, fire_tx));

        event_tx.send(1).await.expect("event accepted");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        event_tx.send(2).await.expect("event accepted");
        tokio::task::yield_now().await;

        tokio::time::advance(QUIET_WINDOW).await;
        assert_eq!(fire_rx.recv().await, Some(2));

        // nothing else fires without new events
        tokio::time::advance(QUIET_WINDOW * 2).await;
        assert!(fire_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn events_in_separate_windows_fire_separately() {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (fire_tx, mut fire_rx) = mpsc::channel(4);
        tokio::spawn(coalesce(event_rx, fire_tx));

        event_tx.send(1).await.expect("event accepted");
        tokio::task::yield_now().await;
        tokio::time::advance(QUIET_WINDOW).await;
        assert_eq!(fire_rx.recv().await, Some(1));

        event_tx.send(5).await.expect("event accepted");
        tokio::task::yield_now().await;
        tokio::time::advance(QUIET_WINDOW).await;
        assert_eq!(fire_rx.recv().await, Some(5));
    }
}
