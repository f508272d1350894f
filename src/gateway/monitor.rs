use std::time::Duration;

use tonic::transport::Channel;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::error::{AppError, AppResult};
use crate::gateway::GatewayClient;

const PROBE_INTERVAL: Duration = Duration::from_millis(800);
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Consecutive probe failures tolerated before the session is torn down.
const FAILURE_LIMIT: u32 = 3;

impl GatewayClient {
    /// Probes the gateway's standard health endpoint for as long as the
    /// session lives; returning an error collapses the session and forces
    /// a re-dial.
    pub(super) async fn monitor(&self, channel: Channel) -> AppResult<()> {
        let mut health = HealthClient::new(channel);
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut failures: u32 = 0;
        loop {
            ticker.tick().await;

            let mut request = tonic::Request::new(HealthCheckRequest {
                service: String::new(),
            });
            request.set_timeout(PROBE_DEADLINE);

            match health.check(request).await {
                Ok(_) => failures = 0,
                Err(status) => {
                    failures += 1;
                    log::error!(
                        "gateway healthcheck failed ({}/{}): {}",
                        failures,
                        FAILURE_LIMIT,
                        status
                    );
                    if failures >= FAILURE_LIMIT {
                        return Err(AppError::Internal(
                            "gateway health probe failed repeatedly".to_string(),
                        ));
                    }
                }
            }
        }
    }
}
