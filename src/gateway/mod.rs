//! Gateway client: subscribes to the control plane over gRPC, feeds the
//! desired state into the object cache, answers log requests and pushes
//! coalesced status updates back.

pub mod deployments;
pub mod logs;
pub mod monitor;
pub mod status_push;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig};
use tokio_util::sync::CancellationToken;

use crate::api::deployer::{DeployerClient, UpdateDeployerRequest};
use crate::controller::{HealthModule, KubernetesCache, PodLogsGetter, StatusCache};
use crate::error::{format_error_chain, AppError, AppResult};
use crate::version;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct GatewayOpts {
    pub addr: String,
    pub token: String,
    pub require_tls: bool,
}

/// Long-lived gateway session driver.
///
/// Dials the gateway, runs the streaming session, and re-dials with
/// exponential backoff on any transient failure. Authentication failures
/// are fatal. `ok()` reports whether a session is currently healthy; the
/// reconciler refuses to mutate the cluster while it is not.
pub struct GatewayClient {
    opts: GatewayOpts,
    token_meta: AsciiMetadataValue,
    version_meta: AsciiMetadataValue,

    object_cache: Arc<KubernetesCache>,
    status_cache: Arc<StatusCache>,
    pod_logs: Arc<dyn PodLogsGetter>,

    connected: AtomicBool,
}

impl HealthModule for GatewayClient {
    fn ok(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl GatewayClient {
    pub fn new(
        opts: GatewayOpts,
        object_cache: Arc<KubernetesCache>,
        status_cache: Arc<StatusCache>,
        pod_logs: Arc<dyn PodLogsGetter>,
    ) -> AppResult<GatewayClient> {
        let token_meta: AsciiMetadataValue = opts
            .token
            .parse()
            .map_err(|_| AppError::Config("deployer token is not valid metadata".to_string()))?;
        let version_meta: AsciiMetadataValue = version::VERSION
            .parse()
            .map_err(|_| AppError::Config("version is not valid metadata".to_string()))?;

        Ok(GatewayClient {
            opts,
            token_meta,
            version_meta,
            object_cache,
            status_cache,
            pod_logs,
            connected: AtomicBool::new(false),
        })
    }

    /// Attaches the per-request credentials: every RPC carries the deployer
    /// token and the agent version.
    pub(super) fn decorate(&self, metadata: &mut MetadataMap) {
        metadata.insert("token", self.token_meta.clone());
        metadata.insert("version", self.version_meta.clone());
    }

    pub(super) fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        self.decorate(request.metadata_mut());
        request
    }

    /// Runs the connect/stream/reconnect state machine until `stop` is
    /// cancelled or an authentication failure makes retrying pointless.
    pub async fn start(&self, stop: CancellationToken) -> AppResult<()> {
        let mut backoff = Duration::ZERO;

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            self.connected.store(false, Ordering::SeqCst);

            let channel = match self.dial().await {
                Ok(channel) => channel,
                Err(e) => {
                    log::error!("dial failed: {}", format_error_chain(&e));
                    backoff = exp_backoff(backoff, MAX_BACKOFF);
                    log::warn!("reconnecting in {:?}...", backoff);
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            log::info!("connected to gateway at {}", self.opts.addr);
            self.connected.store(true, Ordering::SeqCst);
            backoff = Duration::ZERO;

            let client = DeployerClient::new(channel.clone());
            self.announce(client.clone()).await;

            let result = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                r = self.stream_deployments(client.clone()) => r,
                r = self.periodic_sync(client.clone()) => r,
                r = self.stream_log_requests(client.clone()) => r,
                r = self.push_status(client.clone()) => r,
                r = self.monitor(channel) => r,
            };

            self.connected.store(false, Ordering::SeqCst);

            match result {
                Err(e) if e.is_unauthorized() => {
                    log::error!("{}", AppError::Unauthorized);
                    return Err(AppError::Unauthorized);
                }
                Err(e) => {
                    log::error!("gateway session failed: {}", format_error_chain(&e));
                }
                Ok(()) => {
                    log::warn!("gateway session ended");
                }
            }

            backoff = exp_backoff(backoff, MAX_BACKOFF);
            log::warn!("reconnecting in {:?}...", backoff);
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn dial(&self) -> AppResult<Channel> {
        let scheme = if self.opts.require_tls { "https" } else { "http" };
        let uri = format!("{}://{}", scheme, self.opts.addr);

        let mut endpoint = Channel::from_shared(uri)
            .map_err(|e| AppError::Config(format!("invalid gateway address: {}", e)))?
            .user_agent(version::user_agent())
            .map_err(|e| AppError::Config(format!("invalid user agent: {}", e)))?
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(Some(KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(DIAL_TIMEOUT)
            .keep_alive_while_idle(true);

        if self.opts.require_tls {
            log::info!("TLS connection requirement set");
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }

        Ok(endpoint.connect().await?)
    }

    /// One-shot identity announce after connecting; failures are logged and
    /// otherwise ignored.
    async fn announce(&self, mut client: DeployerClient) {
        let mut request = self.request(UpdateDeployerRequest {
            name: version::PRODUCT_NAME.to_string(),
            version: version::VERSION.to_string(),
            cluster: String::new(),
        });
        request.set_timeout(UPDATE_TIMEOUT);

        if let Err(e) = client.update_deployer(request).await {
            log::warn!("failed to announce deployer to the gateway: {}", e);
        }
    }
}

/// Doubling backoff: zero goes to one second, anything past half the cap
/// goes to the cap.
pub(crate) fn exp_backoff(prev: Duration, max: Duration) -> Duration {
    if prev.is_zero() {
        Duration::from_secs(1)
    } else if prev > max / 2 {
        max
    } else {
        prev * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let max = Duration::from_secs(10);
        let mut backoff = Duration::ZERO;

        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(1));
        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(2));
        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(4));
        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(8));
        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(10));
        backoff = exp_backoff(backoff, max);
        assert_eq!(backoff, Duration::from_secs(10));
    }

    #[test]
    fn backoff_resets_via_zero() {
        let max = Duration::from_secs(10);
        assert_eq!(exp_backoff(Duration::ZERO, max), Duration::from_secs(1));
    }
}
