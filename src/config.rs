use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Runtime configuration, read from the environment.
///
/// The deployer token doubles as the ownership marker for cluster objects:
/// its MD5 hex digest is written to every object the agent creates and
/// checked before the agent touches anything.
#[derive(Debug, Clone)]
pub struct Config {
    /// Token used to authenticate against the gateway.
    pub token: String,
    /// Gateway gRPC endpoint, host:port.
    pub gateway_address: String,
    /// Require TLS on the gateway channel.
    pub require_tls: bool,
    /// Delay before the first reconciliation after startup.
    pub grace_period: Duration,
}

const DEFAULT_GATEWAY_ADDRESS: &str = "gateway.cloud.dotscience.net:8800";

impl Config {
    pub fn from_env() -> AppResult<Config> {
        let token = std::env::var("DEPLOYER_TOKEN")
            .map_err(|_| AppError::Config("DEPLOYER_TOKEN must be set".to_string()))?;
        if token.is_empty() {
            return Err(AppError::Config("DEPLOYER_TOKEN must not be empty".to_string()));
        }

        let gateway_address = std::env::var("GATEWAY_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_GATEWAY_ADDRESS.to_string());

        let require_tls = match std::env::var("REQUIRE_TLS") {
            Ok(v) => parse_bool("REQUIRE_TLS", &v)?,
            Err(_) => true,
        };

        let grace_period = match std::env::var("GRACE_PERIOD") {
            Ok(v) => {
                let seconds: u64 = v.parse().map_err(|_| {
                    AppError::InvalidInput(format!(
                        "GRACE_PERIOD must be a number of seconds, got {:?}",
                        v
                    ))
                })?;
                Duration::from_secs(seconds)
            }
            Err(_) => Duration::from_secs(0),
        };

        Ok(Config {
            token,
            gateway_address,
            require_tls,
            grace_period,
        })
    }

    /// Owner identifier written to managed cluster objects.
    pub fn identifier(&self) -> String {
        format!("{:x}", md5::compute(&self.token))
    }
}

fn parse_bool(key: &str, value: &str) -> AppResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(AppError::InvalidInput(format!(
            "{} must be true or false, got {:?}",
            key, other
        ))),
    }
}
