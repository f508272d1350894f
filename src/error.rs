use std::fmt::Write;
use thiserror::Error;

/// Formats an error and its entire source chain with each error on a new line
///
/// This produces output like:
/// ```text
/// Error message
///   Caused by: First cause
///   Caused by: Second cause
///   Caused by: Root cause
/// ```
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    write!(&mut output, "{}", err).ok();

    let mut source = err.source();
    while let Some(err) = source {
        write!(&mut output, "\n  Caused by: {}", err).ok();
        source = err.source();
    }

    output
}

/// Central application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Kubernetes resource not found: {0}")]
    KubernetesNotFound(String),

    /// Gateway transport errors
    #[error("Gateway transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Gateway RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// Authentication rejected by the gateway; fatal
    #[error("deployer authentication failed, check your deployer token")]
    Unauthorized,

    /// Reconciler gate sentinel: the gateway session is down, the cluster
    /// must not be mutated
    #[error("gateway not healthy")]
    GatewayNotHealthy,

    /// Serialization/Deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors with context
    #[error("Internal error: {0}")]
    Internal(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// The gateway reports authentication failures as plain status messages;
    /// match them the way they arrive on the wire.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            AppError::Unauthorized => true,
            other => other.to_string().contains("unauthorized"),
        }
    }
}

// Implement From for common error types that don't have automatic conversion
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_detected_from_rpc_status() {
        let err = AppError::Rpc(tonic::Status::unknown("rpc error: unauthorized"));
        assert!(err.is_unauthorized());

        let err = AppError::Rpc(tonic::Status::unavailable("connection refused"));
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn chain_formatting_includes_causes() {
        let io = std::io::Error::other("socket closed");
        let err = AppError::Io(io);
        let formatted = format_error_chain(&err);
        assert!(formatted.starts_with("I/O error"));
        assert!(formatted.contains("Caused by: socket closed"));
    }
}
