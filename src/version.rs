use serde::Serialize;

pub const PRODUCT_NAME: &str = "dotscience-deployer";
pub const API_VERSION: &str = "1";

/// Version number that is being run at the moment. Should follow semver.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VersionInfo describes version and runtime info.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
    #[serde(rename = "apiVersion")]
    pub api_version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
}

/// Returns version info for the running binary.
pub fn get_version() -> VersionInfo {
    VersionInfo {
        name: PRODUCT_NAME,
        version: VERSION,
        api_version: API_VERSION,
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}

/// User agent advertised on the gateway connection.
pub fn user_agent() -> String {
    format!("client/ds-deployer-{}", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_serializes_with_api_version_key() {
        let info = get_version();
        let json = serde_json::to_string(&info).expect("version info serializes");
        assert!(json.contains("\"apiVersion\":\"1\""));
        assert!(json.contains(PRODUCT_NAME));
    }
}
