use std::collections::BTreeMap;

/// Owner identifier: hex MD5 of the deployer token. Cluster objects carry
/// it so the agent can tell its own objects from everybody else's.
pub const ANN_CONTROLLER_IDENTIFIER: &str = "deployer.dotscience.com/identifier";

/// Back-reference to the model deployment id.
pub const ANN_DEPLOYMENT_ID: &str = "deployment";

/// Back-reference to the model deployment logical name.
pub const ANN_DEPLOYMENT_NAME: &str = "name";

pub fn deployer_id(annotations: Option<&BTreeMap<String, String>>) -> Option<&str> {
    annotations?.get(ANN_CONTROLLER_IDENTIFIER).map(String::as_str)
}

pub fn deployment_id(annotations: Option<&BTreeMap<String, String>>) -> Option<&str> {
    annotations?.get(ANN_DEPLOYMENT_ID).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_lookup() {
        let annotations = BTreeMap::from([
            (ANN_CONTROLLER_IDENTIFIER.to_string(), "5555".to_string()),
            (ANN_DEPLOYMENT_ID.to_string(), "1111-aa-bb".to_string()),
        ]);
        assert_eq!(deployer_id(Some(&annotations)), Some("5555"));
        assert_eq!(deployment_id(Some(&annotations)), Some("1111-aa-bb"));
        assert_eq!(deployer_id(None), None);
    }
}
