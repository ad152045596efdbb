//! Network service endpoint records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::id::EndpointId;

/// A concrete instance implementing a network service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub endpoint_id: EndpointId,
    /// Name of the network service this endpoint implements
    pub service: String,
    /// Address a client (or the dataplane on its behalf) connects to
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Manager instance that accepted the registration
    #[serde(default)]
    pub manager: String,
    pub registered_at: DateTime<Utc>,
    /// Cleared by the healer once the endpoint's death is confirmed
    #[serde(default = "default_alive")]
    pub alive: bool,
}

const fn default_alive() -> bool {
    true
}

impl Endpoint {
    #[must_use]
    pub fn new(endpoint_id: EndpointId, service: String, address: String) -> Self {
        Self {
            endpoint_id,
            service,
            address,
            labels: BTreeMap::new(),
            manager: String::new(),
            registered_at: Utc::now(),
            alive: true,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    #[must_use]
    pub fn with_manager(mut self, manager: String) -> Self {
        self.manager = manager;
        self
    }

    /// Whether `other` describes the same registration (same id, service and address)
    #[must_use]
    pub fn same_registration(&self, other: &Self) -> bool {
        self.endpoint_id == other.endpoint_id
            && self.service == other.service
            && self.address == other.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = Endpoint::new(
            EndpointId::from("e1"),
            "icmp".to_string(),
            "10.0.0.1:5000".to_string(),
        );

        assert!(endpoint.alive);
        assert!(endpoint.labels.is_empty());
        assert!(endpoint.manager.is_empty());
    }

    #[test]
    fn test_same_registration_ignores_labels() {
        let a = Endpoint::new(EndpointId::from("e1"), "icmp".to_string(), "a:1".to_string());
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "us-east".to_string());
        let b = a.clone().with_labels(labels);
        let c = Endpoint::new(EndpointId::from("e1"), "icmp".to_string(), "b:1".to_string());

        assert!(a.same_registration(&b));
        assert!(!a.same_registration(&c));
    }

    #[test]
    fn test_alive_defaults_when_missing_from_json() {
        let json = r#"{
            "endpoint_id": "e1",
            "service": "icmp",
            "address": "10.0.0.1:5000",
            "registered_at": "2024-01-01T00:00:00Z"
        }"#;

        let endpoint: Endpoint = serde_json::from_str(json).unwrap();
        assert!(endpoint.alive);
        assert_eq!(endpoint.endpoint_id.as_str(), "e1");
    }
}
