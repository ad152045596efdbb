//! In-memory registry of network services and their endpoints

use std::collections::{BTreeMap, HashMap};

use nsmesh_core::models::{Endpoint, EndpointId};
use nsmesh_core::{Error, Result};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct StoreInner {
    /// service name -> endpoints ordered by id
    services: HashMap<String, BTreeMap<EndpointId, Endpoint>>,
    /// endpoint id -> owning service
    owners: HashMap<EndpointId, String>,
}

/// Concurrency-safe mapping of service name to endpoint set
///
/// Every operation is one critical section. A service whose last endpoint is
/// removed disappears from the map.
#[derive(Debug, Default)]
pub struct RegistryStore {
    inner: RwLock<StoreInner>,
}

impl RegistryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an endpoint into its service's set; an existing id is rejected
    pub fn register(&self, endpoint: Endpoint) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.owners.contains_key(&endpoint.endpoint_id) {
            return Err(Error::DuplicateEndpoint(endpoint.endpoint_id.to_string()));
        }

        inner
            .owners
            .insert(endpoint.endpoint_id.clone(), endpoint.service.clone());
        inner
            .services
            .entry(endpoint.service.clone())
            .or_default()
            .insert(endpoint.endpoint_id.clone(), endpoint);

        Ok(())
    }

    /// Remove an endpoint, returning the removed record
    pub fn unregister(&self, endpoint_id: &EndpointId) -> Result<Endpoint> {
        let mut inner = self.inner.write();

        let service = inner
            .owners
            .remove(endpoint_id)
            .ok_or_else(|| Error::NotFound(format!("endpoint {endpoint_id}")))?;

        let Some(endpoints) = inner.services.get_mut(&service) else {
            return Err(Error::Internal(format!(
                "endpoint {endpoint_id} indexed under missing service {service}"
            )));
        };

        let removed = endpoints.remove(endpoint_id);
        if endpoints.is_empty() {
            inner.services.remove(&service);
        }

        removed.ok_or_else(|| Error::NotFound(format!("endpoint {endpoint_id}")))
    }

    /// Remove an endpoint only if `should_remove` accepts its current record.
    ///
    /// The record is inspected and removed under one write lock, so a
    /// concurrent `set_alive` either happens before the decision or not at
    /// all. `should_remove` may take the connection table lock; the table
    /// never takes this one.
    pub fn unregister_if(
        &self,
        endpoint_id: &EndpointId,
        should_remove: impl FnOnce(&Endpoint) -> bool,
    ) -> Option<Endpoint> {
        let mut inner = self.inner.write();

        let service = inner.owners.get(endpoint_id)?.clone();
        let endpoints = inner.services.get_mut(&service)?;
        if !should_remove(endpoints.get(endpoint_id)?) {
            return None;
        }

        let removed = endpoints.remove(endpoint_id);
        if endpoints.is_empty() {
            inner.services.remove(&service);
        }
        inner.owners.remove(endpoint_id);
        removed
    }

    /// Snapshot of a service's endpoints ordered by endpoint id
    #[must_use]
    pub fn find(&self, service: &str) -> Vec<Endpoint> {
        self.inner
            .read()
            .services
            .get(service)
            .map(|endpoints| endpoints.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, endpoint_id: &EndpointId) -> Option<Endpoint> {
        let inner = self.inner.read();
        let service = inner.owners.get(endpoint_id)?;
        inner.services.get(service)?.get(endpoint_id).cloned()
    }

    /// Update the liveness flag; returns false for unknown endpoints
    pub fn set_alive(&self, endpoint_id: &EndpointId, alive: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(service) = inner.owners.get(endpoint_id).cloned() else {
            return false;
        };

        match inner
            .services
            .get_mut(&service)
            .and_then(|endpoints| endpoints.get_mut(endpoint_id))
        {
            Some(endpoint) => {
                endpoint.alive = alive;
                true
            }
            None => false,
        }
    }

    /// Names of all services with at least one endpoint, sorted
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().owners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-load endpoints, skipping ids that are already present.
    /// Returns how many were inserted.
    pub fn restore(&self, endpoints: Vec<Endpoint>) -> usize {
        let mut restored = 0;
        for endpoint in endpoints {
            let endpoint_id = endpoint.endpoint_id.clone();
            match self.register(endpoint) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::debug!(endpoint_id = %endpoint_id, "Skipping restored endpoint: {e}");
                }
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, service: &str) -> Endpoint {
        Endpoint::new(EndpointId::from(id), service.to_string(), format!("{id}.local:5000"))
    }

    #[test]
    fn test_register_and_find() {
        let store = RegistryStore::new();
        store.register(endpoint("e2", "icmp")).unwrap();
        store.register(endpoint("e1", "icmp")).unwrap();
        store.register(endpoint("v1", "vpn")).unwrap();

        let found = store.find("icmp");
        let ids: Vec<&str> = found.iter().map(|e| e.endpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.services(), vec!["icmp".to_string(), "vpn".to_string()]);
    }

    #[test]
    fn test_duplicate_id_rejected_across_services() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();

        let err = store.register(endpoint("e1", "vpn")).unwrap_err();
        assert!(matches!(err, Error::DuplicateEndpoint(_)));
        assert!(store.find("vpn").is_empty());
    }

    #[test]
    fn test_unregister_removes_empty_service() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();

        let removed = store.unregister(&EndpointId::from("e1")).unwrap();
        assert_eq!(removed.endpoint_id.as_str(), "e1");
        assert!(store.find("icmp").is_empty());
        assert!(store.services().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unregister_unknown() {
        let store = RegistryStore::new();
        let err = store.unregister(&EndpointId::from("missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_find_returns_snapshot() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();

        let snapshot = store.find("icmp");
        store.register(endpoint("e2", "icmp")).unwrap();
        store.unregister(&EndpointId::from("e1")).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].endpoint_id.as_str(), "e1");
    }

    #[test]
    fn test_set_alive() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();

        assert!(store.set_alive(&EndpointId::from("e1"), false));
        assert!(!store.get(&EndpointId::from("e1")).unwrap().alive);
        assert!(!store.set_alive(&EndpointId::from("missing"), false));
    }

    #[test]
    fn test_unregister_if_checks_current_record() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();
        let e1 = EndpointId::from("e1");

        assert!(store.unregister_if(&e1, |e| !e.alive).is_none());
        assert!(store.get(&e1).is_some());

        store.set_alive(&e1, false);
        let removed = store.unregister_if(&e1, |e| !e.alive).unwrap();
        assert_eq!(removed.endpoint_id, e1);
        assert!(store.is_empty());
        assert!(store.services().is_empty());

        assert!(store.unregister_if(&e1, |_| true).is_none());
    }

    #[test]
    fn test_restore_skips_duplicates() {
        let store = RegistryStore::new();
        store.register(endpoint("e1", "icmp")).unwrap();

        let restored = store.restore(vec![endpoint("e1", "icmp"), endpoint("e2", "icmp")]);
        assert_eq!(restored, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_no_resurrection_after_unregister() {
        let store = RegistryStore::new();
        for round in 0..5 {
            store.register(endpoint("e1", "icmp")).unwrap();
            if round % 2 == 0 {
                store.register(endpoint("e2", "icmp")).unwrap();
            }
            store.unregister(&EndpointId::from("e1")).unwrap();

            assert!(store
                .find("icmp")
                .iter()
                .all(|e| e.endpoint_id.as_str() != "e1"));

            let _ = store.unregister(&EndpointId::from("e2"));
        }
    }
}
