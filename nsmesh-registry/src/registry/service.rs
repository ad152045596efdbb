//! Registry service: the operations behind the gRPC surface
//!
//! Translates requests into registry store and connection table operations
//! and applies the endpoint selection policy. Validation failures are
//! returned immediately; nothing here retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use nsmesh_core::config::SelectionPolicy;
use nsmesh_core::models::{ClientId, Connection, ConnectionKey, Endpoint, EndpointId, Generation};
use nsmesh_core::validation::{
    AddressValidator, IdValidator, LabelsValidator, ServiceNameValidator, Validator,
};
use nsmesh_core::{Error, Result};
use tokio::time::Instant;

use super::connections::{ConnectionTable, Opened, Rejection, ReleaseOutcome};
use super::persistence::EndpointPersistence;
use super::selector::EndpointSelector;
use super::signals::{Peer, PeerSignals};
use super::store::RegistryStore;

/// Endpoint registration input
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistration {
    /// Caller-chosen id; a nanoid is assigned when absent or empty
    pub endpoint_id: Option<String>,
    pub service: String,
    pub address: String,
    pub labels: BTreeMap<String, String>,
}

/// Result of `RegistryService::register_endpoint`
#[derive(Debug, Clone)]
pub struct Registration {
    pub endpoint: Endpoint,
    /// The identical endpoint was already registered; nothing changed
    pub already_registered: bool,
}

pub struct RegistryService {
    store: Arc<RegistryStore>,
    table: Arc<ConnectionTable>,
    signals: Arc<PeerSignals>,
    selector: EndpointSelector,
    persistence: Option<Arc<dyn EndpointPersistence>>,
    manager_name: String,
}

impl RegistryService {
    #[must_use]
    pub fn new(
        store: Arc<RegistryStore>,
        table: Arc<ConnectionTable>,
        signals: Arc<PeerSignals>,
        selection: SelectionPolicy,
        manager_name: String,
    ) -> Self {
        Self {
            store,
            table,
            signals,
            selector: EndpointSelector::new(selection),
            persistence: None,
            manager_name,
        }
    }

    /// Mirror registrations into a durable backend
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn EndpointPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    #[must_use]
    pub const fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    #[must_use]
    pub const fn signals(&self) -> &Arc<PeerSignals> {
        &self.signals
    }

    #[must_use]
    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    /// Load persisted endpoints into the store; returns how many were restored
    pub async fn restore(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };

        let endpoints = persistence.load_all().await?;
        let total = endpoints.len();
        let restored = self.store.restore(endpoints);

        tracing::info!(restored, total, "Restored endpoints from persistence");
        Ok(restored)
    }

    pub async fn register_endpoint(&self, request: EndpointRegistration) -> Result<Registration> {
        let mut validator = Validator::new();
        validator
            .validate_field(ServiceNameValidator::new().validate(&request.service))
            .validate_field(AddressValidator::validate(&request.address))
            .validate_field(LabelsValidator::validate(&request.labels));
        if let Some(id) = request.endpoint_id.as_deref().filter(|id| !id.is_empty()) {
            validator.validate_field(IdValidator::new("endpoint_id").validate(id));
        }
        validator.into_result()?;

        let endpoint_id = request
            .endpoint_id
            .filter(|id| !id.is_empty())
            .map_or_else(EndpointId::new, EndpointId::from_string);

        let endpoint = Endpoint::new(endpoint_id.clone(), request.service, request.address)
            .with_labels(request.labels)
            .with_manager(self.manager_name.clone());

        match self.store.register(endpoint.clone()) {
            Ok(()) => {}
            Err(Error::DuplicateEndpoint(_)) => {
                return self.reregister(&endpoint);
            }
            Err(e) => return Err(e),
        }

        self.signals.forget(&Peer::Endpoint(endpoint_id.clone()));
        self.persist(&endpoint).await;

        tracing::info!(
            endpoint_id = %endpoint.endpoint_id,
            service = %endpoint.service,
            address = %endpoint.address,
            "Endpoint registered"
        );

        Ok(Registration {
            endpoint,
            already_registered: false,
        })
    }

    /// Identical re-registration is a no-op (reviving a dead endpoint);
    /// anything else reusing the id is a conflict
    fn reregister(&self, endpoint: &Endpoint) -> Result<Registration> {
        let existing = self
            .store
            .get(&endpoint.endpoint_id)
            .filter(|existing| existing.same_registration(endpoint))
            .ok_or_else(|| {
                Error::DuplicateEndpoint(format!(
                    "endpoint {} is registered with a different service or address",
                    endpoint.endpoint_id
                ))
            })?;

        if !existing.alive {
            self.store.set_alive(&existing.endpoint_id, true);
            tracing::info!(endpoint_id = %existing.endpoint_id, "Endpoint re-registered after failure");
        }
        self.signals.forget(&Peer::Endpoint(existing.endpoint_id.clone()));

        Ok(Registration {
            endpoint: Endpoint {
                alive: true,
                ..existing
            },
            already_registered: true,
        })
    }

    /// Remove an endpoint. Connections still bound to it fail their next
    /// liveness check and are healed like any other endpoint failure.
    pub async fn unregister_endpoint(&self, endpoint_id: &str) -> Result<Endpoint> {
        IdValidator::new("endpoint_id").validate(endpoint_id)?;
        let endpoint_id = EndpointId::from(endpoint_id);

        let removed = self.store.unregister(&endpoint_id)?;
        self.selector.forget(&endpoint_id);
        self.signals
            .report_gone(Peer::Endpoint(endpoint_id.clone()), Instant::now());

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove(&endpoint_id).await {
                tracing::warn!(endpoint_id = %endpoint_id, "Failed to remove persisted endpoint: {e}");
            }
        }

        tracing::info!(
            endpoint_id = %removed.endpoint_id,
            service = %removed.service,
            bound_connections = self.table.references(&endpoint_id),
            "Endpoint unregistered"
        );
        Ok(removed)
    }

    /// Remove an endpoint whose death has been confirmed, provided it is
    /// still dead and no connection references it. Only the healer calls
    /// this.
    ///
    /// Returns `None` when the endpoint is gone, alive again or still bound.
    /// The persisted copy is deleted in the background.
    pub fn purge_endpoint(&self, endpoint_id: &EndpointId) -> Option<Endpoint> {
        let removed = self.store.unregister_if(endpoint_id, |endpoint| {
            !endpoint.alive && self.table.references(endpoint_id) == 0
        })?;
        self.selector.forget(endpoint_id);
        self.signals.forget(&Peer::Endpoint(endpoint_id.clone()));

        if let Some(persistence) = self.persistence.clone() {
            let endpoint_id = endpoint_id.clone();
            tokio::spawn(async move {
                if let Err(e) = persistence.remove(&endpoint_id).await {
                    tracing::warn!(endpoint_id = %endpoint_id, "Failed to remove persisted endpoint: {e}");
                }
            });
        }

        Some(removed)
    }

    async fn persist(&self, endpoint: &Endpoint) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(endpoint).await {
                tracing::warn!(endpoint_id = %endpoint.endpoint_id, "Failed to persist endpoint: {e}");
            }
        }
    }

    /// All endpoints of a service, ordered by id
    pub fn find_network_service(&self, service: &str) -> Result<Vec<Endpoint>> {
        ServiceNameValidator::new().validate(service)?;
        Ok(self.store.find(service))
    }

    /// Bind `client_id` to an endpoint of `service`.
    ///
    /// A client holds at most one live connection per service: asking again
    /// (or racing another request) returns the connection that already exists.
    pub fn request_connection(&self, service: &str, client_id: &str) -> Result<Connection> {
        let mut validator = Validator::new();
        validator
            .validate_field(ServiceNameValidator::new().validate(service))
            .validate_field(IdValidator::new("client_id").validate(client_id));
        validator.into_result()?;

        let client_id = ClientId::from(client_id);
        self.signals.forget(&Peer::Client(client_id.clone()));

        if let Some(existing) = self.table.find_live(&client_id, service) {
            return Ok(existing);
        }

        let candidates = self.usable_endpoints(service, None);
        let chosen = self
            .selector
            .select(service, &candidates)
            .ok_or_else(|| Error::NoEndpointsAvailable(service.to_string()))?;

        match self.table.open(&client_id, &chosen) {
            Opened::Created(conn) => {
                tracing::info!(
                    client_id = %conn.client_id,
                    endpoint_id = %conn.endpoint_id,
                    service = %conn.service,
                    generation = conn.generation,
                    "Connection opened"
                );
                Ok(conn)
            }
            Opened::Existing(conn) => Ok(conn),
        }
    }

    /// Alive endpoints of `service`, minus `exclude` and peers reported gone
    fn usable_endpoints(&self, service: &str, exclude: Option<&EndpointId>) -> Vec<Endpoint> {
        self.store
            .find(service)
            .into_iter()
            .filter(|endpoint| endpoint.alive)
            .filter(|endpoint| Some(&endpoint.endpoint_id) != exclude)
            .filter(|endpoint| {
                !self
                    .signals
                    .is_gone(&Peer::Endpoint(endpoint.endpoint_id.clone()))
            })
            .collect()
    }

    pub fn release_connection(
        &self,
        client_id: &str,
        endpoint_id: &str,
        generation: Generation,
    ) -> Result<ReleaseOutcome> {
        let mut validator = Validator::new();
        validator
            .validate_field(IdValidator::new("client_id").validate(client_id))
            .validate_field(IdValidator::new("endpoint_id").validate(endpoint_id));
        validator.into_result()?;

        let key = ConnectionKey::new(ClientId::from(client_id), EndpointId::from(endpoint_id));
        let outcome = self.table.release(&key, generation)?;

        match &outcome {
            ReleaseOutcome::Released(conn) => tracing::info!(
                client_id = %conn.client_id,
                endpoint_id = %conn.endpoint_id,
                generation = conn.generation,
                "Connection released"
            ),
            ReleaseOutcome::AlreadyClosed(reason) => tracing::debug!(
                connection = %key,
                generation,
                reason = %reason,
                "Release of already closed connection"
            ),
        }

        Ok(outcome)
    }

    /// Move a `Healing` connection to another alive endpoint of its service.
    /// Only the healer calls this.
    pub fn rebind(&self, conn: &Connection) -> Result<Connection> {
        let candidates = self.usable_endpoints(&conn.service, Some(&conn.endpoint_id));
        let replacement = self
            .selector
            .select(&conn.service, &candidates)
            .ok_or_else(|| Error::NoEndpointsAvailable(conn.service.clone()))?;

        let key = conn.key();
        self.table
            .rebind(&key, conn.generation, &replacement)
            .map_err(|rejection| match rejection {
                Rejection::Missing => Error::NotFound(format!("connection {key}")),
                other => Error::StaleGeneration(format!(
                    "connection {key} generation {}: {other}",
                    conn.generation
                )),
            })
    }

    /// Live connections, optionally only those of one client
    #[must_use]
    pub fn list_connections(&self, client_id: Option<&str>) -> Vec<Connection> {
        match client_id.filter(|id| !id.is_empty()) {
            Some(id) => self.table.for_client(&ClientId::from(id)),
            None => self.table.snapshot(),
        }
    }

    pub fn heartbeat(&self, peer: Peer) -> Result<()> {
        Self::validate_peer(&peer)?;
        self.signals.heartbeat(peer, Instant::now());
        Ok(())
    }

    pub fn report_peer_gone(&self, peer: Peer) -> Result<()> {
        Self::validate_peer(&peer)?;
        self.signals.report_gone(peer, Instant::now());
        Ok(())
    }

    /// Drop liveness signals of peers the registry no longer tracks: clients
    /// without a live connection, and endpoints that are neither registered
    /// nor still bound. Returns how many peers were dropped.
    pub fn prune_signals(&self) -> usize {
        self.signals.retain_known(|peer| match peer {
            Peer::Client(id) => self.table.has_client(id),
            Peer::Endpoint(id) => self.store.get(id).is_some() || self.table.references(id) > 0,
        })
    }

    fn validate_peer(peer: &Peer) -> Result<()> {
        match peer {
            Peer::Client(id) => IdValidator::new("client_id").validate(id.as_str())?,
            Peer::Endpoint(id) => IdValidator::new("endpoint_id").validate(id.as_str())?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::persistence::MockEndpointPersistence;
    use crate::registry::prober::{Prober, TcpProbe};
    use nsmesh_core::config::ProbeConfig;
    use nsmesh_core::models::{CloseReason, ConnectionState, FailedSide};
    use std::time::Duration;

    fn service() -> RegistryService {
        RegistryService::new(
            Arc::new(RegistryStore::new()),
            Arc::new(ConnectionTable::new(Duration::from_secs(10))),
            Arc::new(PeerSignals::new()),
            SelectionPolicy::RoundRobin,
            "nsm-test".to_string(),
        )
    }

    fn registration(id: &str, service: &str, address: &str) -> EndpointRegistration {
        EndpointRegistration {
            endpoint_id: Some(id.to_string()),
            service: service.to_string(),
            address: address.to_string(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_manager() {
        let svc = service();
        let registration = svc
            .register_endpoint(EndpointRegistration {
                service: "icmp".to_string(),
                address: "10.0.0.1:5000".to_string(),
                ..EndpointRegistration::default()
            })
            .await
            .unwrap();

        assert!(!registration.already_registered);
        assert_eq!(registration.endpoint.endpoint_id.as_str().len(), 12);
        assert_eq!(registration.endpoint.manager, "nsm-test");
        assert_eq!(svc.find_network_service("icmp").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let svc = service();
        let err = svc
            .register_endpoint(registration("e1", "", "nowhere"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(svc.store().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000"))
            .await
            .unwrap();

        let again = svc
            .register_endpoint(registration("e1", "icmp", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert!(again.already_registered);

        let conflict = svc
            .register_endpoint(registration("e1", "icmp", "10.0.0.2:5000"))
            .await
            .unwrap_err();
        assert!(matches!(conflict, Error::DuplicateEndpoint(_)));
        assert_eq!(svc.store().len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_revives_endpoint() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000"))
            .await
            .unwrap();
        svc.store().set_alive(&EndpointId::from("e1"), false);

        let again = svc
            .register_endpoint(registration("e1", "icmp", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert!(again.endpoint.alive);
        assert!(svc.store().get(&EndpointId::from("e1")).unwrap().alive);
    }

    #[tokio::test]
    async fn test_request_connection_without_endpoints() {
        let svc = service();
        let err = svc.request_connection("icmp", "c1").unwrap_err();
        assert!(matches!(err, Error::NoEndpointsAvailable(name) if name == "icmp"));
    }

    #[tokio::test]
    async fn test_request_connection_skips_dead_and_gone() {
        let svc = service();
        for (id, addr) in [("e1", "10.0.0.1:5000"), ("e2", "10.0.0.2:5000"), ("e3", "10.0.0.3:5000")] {
            svc.register_endpoint(registration(id, "icmp", addr)).await.unwrap();
        }
        svc.store().set_alive(&EndpointId::from("e1"), false);
        svc.report_peer_gone(Peer::Endpoint(EndpointId::from("e2"))).unwrap();

        let conn = svc.request_connection("icmp", "c1").unwrap();
        assert_eq!(conn.endpoint_id.as_str(), "e3");
    }

    #[tokio::test]
    async fn test_request_connection_is_stable_per_client() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        svc.register_endpoint(registration("e2", "icmp", "10.0.0.2:5000")).await.unwrap();

        let first = svc.request_connection("icmp", "c1").unwrap();
        let second = svc.request_connection("icmp", "c1").unwrap();
        assert_eq!(first.endpoint_id, second.endpoint_id);
        assert_eq!(first.generation, second.generation);

        // Round-robin continues for other clients
        let other = svc.request_connection("icmp", "c2").unwrap();
        assert_ne!(other.endpoint_id, first.endpoint_id);
    }

    #[tokio::test]
    async fn test_release_twice() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        let conn = svc.request_connection("icmp", "c1").unwrap();

        let first = svc.release_connection("c1", "e1", conn.generation).unwrap();
        assert!(matches!(first, ReleaseOutcome::Released(_)));

        let second = svc.release_connection("c1", "e1", conn.generation).unwrap();
        assert!(matches!(second, ReleaseOutcome::AlreadyClosed(CloseReason::Released)));
        assert!(svc.list_connections(None).is_empty());
    }

    #[tokio::test]
    async fn test_rebind_excludes_failed_endpoint() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        let conn = svc.request_connection("icmp", "c1").unwrap();
        let key = conn.key();
        let now = Instant::now();
        svc.table().mark_suspect(&key, 0, FailedSide::Endpoint, now).unwrap();
        let healing = svc.table().begin_healing(&key, 0, now).unwrap();

        let err = svc.rebind(&healing).unwrap_err();
        assert!(matches!(err, Error::NoEndpointsAvailable(_)));

        svc.register_endpoint(registration("e2", "icmp", "10.0.0.2:5000")).await.unwrap();
        let rebound = svc.rebind(&healing).unwrap();
        assert_eq!(rebound.endpoint_id.as_str(), "e2");
        assert_eq!(rebound.generation, 1);
        assert_eq!(rebound.state, ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_unregister_unknown_endpoint() {
        let svc = service();
        assert!(matches!(
            svc.unregister_endpoint("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            svc.unregister_endpoint("").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_fails_bound_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", &address)).await.unwrap();
        svc.register_endpoint(registration("e2", "icmp", "10.0.0.2:5000")).await.unwrap();
        let conn = svc.request_connection("icmp", "c1").unwrap();
        assert_eq!(conn.endpoint_id.as_str(), "e1");

        svc.unregister_endpoint("e1").await.unwrap();
        assert!(svc.signals().is_gone(&Peer::Endpoint(EndpointId::from("e1"))));

        // e1 still accepts TCP, but it is no longer registered
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let prober = Prober::new(
            svc.table().clone(),
            Arc::new(TcpProbe::new(svc.signals().clone(), Duration::from_secs(1))),
            tx,
            ProbeConfig::default(),
        );
        assert_eq!(prober.probe_once().await, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key(), conn.key());
        assert_eq!(event.side, FailedSide::Endpoint);

        // Registering the id again starts from a clean slate
        svc.register_endpoint(registration("e1", "icmp", &address)).await.unwrap();
        assert!(!svc.signals().is_gone(&Peer::Endpoint(EndpointId::from("e1"))));
    }

    #[tokio::test]
    async fn test_purge_requires_dead_and_unbound() {
        let svc = service();
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        let e1 = EndpointId::from("e1");

        // Alive
        assert!(svc.purge_endpoint(&e1).is_none());

        // Dead but still bound
        let conn = svc.request_connection("icmp", "c1").unwrap();
        svc.store().set_alive(&e1, false);
        assert!(svc.purge_endpoint(&e1).is_none());

        svc.release_connection("c1", "e1", conn.generation).unwrap();
        let purged = svc.purge_endpoint(&e1).unwrap();
        assert_eq!(purged.endpoint_id, e1);
        assert!(svc.store().is_empty());
        assert!(svc.purge_endpoint(&e1).is_none());
    }

    #[tokio::test]
    async fn test_purge_removes_persisted_copy() {
        let mut persistence = MockEndpointPersistence::new();
        persistence.expect_save().returning(|_| Ok(()));
        persistence.expect_remove().times(1).returning(|_| Ok(()));
        let persistence = Arc::new(persistence);

        let svc = service().with_persistence(persistence.clone());
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        svc.store().set_alive(&EndpointId::from("e1"), false);
        assert!(svc.purge_endpoint(&EndpointId::from("e1")).is_some());

        // Let the background delete run
        while Arc::strong_count(&persistence) > 2 {
            tokio::task::yield_now().await;
        }
        drop(svc);
        Arc::try_unwrap(persistence).ok().unwrap().checkpoint();
    }

    #[tokio::test]
    async fn test_persistence_is_mirrored() {
        let mut persistence = MockEndpointPersistence::new();
        persistence.expect_save().times(1).returning(|_| Ok(()));
        persistence.expect_remove().times(1).returning(|_| Ok(()));

        let svc = service().with_persistence(Arc::new(persistence));
        svc.register_endpoint(registration("e1", "icmp", "10.0.0.1:5000")).await.unwrap();
        svc.unregister_endpoint("e1").await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_registration() {
        let mut persistence = MockEndpointPersistence::new();
        persistence
            .expect_save()
            .returning(|_| Err(Error::Persistence("redis down".to_string())));

        let svc = service().with_persistence(Arc::new(persistence));
        let registration = svc
            .register_endpoint(registration("e1", "icmp", "10.0.0.1:5000"))
            .await
            .unwrap();
        assert!(!registration.already_registered);
        assert_eq!(svc.store().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_from_persistence() {
        let mut persistence = MockEndpointPersistence::new();
        persistence.expect_load_all().returning(|| {
            Ok(vec![
                Endpoint::new(EndpointId::from("e1"), "icmp".to_string(), "10.0.0.1:5000".to_string()),
                Endpoint::new(EndpointId::from("e2"), "icmp".to_string(), "10.0.0.2:5000".to_string()),
            ])
        });

        let svc = service().with_persistence(Arc::new(persistence));
        assert_eq!(svc.restore().await.unwrap(), 2);
        assert_eq!(svc.find_network_service("icmp").unwrap().len(), 2);
    }
}
