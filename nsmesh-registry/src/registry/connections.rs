//! Connection table: live client/endpoint bindings and their health state
//!
//! All bookkeeping sits behind one mutex so every transition is a single
//! critical section. Mutations used by the healer are guarded: they name
//! the generation and state they expect and refuse to act otherwise. A
//! release therefore cancels an in-flight heal simply by removing the record.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use nsmesh_core::models::{
    ClientId, CloseReason, Connection, ConnectionKey, ConnectionState, Endpoint, EndpointId,
    FailedSide, Generation,
};
use nsmesh_core::{Error, Result};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Memory of a binding that is no longer live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub generation: Generation,
    pub reason: CloseReason,
    pub closed_at: Instant,
}

/// Why a guarded mutation was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No live record under the key (never existed, closed or superseded)
    Missing,
    /// The record carries a different generation than the caller expected
    GenerationMismatch { current: Generation },
    /// The record is live but not in the state the mutation requires
    WrongState(ConnectionState),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("no live connection"),
            Self::GenerationMismatch { current } => {
                write!(f, "generation mismatch (current {current})")
            }
            Self::WrongState(state) => write!(f, "connection is {state}"),
        }
    }
}

pub type Guarded<T> = std::result::Result<T, Rejection>;

/// Result of `ConnectionTable::open`
#[derive(Debug, Clone)]
pub enum Opened {
    Created(Connection),
    /// The client already held a live connection for the service
    Existing(Connection),
}

impl Opened {
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        match self {
            Self::Created(conn) | Self::Existing(conn) => conn,
        }
    }

    #[must_use]
    pub fn into_connection(self) -> Connection {
        match self {
            Self::Created(conn) | Self::Existing(conn) => conn,
        }
    }
}

/// Result of `ConnectionTable::release`
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released(Connection),
    /// Closed earlier; releasing again changes nothing
    AlreadyClosed(CloseReason),
}

#[derive(Debug, Default)]
struct TableInner {
    records: HashMap<ConnectionKey, Connection>,
    by_client: HashMap<ClientId, BTreeSet<EndpointId>>,
    tombstones: HashMap<ConnectionKey, Tombstone>,
    /// Next generation to issue per client; entries are never removed
    next_generation: HashMap<ClientId, Generation>,
}

impl TableInner {
    fn issue_generation(&mut self, client_id: &ClientId) -> Generation {
        let next = self.next_generation.entry(client_id.clone()).or_insert(0);
        let generation = *next;
        *next += 1;
        generation
    }

    fn insert(&mut self, conn: Connection) {
        let key = conn.key();
        self.tombstones.remove(&key);
        self.by_client
            .entry(conn.client_id.clone())
            .or_default()
            .insert(conn.endpoint_id.clone());
        self.records.insert(key, conn);
    }

    fn remove(&mut self, key: &ConnectionKey, reason: CloseReason) -> Option<Connection> {
        let conn = self.records.remove(key)?;

        if let Some(endpoints) = self.by_client.get_mut(&key.client_id) {
            endpoints.remove(&key.endpoint_id);
            if endpoints.is_empty() {
                self.by_client.remove(&key.client_id);
            }
        }

        self.tombstones.insert(
            key.clone(),
            Tombstone {
                generation: conn.generation,
                reason,
                closed_at: Instant::now(),
            },
        );

        Some(conn)
    }

    fn guarded(
        &mut self,
        key: &ConnectionKey,
        generation: Generation,
        expected: &[ConnectionState],
    ) -> Guarded<&mut Connection> {
        let conn = self.records.get_mut(key).ok_or(Rejection::Missing)?;
        if conn.generation != generation {
            return Err(Rejection::GenerationMismatch {
                current: conn.generation,
            });
        }
        if !expected.contains(&conn.state) {
            return Err(Rejection::WrongState(conn.state));
        }
        Ok(conn)
    }
}

/// Concurrency-safe store of connection records keyed by (client, endpoint)
/// with a secondary index by client
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
    tombstone_ttl: Duration,
}

impl ConnectionTable {
    #[must_use]
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            tombstone_ttl,
        }
    }

    /// Create an `Active` connection unless the client already holds a live
    /// one for the endpoint's service, in which case that one is returned.
    pub fn open(&self, client_id: &ClientId, endpoint: &Endpoint) -> Opened {
        let mut inner = self.inner.lock();

        if let Some(existing) = Self::live_for_service(&inner, client_id, &endpoint.service) {
            return Opened::Existing(existing);
        }

        let key = ConnectionKey::new(client_id.clone(), endpoint.endpoint_id.clone());
        if let Some(existing) = inner.records.get(&key) {
            return Opened::Existing(existing.clone());
        }

        let generation = inner.issue_generation(client_id);
        let conn = Connection::new(client_id.clone(), endpoint, generation);
        inner.insert(conn.clone());

        Opened::Created(conn)
    }

    fn live_for_service(
        inner: &TableInner,
        client_id: &ClientId,
        service: &str,
    ) -> Option<Connection> {
        inner.by_client.get(client_id)?.iter().find_map(|endpoint_id| {
            inner
                .records
                .get(&ConnectionKey::new(client_id.clone(), endpoint_id.clone()))
                .filter(|conn| conn.service == service)
                .cloned()
        })
    }

    #[must_use]
    pub fn get(&self, key: &ConnectionKey) -> Option<Connection> {
        self.inner.lock().records.get(key).cloned()
    }

    #[must_use]
    pub fn tombstone(&self, key: &ConnectionKey) -> Option<Tombstone> {
        self.inner.lock().tombstones.get(key).copied()
    }

    /// The client's live connection for `service`, if any
    #[must_use]
    pub fn find_live(&self, client_id: &ClientId, service: &str) -> Option<Connection> {
        Self::live_for_service(&self.inner.lock(), client_id, service)
    }

    #[must_use]
    pub fn for_client(&self, client_id: &ClientId) -> Vec<Connection> {
        let inner = self.inner.lock();
        inner
            .by_client
            .get(client_id)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter_map(|endpoint_id| {
                        inner
                            .records
                            .get(&ConnectionKey::new(client_id.clone(), endpoint_id.clone()))
                            .cloned()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All live connections ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut conns: Vec<Connection> = self.inner.lock().records.values().cloned().collect();
        conns.sort_by(|a, b| {
            (&a.client_id, &a.endpoint_id).cmp(&(&b.client_id, &b.endpoint_id))
        });
        conns
    }

    /// Connections the prober should check (`Active` and `Suspect`)
    #[must_use]
    pub fn probe_targets(&self) -> Vec<Connection> {
        self.select(|conn| conn.state.is_probed())
    }

    /// `Suspect` connections whose grace window has ended
    #[must_use]
    pub fn expired_suspects(&self, now: Instant) -> Vec<Connection> {
        self.select(|conn| {
            conn.state == ConnectionState::Suspect
                && conn.suspect_deadline.is_some_and(|deadline| deadline <= now)
        })
    }

    /// `Healing` connections whose next recovery attempt is due
    #[must_use]
    pub fn due_for_healing(&self, now: Instant) -> Vec<Connection> {
        self.select(|conn| {
            conn.state == ConnectionState::Healing
                && conn.next_attempt_at.is_none_or(|at| at <= now)
        })
    }

    fn select(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Connection> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|conn| predicate(conn))
            .cloned()
            .collect()
    }

    /// Record a passing probe; no state change
    pub fn mark_healthy(&self, key: &ConnectionKey, generation: Generation, now: Instant) {
        let mut inner = self.inner.lock();
        if let Ok(conn) = inner.guarded(key, generation, &[ConnectionState::Active]) {
            conn.last_healthy = now;
        }
    }

    /// `Active` -> `Suspect`, arming the grace deadline
    pub fn mark_suspect(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        side: FailedSide,
        deadline: Instant,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.guarded(key, generation, &[ConnectionState::Active])?;

        conn.state = ConnectionState::Suspect;
        conn.suspect_deadline = Some(deadline);
        conn.confirmed = false;
        conn.failed_side = Some(side);

        Ok(conn.clone())
    }

    /// A further failure for a `Suspect` connection confirms the suspicion
    pub fn confirm(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        side: FailedSide,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.guarded(key, generation, &[ConnectionState::Suspect])?;

        conn.confirmed = true;
        conn.failed_side = Some(conn.failed_side.map_or(side, |prev| prev.merge(side)));

        Ok(conn.clone())
    }

    /// `Suspect` -> `Active` after an unconfirmed grace window
    pub fn restore_active(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        now: Instant,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.guarded(key, generation, &[ConnectionState::Suspect])?;

        conn.state = ConnectionState::Active;
        conn.clear_failure();
        conn.last_healthy = now;

        Ok(conn.clone())
    }

    /// `Suspect` -> `Healing`, first attempt due immediately
    pub fn begin_healing(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        now: Instant,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.guarded(key, generation, &[ConnectionState::Suspect])?;

        conn.state = ConnectionState::Healing;
        conn.suspect_deadline = None;
        conn.heal_attempts = 0;
        conn.next_attempt_at = Some(now);

        Ok(conn.clone())
    }

    /// Count a failed recovery attempt and schedule the next one
    pub fn record_failed_attempt(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        next_attempt_at: Instant,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        let conn = inner.guarded(key, generation, &[ConnectionState::Healing])?;

        conn.heal_attempts += 1;
        conn.next_attempt_at = Some(next_attempt_at);

        Ok(conn.clone())
    }

    /// Move a `Healing` connection to `replacement` under a new generation.
    ///
    /// The old binding is tombstoned as superseded. Fails if the connection
    /// was released (or otherwise left `Healing`) in the meantime.
    pub fn rebind(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        replacement: &Endpoint,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        inner.guarded(key, generation, &[ConnectionState::Healing])?;

        let new_key = ConnectionKey::new(key.client_id.clone(), replacement.endpoint_id.clone());
        if let Some(occupant) = inner.records.get(&new_key) {
            return Err(Rejection::WrongState(occupant.state));
        }

        let old = inner
            .remove(key, CloseReason::Superseded)
            .ok_or(Rejection::Missing)?;

        let new_generation = inner.issue_generation(&key.client_id);
        let mut conn = Connection::new(key.client_id.clone(), replacement, new_generation);
        conn.created_at = old.created_at;
        inner.insert(conn.clone());

        Ok(conn)
    }

    /// Close a live connection regardless of its state
    pub fn close(
        &self,
        key: &ConnectionKey,
        generation: Generation,
        reason: CloseReason,
    ) -> Guarded<Connection> {
        let mut inner = self.inner.lock();
        inner.guarded(
            key,
            generation,
            &[
                ConnectionState::Active,
                ConnectionState::Suspect,
                ConnectionState::Healing,
            ],
        )?;

        inner.remove(key, reason).ok_or(Rejection::Missing)
    }

    /// Client-initiated close.
    ///
    /// Releasing an already-closed binding reports `AlreadyClosed`; naming a
    /// generation that healing has replaced is `StaleGeneration`.
    pub fn release(&self, key: &ConnectionKey, generation: Generation) -> Result<ReleaseOutcome> {
        let mut inner = self.inner.lock();

        if let Some(current) = inner.records.get(key).map(|conn| conn.generation) {
            return match generation.cmp(&current) {
                std::cmp::Ordering::Equal => inner
                    .remove(key, CloseReason::Released)
                    .map(ReleaseOutcome::Released)
                    .ok_or_else(|| Error::NotFound(format!("connection {key}"))),
                std::cmp::Ordering::Less => Err(Error::StaleGeneration(format!(
                    "connection {key} is at generation {current}, not {generation}"
                ))),
                std::cmp::Ordering::Greater => Err(Error::NotFound(format!(
                    "connection {key} generation {generation}"
                ))),
            };
        }

        match inner.tombstones.get(key) {
            Some(tomb) if tomb.generation == generation => match tomb.reason {
                CloseReason::Superseded => Err(Error::StaleGeneration(format!(
                    "connection {key} generation {generation} was superseded by healing"
                ))),
                reason => Ok(ReleaseOutcome::AlreadyClosed(reason)),
            },
            Some(tomb) if generation < tomb.generation => Err(Error::StaleGeneration(format!(
                "connection {key} generation {generation} is older than {}",
                tomb.generation
            ))),
            _ => Err(Error::NotFound(format!(
                "connection {key} generation {generation}"
            ))),
        }
    }

    /// Number of live connections bound to `endpoint_id`
    #[must_use]
    pub fn references(&self, endpoint_id: &EndpointId) -> usize {
        self.inner
            .lock()
            .records
            .keys()
            .filter(|key| &key.endpoint_id == endpoint_id)
            .count()
    }

    /// Whether the client holds any live connection
    #[must_use]
    pub fn has_client(&self, client_id: &ClientId) -> bool {
        self.inner.lock().by_client.contains_key(client_id)
    }

    /// Forget tombstones older than the configured TTL
    pub fn purge_tombstones(&self, now: Instant) -> usize {
        let ttl = self.tombstone_ttl;
        let mut inner = self.inner.lock();
        let before = inner.tombstones.len();
        inner
            .tombstones
            .retain(|_, tomb| now.saturating_duration_since(tomb.closed_at) < ttl);
        before - inner.tombstones.len()
    }

    /// The generation the client's next binding will receive
    #[must_use]
    pub fn next_generation(&self, client_id: &ClientId) -> Generation {
        self.inner
            .lock()
            .next_generation
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> Endpoint {
        Endpoint::new(EndpointId::from(id), "icmp".to_string(), format!("{id}:5000"))
    }

    fn client() -> ClientId {
        ClientId::from("c1".to_string())
    }

    fn table() -> ConnectionTable {
        ConnectionTable::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_open_is_first_writer_wins() {
        let table = table();

        let first = table.open(&client(), &endpoint("e1"));
        assert!(matches!(first, Opened::Created(_)));
        assert_eq!(first.connection().generation, 0);

        let second = table.open(&client(), &endpoint("e2"));
        assert!(matches!(second, Opened::Existing(_)));
        assert_eq!(second.connection().endpoint_id.as_str(), "e1");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_other_service_gets_own_connection() {
        let table = table();
        table.open(&client(), &endpoint("e1"));

        let vpn = Endpoint::new(EndpointId::from("v1"), "vpn".to_string(), "v1:5000".to_string());
        let opened = table.open(&client(), &vpn);

        assert!(matches!(opened, Opened::Created(_)));
        assert_eq!(opened.connection().generation, 1);
        assert_eq!(table.for_client(&client()).len(), 2);
    }

    #[tokio::test]
    async fn test_state_machine_to_rebind() {
        let table = table();
        let conn = table.open(&client(), &endpoint("e1")).into_connection();
        let key = conn.key();
        let now = Instant::now();

        table.mark_suspect(&key, 0, FailedSide::Endpoint, now).unwrap();
        let confirmed = table.confirm(&key, 0, FailedSide::Endpoint).unwrap();
        assert!(confirmed.confirmed);

        let healing = table.begin_healing(&key, 0, now).unwrap();
        assert_eq!(healing.state, ConnectionState::Healing);
        assert!(table.probe_targets().is_empty());

        let rebound = table.rebind(&key, 0, &endpoint("e2")).unwrap();
        assert_eq!(rebound.state, ConnectionState::Active);
        assert_eq!(rebound.generation, 1);
        assert_eq!(rebound.endpoint_id.as_str(), "e2");

        assert!(table.get(&key).is_none());
        let tomb = table.tombstone(&key).unwrap();
        assert_eq!(tomb.reason, CloseReason::Superseded);
        assert_eq!(tomb.generation, 0);
    }

    #[tokio::test]
    async fn test_guard_rejections() {
        let table = table();
        let conn = table.open(&client(), &endpoint("e1")).into_connection();
        let key = conn.key();

        assert_eq!(
            table.confirm(&key, 0, FailedSide::Endpoint).unwrap_err(),
            Rejection::WrongState(ConnectionState::Active)
        );
        assert_eq!(
            table
                .mark_suspect(&key, 7, FailedSide::Endpoint, Instant::now())
                .unwrap_err(),
            Rejection::GenerationMismatch { current: 0 }
        );

        let missing = ConnectionKey::new(client(), EndpointId::from("nope"));
        assert_eq!(
            table.restore_active(&missing, 0, Instant::now()).unwrap_err(),
            Rejection::Missing
        );
    }

    #[tokio::test]
    async fn test_release_cancels_healing() {
        let table = table();
        let key = table.open(&client(), &endpoint("e1")).into_connection().key();
        let now = Instant::now();

        table.mark_suspect(&key, 0, FailedSide::Endpoint, now).unwrap();
        table.begin_healing(&key, 0, now).unwrap();

        assert!(matches!(
            table.release(&key, 0).unwrap(),
            ReleaseOutcome::Released(_)
        ));
        assert_eq!(
            table.rebind(&key, 0, &endpoint("e2")).unwrap_err(),
            Rejection::Missing
        );
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let table = table();
        let key = table.open(&client(), &endpoint("e1")).into_connection().key();

        assert!(matches!(table.release(&key, 0).unwrap(), ReleaseOutcome::Released(_)));
        assert!(matches!(
            table.release(&key, 0).unwrap(),
            ReleaseOutcome::AlreadyClosed(CloseReason::Released)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_release_superseded_generation_is_stale() {
        let table = table();
        let key = table.open(&client(), &endpoint("e1")).into_connection().key();
        let now = Instant::now();
        table.mark_suspect(&key, 0, FailedSide::Endpoint, now).unwrap();
        table.begin_healing(&key, 0, now).unwrap();
        let rebound = table.rebind(&key, 0, &endpoint("e2")).unwrap();

        assert!(matches!(table.release(&key, 0), Err(Error::StaleGeneration(_))));
        assert!(matches!(
            table.release(&rebound.key(), 1).unwrap(),
            ReleaseOutcome::Released(_)
        ));
    }

    #[tokio::test]
    async fn test_release_unknown_is_not_found() {
        let table = table();
        let key = ConnectionKey::new(client(), EndpointId::from("e1"));
        assert!(matches!(table.release(&key, 0), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_generations_survive_close() {
        let table = table();
        let key = table.open(&client(), &endpoint("e1")).into_connection().key();
        table.release(&key, 0).unwrap();

        let reopened = table.open(&client(), &endpoint("e1")).into_connection();
        assert_eq!(reopened.generation, 1);
        assert!(table.tombstone(&key).is_none());
        assert_eq!(table.next_generation(&client()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_tombstones_after_ttl() {
        let table = table();
        let key = table.open(&client(), &endpoint("e1")).into_connection().key();
        table.release(&key, 0).unwrap();

        assert_eq!(table.purge_tombstones(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.purge_tombstones(Instant::now()), 1);
        assert!(matches!(table.release(&key, 0), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_references() {
        let table = table();
        table.open(&client(), &endpoint("e1"));
        table.open(&ClientId::from("c2".to_string()), &endpoint("e1"));

        assert_eq!(table.references(&EndpointId::from("e1")), 2);
        assert_eq!(table.references(&EndpointId::from("e2")), 0);
    }

    #[tokio::test]
    async fn test_closed_bindings_leave_the_table() {
        let table = table();
        let released = table.open(&client(), &endpoint("e1")).into_connection();
        let c2 = ClientId::from("c2".to_string());
        let closed = table.open(&c2, &endpoint("e1")).into_connection();

        table.release(&released.key(), 0).unwrap();
        table
            .close(&closed.key(), closed.generation, CloseReason::ClientGone)
            .unwrap();

        // Closed lives on only in the tombstone
        assert!(table.get(&released.key()).is_none());
        assert!(table.get(&closed.key()).is_none());
        assert!(table.snapshot().iter().all(|conn| conn.state != ConnectionState::Closed));
        assert!(!table.has_client(&client()));
        assert!(!table.has_client(&c2));
        assert_eq!(table.tombstone(&closed.key()).unwrap().reason, CloseReason::ClientGone);
    }
}
