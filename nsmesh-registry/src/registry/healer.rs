//! Healer control loop
//!
//! The only writer that moves connections past `Suspect`. It consumes
//! liveness events, arms and evaluates suspect deadlines on `tick()`, and
//! performs recovery: rebind to another endpoint of the same service, retry
//! with bounded exponential backoff, or close. Deadlines are stored
//! instants compared on each tick; there is no timer per connection.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashSet;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nsmesh_core::config::HealingConfig;
use nsmesh_core::models::{
    ClientId, CloseReason, Connection, ConnectionKey, ConnectionState, EndpointId, FailedSide,
    Generation, LivenessEvent,
};
use nsmesh_core::Error;

use super::connections::ConnectionTable;
use super::service::RegistryService;
use super::store::RegistryStore;

/// How often deadlines and scheduled attempts are evaluated
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the heal event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable healing outcomes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealEvent {
    Suspected {
        key: ConnectionKey,
        generation: Generation,
        side: FailedSide,
    },
    /// The grace window ended without confirmation
    Recovered {
        key: ConnectionKey,
        generation: Generation,
    },
    HealingStarted {
        key: ConnectionKey,
        generation: Generation,
        side: FailedSide,
    },
    AttemptFailed {
        key: ConnectionKey,
        generation: Generation,
        attempt: u32,
        retry_in: Duration,
    },
    Rebound {
        client_id: ClientId,
        old_endpoint: EndpointId,
        new_endpoint: EndpointId,
        generation: Generation,
    },
    Closed {
        key: ConnectionKey,
        generation: Generation,
        reason: CloseReason,
    },
    EndpointPurged {
        endpoint_id: EndpointId,
    },
}

/// What `Healer::handle_event` did with a liveness event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Unknown connection, closed binding or old generation
    Stale,
    Suspected,
    Confirmed,
    /// Confirmed after the deadline; healing started immediately
    Escalated,
    AlreadyHealing,
}

/// Result of one recovery attempt
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Rebound(Connection),
    Retrying { attempt: u32, retry_in: Duration },
    Closed(CloseReason),
    /// Released or otherwise changed while the attempt was pending
    Cancelled,
    /// Another attempt for the same pair is running
    InFlight,
}

/// Marks a connection key as having an attempt in flight until dropped
struct InFlightGuard<'a> {
    set: &'a DashSet<ConnectionKey>,
    key: ConnectionKey,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a DashSet<ConnectionKey>, key: &ConnectionKey) -> Option<Self> {
        set.insert(key.clone()).then(|| Self {
            set,
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

pub struct Healer {
    service: Arc<RegistryService>,
    table: Arc<ConnectionTable>,
    store: Arc<RegistryStore>,
    config: HealingConfig,
    tick_interval: Duration,
    in_flight: DashSet<ConnectionKey>,
    /// Endpoints confirmed dead, waiting for their last connection to go
    pending_purge: DashSet<EndpointId>,
    events_tx: broadcast::Sender<HealEvent>,
    cancel_token: CancellationToken,
}

impl Healer {
    #[must_use]
    pub fn new(service: Arc<RegistryService>, config: HealingConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            table: service.table().clone(),
            store: service.store().clone(),
            service,
            config,
            tick_interval: DEFAULT_TICK_INTERVAL,
            in_flight: DashSet::new(),
            pending_purge: DashSet::new(),
            events_tx,
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Subscribe to healing outcomes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, event: HealEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    /// Apply one liveness event to the connection it names
    pub async fn handle_event(&self, event: LivenessEvent) -> EventOutcome {
        let key = event.key();
        let now = Instant::now();

        let Some(conn) = self.table.get(&key) else {
            tracing::debug!(connection = %key, generation = event.generation, "Discarding event for closed or unknown connection");
            return EventOutcome::Stale;
        };

        if conn.generation != event.generation {
            tracing::debug!(
                connection = %key,
                event_generation = event.generation,
                current_generation = conn.generation,
                "Discarding stale liveness event"
            );
            return EventOutcome::Stale;
        }

        match conn.state {
            ConnectionState::Active => {
                let deadline = now + self.config.suspect_wait();
                match self.table.mark_suspect(&key, conn.generation, event.side, deadline) {
                    Ok(_) => {
                        tracing::info!(
                            client_id = %key.client_id,
                            endpoint_id = %key.endpoint_id,
                            generation = conn.generation,
                            side = event.side.as_str(),
                            "Connection suspect"
                        );
                        self.publish(HealEvent::Suspected {
                            key,
                            generation: conn.generation,
                            side: event.side,
                        });
                        EventOutcome::Suspected
                    }
                    Err(_) => EventOutcome::Stale,
                }
            }
            ConnectionState::Suspect => {
                let Ok(confirmed) = self.table.confirm(&key, conn.generation, event.side) else {
                    return EventOutcome::Stale;
                };

                let deadline_passed = confirmed
                    .suspect_deadline
                    .is_some_and(|deadline| deadline <= now);
                if !deadline_passed {
                    return EventOutcome::Confirmed;
                }

                if self.enter_healing(&confirmed, now) {
                    self.attempt(&key, confirmed.generation).await;
                    self.purge_dead_endpoints();
                    EventOutcome::Escalated
                } else {
                    EventOutcome::Stale
                }
            }
            ConnectionState::Healing => EventOutcome::AlreadyHealing,
            // Unreachable through the table: closing removes the record
            ConnectionState::Closed => EventOutcome::Stale,
        }
    }

    /// `Suspect` -> `Healing`; an endpoint-side failure also marks the
    /// endpoint dead and queues it for purge
    fn enter_healing(&self, conn: &Connection, now: Instant) -> bool {
        let key = conn.key();
        if self.table.begin_healing(&key, conn.generation, now).is_err() {
            return false;
        }

        let side = conn.failed_side.unwrap_or(FailedSide::Endpoint);
        if side.endpoint_failed() {
            self.store.set_alive(&conn.endpoint_id, false);
            self.pending_purge.insert(conn.endpoint_id.clone());
            tracing::warn!(endpoint_id = %conn.endpoint_id, "Endpoint death confirmed");
        }

        tracing::warn!(
            client_id = %key.client_id,
            endpoint_id = %key.endpoint_id,
            generation = conn.generation,
            side = side.as_str(),
            "Connection failure confirmed, healing"
        );
        self.publish(HealEvent::HealingStarted {
            key,
            generation: conn.generation,
            side,
        });
        true
    }

    /// One recovery attempt for a `Healing` connection
    pub async fn attempt(&self, key: &ConnectionKey, generation: Generation) -> AttemptOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, key) else {
            return AttemptOutcome::InFlight;
        };

        let Some(conn) = self
            .table
            .get(key)
            .filter(|conn| conn.generation == generation && conn.state == ConnectionState::Healing)
        else {
            return AttemptOutcome::Cancelled;
        };

        if !self.config.enabled {
            return self.close(&conn, CloseReason::HealingDisabled);
        }

        if conn.failed_side.is_some_and(FailedSide::client_failed) {
            return self.close(&conn, CloseReason::ClientGone);
        }

        match self.service.rebind(&conn) {
            Ok(rebound) => {
                tracing::info!(
                    client_id = %rebound.client_id,
                    old_endpoint = %conn.endpoint_id,
                    new_endpoint = %rebound.endpoint_id,
                    generation = rebound.generation,
                    "Connection healed"
                );
                self.publish(HealEvent::Rebound {
                    client_id: rebound.client_id.clone(),
                    old_endpoint: conn.endpoint_id.clone(),
                    new_endpoint: rebound.endpoint_id.clone(),
                    generation: rebound.generation,
                });
                AttemptOutcome::Rebound(rebound)
            }
            Err(Error::NotFound(_) | Error::StaleGeneration(_)) => AttemptOutcome::Cancelled,
            Err(e) => self.retry_later(&conn, &e),
        }
    }

    fn retry_later(&self, conn: &Connection, cause: &Error) -> AttemptOutcome {
        let attempt = conn.heal_attempts + 1;
        if attempt >= self.config.max_attempts {
            tracing::warn!(
                client_id = %conn.client_id,
                endpoint_id = %conn.endpoint_id,
                attempts = attempt,
                "Healing exhausted: {cause}"
            );
            return self.close(conn, CloseReason::HealingExhausted);
        }

        let retry_in = self.retry_delay(attempt);
        let key = conn.key();
        match self
            .table
            .record_failed_attempt(&key, conn.generation, Instant::now() + retry_in)
        {
            Ok(_) => {
                tracing::debug!(
                    connection = %key,
                    attempt,
                    retry_in = ?retry_in,
                    "Healing attempt failed: {cause}"
                );
                self.publish(HealEvent::AttemptFailed {
                    key,
                    generation: conn.generation,
                    attempt,
                    retry_in,
                });
                AttemptOutcome::Retrying { attempt, retry_in }
            }
            Err(_) => AttemptOutcome::Cancelled,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, doubling, capped.
    ///
    /// backon scales in floating point; the result is rounded to whole
    /// milliseconds so retries land on the configured schedule.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.config.backoff_ceiling();
        let delay = ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_base())
            .with_max_delay(ceiling)
            .with_factor(2.0)
            .with_max_times(self.config.max_attempts as usize)
            .build()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or(ceiling);

        let millis = (delay.as_micros() + 500) / 1_000;
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)).min(ceiling)
    }

    fn close(&self, conn: &Connection, reason: CloseReason) -> AttemptOutcome {
        let key = conn.key();
        if self.table.close(&key, conn.generation, reason).is_err() {
            return AttemptOutcome::Cancelled;
        }

        tracing::warn!(
            client_id = %key.client_id,
            endpoint_id = %key.endpoint_id,
            generation = conn.generation,
            reason = %reason,
            "Connection closed"
        );
        self.publish(HealEvent::Closed {
            key,
            generation: conn.generation,
            reason,
        });
        AttemptOutcome::Closed(reason)
    }

    /// Evaluate deadlines and run due recovery attempts
    pub async fn tick(&self) {
        let now = Instant::now();

        for conn in self.table.expired_suspects(now) {
            if conn.confirmed {
                self.enter_healing(&conn, now);
            } else if self
                .table
                .restore_active(&conn.key(), conn.generation, now)
                .is_ok()
            {
                tracing::info!(
                    client_id = %conn.client_id,
                    endpoint_id = %conn.endpoint_id,
                    generation = conn.generation,
                    "Suspicion cleared, connection active"
                );
                self.publish(HealEvent::Recovered {
                    key: conn.key(),
                    generation: conn.generation,
                });
            }
        }

        let due: Vec<(ConnectionKey, Generation)> = self
            .table
            .due_for_healing(now)
            .iter()
            .map(|conn| (conn.key(), conn.generation))
            .collect();
        join_all(due.iter().map(|(key, generation)| self.attempt(key, *generation))).await;

        self.purge_dead_endpoints();

        let purged = self.table.purge_tombstones(now);
        if purged > 0 {
            tracing::trace!(purged, "Tombstones expired");
        }

        let forgotten = self.service.prune_signals();
        if forgotten > 0 {
            tracing::trace!(forgotten, "Liveness signals of departed peers dropped");
        }
    }

    /// Unregister dead endpoints that no connection references any more
    fn purge_dead_endpoints(&self) {
        let candidates: Vec<EndpointId> = self.pending_purge.iter().map(|entry| entry.key().clone()).collect();

        for endpoint_id in candidates {
            if self.service.purge_endpoint(&endpoint_id).is_some() {
                tracing::info!(endpoint_id = %endpoint_id, "Dead endpoint purged");
                self.publish(HealEvent::EndpointPurged {
                    endpoint_id: endpoint_id.clone(),
                });
                self.pending_purge.remove(&endpoint_id);
                continue;
            }

            // Keep waiting only while it is dead and still bound
            let still_dead = self.store.get(&endpoint_id).is_some_and(|endpoint| !endpoint.alive);
            if !still_dead {
                self.pending_purge.remove(&endpoint_id);
            }
        }
    }

    /// Start consuming liveness events and ticking
    ///
    /// Returns the `JoinHandle`; use `shutdown()` to stop the loop.
    pub fn start(self: Arc<Self>, mut events: mpsc::Receiver<LivenessEvent>) -> tokio::task::JoinHandle<()> {
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Healer shutting down");
                        return;
                    }
                    event = events.recv(), if events_open => {
                        match event {
                            Some(event) => {
                                self.handle_event(event).await;
                            }
                            None => {
                                tracing::info!("Liveness event channel closed");
                                events_open = false;
                            }
                        }
                    }
                    _ = timer.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
