//! Liveness prober
//!
//! Periodically checks both sides of every `Active` and `Suspect`
//! connection and reports failures to the healer. The prober never decides
//! recovery and never deduplicates: each failing connection yields one
//! `LivenessEvent` per round.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nsmesh_core::config::{ProbeConfig, ProbeMode};
use nsmesh_core::models::{Connection, FailedSide, Liveness, LivenessEvent};
use nsmesh_core::Result;

use super::connections::ConnectionTable;
use super::signals::{Peer, PeerSignals};

/// What to probe: a peer and, for endpoints, its connect address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub peer: Peer,
    pub address: Option<String>,
}

impl ProbeTarget {
    #[must_use]
    pub fn client_of(conn: &Connection) -> Self {
        Self {
            peer: Peer::Client(conn.client_id.clone()),
            address: None,
        }
    }

    #[must_use]
    pub fn endpoint_of(conn: &Connection) -> Self {
        Self {
            peer: Peer::Endpoint(conn.endpoint_id.clone()),
            address: Some(conn.address.clone()),
        }
    }
}

/// Pluggable liveness check. Errors count as `Dead`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<Liveness>;
}

/// Active probe: TCP connect to the target's address.
///
/// Targets without an address (clients) are judged by peer signals only.
pub struct TcpProbe {
    signals: Arc<PeerSignals>,
    connect_timeout: Duration,
}

impl TcpProbe {
    #[must_use]
    pub const fn new(signals: Arc<PeerSignals>, connect_timeout: Duration) -> Self {
        Self {
            signals,
            connect_timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<Liveness> {
        if self.signals.is_gone(&target.peer) {
            return Ok(Liveness::Dead);
        }

        let Some(address) = &target.address else {
            return Ok(Liveness::Alive);
        };

        let result = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(address.as_str()),
        )
        .await;

        match result {
            Ok(Ok(_)) => Ok(Liveness::Alive),
            Ok(Err(e)) => {
                tracing::debug!(peer = %target.peer, address = %address, "TCP probe failed: {e}");
                Ok(Liveness::Dead)
            }
            Err(_) => Ok(Liveness::Dead),
        }
    }
}

/// Passive probe: peers must keep calling `Heartbeat`
pub struct HeartbeatProbe {
    signals: Arc<PeerSignals>,
    heartbeat_timeout: Duration,
}

impl HeartbeatProbe {
    #[must_use]
    pub const fn new(signals: Arc<PeerSignals>, heartbeat_timeout: Duration) -> Self {
        Self {
            signals,
            heartbeat_timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for HeartbeatProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<Liveness> {
        if self.signals.is_gone(&target.peer)
            || self
                .signals
                .heartbeat_expired(&target.peer, self.heartbeat_timeout, Instant::now())
        {
            return Ok(Liveness::Dead);
        }
        Ok(Liveness::Alive)
    }
}

/// Build the probe selected by configuration
#[must_use]
pub fn probe_for(config: &ProbeConfig, signals: Arc<PeerSignals>) -> Arc<dyn LivenessProbe> {
    match config.mode {
        ProbeMode::Tcp => Arc::new(TcpProbe::new(signals, config.timeout())),
        ProbeMode::Heartbeat => Arc::new(HeartbeatProbe::new(signals, config.heartbeat_timeout())),
    }
}

pub struct Prober {
    table: Arc<ConnectionTable>,
    probe: Arc<dyn LivenessProbe>,
    events: mpsc::Sender<LivenessEvent>,
    config: ProbeConfig,
    cancel_token: CancellationToken,
}

impl Prober {
    #[must_use]
    pub fn new(
        table: Arc<ConnectionTable>,
        probe: Arc<dyn LivenessProbe>,
        events: mpsc::Sender<LivenessEvent>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            table,
            probe,
            events,
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Probe every `Active`/`Suspect` connection once.
    ///
    /// Returns the number of failure events emitted.
    pub async fn probe_once(&self) -> usize {
        let targets = self.table.probe_targets();
        if targets.is_empty() {
            return 0;
        }

        let probe_timeout = self.config.timeout();
        let mut results = stream::iter(targets)
            .map(|conn| {
                let probe = self.probe.clone();
                async move {
                    let client_target = ProbeTarget::client_of(&conn);
                    let endpoint_target = ProbeTarget::endpoint_of(&conn);
                    let (client, endpoint) = tokio::join!(
                        Self::check(probe.as_ref(), &client_target, probe_timeout),
                        Self::check(probe.as_ref(), &endpoint_target, probe_timeout),
                    );
                    (conn, FailedSide::from_probes(client, endpoint))
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1));

        let mut failures = 0;
        while let Some((conn, failed)) = results.next().await {
            let Some(side) = failed else {
                self.table
                    .mark_healthy(&conn.key(), conn.generation, Instant::now());
                continue;
            };

            tracing::debug!(
                client_id = %conn.client_id,
                endpoint_id = %conn.endpoint_id,
                generation = conn.generation,
                side = side.as_str(),
                "Liveness probe failed"
            );

            let event = LivenessEvent::new(conn.key(), conn.generation, side);
            if self.events.send(event).await.is_err() {
                tracing::warn!("Healer is gone; dropping liveness events");
                break;
            }
            failures += 1;
        }

        failures
    }

    /// One probe bounded by `timeout`; errors and timeouts are `Dead`
    async fn check(probe: &dyn LivenessProbe, target: &ProbeTarget, timeout: Duration) -> Liveness {
        match tokio::time::timeout(timeout, probe.probe(target)).await {
            Ok(Ok(liveness)) => liveness,
            Ok(Err(e)) => {
                tracing::debug!(peer = %target.peer, "Probe error counted as dead: {e}");
                Liveness::Dead
            }
            Err(_) => {
                tracing::debug!(peer = %target.peer, "Probe timed out");
                Liveness::Dead
            }
        }
    }

    /// Start the probe loop
    ///
    /// Returns the `JoinHandle`; use `shutdown()` to stop the loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Liveness prober shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
