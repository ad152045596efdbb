//! Out-of-band liveness signals: heartbeats and "peer gone" notices

use std::collections::HashSet;

use dashmap::DashMap;
use nsmesh_core::models::{ClientId, EndpointId};
use tokio::time::{Duration, Instant};

/// One side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Client(ClientId),
    Endpoint(EndpointId),
}

impl Peer {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Client(_) => "client",
            Self::Endpoint(_) => "endpoint",
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(id) => write!(f, "client/{id}"),
            Self::Endpoint(id) => write!(f, "endpoint/{id}"),
        }
    }
}

/// Heartbeat timestamps and orchestration notices, shared by the gRPC
/// handlers (writers) and the liveness probes (readers)
#[derive(Debug, Default)]
pub struct PeerSignals {
    heartbeats: DashMap<Peer, Instant>,
    gone: DashMap<Peer, Instant>,
}

impl PeerSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat; a live peer is no longer gone
    pub fn heartbeat(&self, peer: Peer, now: Instant) {
        self.gone.remove(&peer);
        self.heartbeats.insert(peer, now);
    }

    /// Orchestration reported the peer deleted (pod or node removed)
    pub fn report_gone(&self, peer: Peer, now: Instant) {
        tracing::info!(peer = %peer, "Peer reported gone");
        self.gone.insert(peer, now);
    }

    #[must_use]
    pub fn is_gone(&self, peer: &Peer) -> bool {
        self.gone.contains_key(peer)
    }

    #[must_use]
    pub fn last_heartbeat(&self, peer: &Peer) -> Option<Instant> {
        self.heartbeats.get(peer).map(|at| *at)
    }

    /// Whether the peer's last heartbeat is older than `timeout`.
    /// Peers that never sent one are not considered stale.
    #[must_use]
    pub fn heartbeat_expired(&self, peer: &Peer, timeout: Duration, now: Instant) -> bool {
        self.last_heartbeat(peer)
            .is_some_and(|at| now.saturating_duration_since(at) > timeout)
    }

    /// Drop everything known about a peer, e.g. when it registers afresh
    pub fn forget(&self, peer: &Peer) {
        self.heartbeats.remove(peer);
        self.gone.remove(peer);
    }

    /// Keys are copied out so callers never run while a shard is locked
    fn peers(&self) -> HashSet<Peer> {
        let mut peers: HashSet<Peer> = self.heartbeats.iter().map(|entry| entry.key().clone()).collect();
        peers.extend(self.gone.iter().map(|entry| entry.key().clone()));
        peers
    }

    /// Forget every peer `known` rejects; returns how many were dropped
    pub fn retain_known(&self, known: impl Fn(&Peer) -> bool) -> usize {
        let mut dropped = 0;
        for peer in self.peers().into_iter().filter(|peer| !known(peer)) {
            self.forget(&peer);
            dropped += 1;
        }
        dropped
    }

    /// Number of peers with a recorded signal
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty() && self.gone.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> Peer {
        Peer::Endpoint(EndpointId::from(id))
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_clears_gone() {
        let signals = PeerSignals::new();
        let peer = endpoint("e1");

        signals.report_gone(peer.clone(), Instant::now());
        assert!(signals.is_gone(&peer));

        signals.heartbeat(peer.clone(), Instant::now());
        assert!(!signals.is_gone(&peer));
        assert!(signals.last_heartbeat(&peer).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expiry() {
        let signals = PeerSignals::new();
        let peer = Peer::Client(ClientId::from("c1"));
        let timeout = Duration::from_secs(3);

        assert!(!signals.heartbeat_expired(&peer, timeout, Instant::now()));

        signals.heartbeat(peer.clone(), Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!signals.heartbeat_expired(&peer, timeout, Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(signals.heartbeat_expired(&peer, timeout, Instant::now()));
    }

    #[test]
    fn test_peers_are_distinct_by_kind() {
        let signals = PeerSignals::new();
        signals.report_gone(Peer::Client(ClientId::from("x")), Instant::now());

        assert!(!signals.is_gone(&endpoint("x")));
        assert_eq!(Peer::Client(ClientId::from("x")).to_string(), "client/x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_known_drops_unknown_peers() {
        let signals = PeerSignals::new();
        signals.heartbeat(Peer::Client(ClientId::from("c1")), Instant::now());
        signals.heartbeat(Peer::Client(ClientId::from("c2")), Instant::now());
        signals.report_gone(endpoint("e1"), Instant::now());
        assert_eq!(signals.len(), 3);

        let dropped = signals.retain_known(|peer| peer == &Peer::Client(ClientId::from("c1")));
        assert_eq!(dropped, 2);
        assert_eq!(signals.len(), 1);
        assert!(signals.last_heartbeat(&Peer::Client(ClientId::from("c1"))).is_some());
        assert!(!signals.is_gone(&endpoint("e1")));
    }
}
