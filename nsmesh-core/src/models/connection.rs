//! Connection records binding a client to an endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::endpoint::Endpoint;
use super::id::{ClientId, ConnectionKey, EndpointId};
use super::liveness::FailedSide;

/// Per-client binding version; strictly increasing and never reused
pub type Generation = u64;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Suspect,
    Healing,
    /// Terminal label only. Closing removes the record from the connection
    /// table and leaves a tombstone, so no live record is ever `Closed`.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspect => "suspect",
            Self::Healing => "healing",
            Self::Closed => "closed",
        }
    }

    /// States whose two sides are still probed
    #[must_use]
    pub const fn is_probed(self) -> bool {
        matches!(self, Self::Active | Self::Suspect)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client released it
    Released,
    /// Failure confirmed while healing is turned off
    HealingDisabled,
    /// No replacement endpoint within the attempt limit
    HealingExhausted,
    /// The client side died; there is nobody left to reconnect
    ClientGone,
    /// Healing moved the client to another endpoint
    Superseded,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::HealingDisabled => "healing_disabled",
            Self::HealingExhausted => "healing_exhausted",
            Self::ClientGone => "client_gone",
            Self::Superseded => "superseded",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client needs to reach its endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub endpoint_id: EndpointId,
    pub address: String,
    pub generation: Generation,
}

/// Control-plane record of a client bound to an endpoint
#[derive(Debug, Clone)]
pub struct Connection {
    pub client_id: ClientId,
    pub endpoint_id: EndpointId,
    pub service: String,
    pub address: String,
    pub generation: Generation,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_healthy: Instant,
    /// Set while `Suspect`: when the grace window ends
    pub suspect_deadline: Option<Instant>,
    /// A second failure arrived for the same generation while `Suspect`
    pub confirmed: bool,
    /// Accumulated failing side for the current suspicion
    pub failed_side: Option<FailedSide>,
    pub heal_attempts: u32,
    /// Set while `Healing`: earliest time for the next recovery attempt
    pub next_attempt_at: Option<Instant>,
}

impl Connection {
    #[must_use]
    pub fn new(client_id: ClientId, endpoint: &Endpoint, generation: Generation) -> Self {
        Self {
            client_id,
            endpoint_id: endpoint.endpoint_id.clone(),
            service: endpoint.service.clone(),
            address: endpoint.address.clone(),
            generation,
            state: ConnectionState::Active,
            created_at: Utc::now(),
            last_healthy: Instant::now(),
            suspect_deadline: None,
            confirmed: false,
            failed_side: None,
            heal_attempts: 0,
            next_attempt_at: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.client_id.clone(), self.endpoint_id.clone())
    }

    #[must_use]
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            endpoint_id: self.endpoint_id.clone(),
            address: self.address.clone(),
            generation: self.generation,
        }
    }

    /// Reset suspicion bookkeeping, as when the connection becomes `Active` again
    pub fn clear_failure(&mut self) {
        self.suspect_deadline = None;
        self.confirmed = false;
        self.failed_side = None;
        self.heal_attempts = 0;
        self.next_attempt_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(EndpointId::from("e1"), "icmp".to_string(), "10.0.0.1:5000".to_string())
    }

    #[tokio::test]
    async fn test_new_connection_is_active() {
        let conn = Connection::new(ClientId::from("c1"), &endpoint(), 0);

        assert_eq!(conn.state, ConnectionState::Active);
        assert_eq!(conn.generation, 0);
        assert_eq!(conn.service, "icmp");
        assert_eq!(conn.key(), ConnectionKey::new(ClientId::from("c1"), EndpointId::from("e1")));
    }

    #[tokio::test]
    async fn test_descriptor() {
        let conn = Connection::new(ClientId::from("c1"), &endpoint(), 3);
        let descriptor = conn.descriptor();

        assert_eq!(descriptor.endpoint_id.as_str(), "e1");
        assert_eq!(descriptor.address, "10.0.0.1:5000");
        assert_eq!(descriptor.generation, 3);
    }

    #[tokio::test]
    async fn test_clear_failure() {
        let mut conn = Connection::new(ClientId::from("c1"), &endpoint(), 0);
        conn.state = ConnectionState::Suspect;
        conn.suspect_deadline = Some(Instant::now());
        conn.confirmed = true;
        conn.failed_side = Some(FailedSide::Endpoint);
        conn.heal_attempts = 2;

        conn.clear_failure();

        assert!(conn.suspect_deadline.is_none());
        assert!(!conn.confirmed);
        assert!(conn.failed_side.is_none());
        assert_eq!(conn.heal_attempts, 0);
    }

    #[test]
    fn test_probed_states() {
        assert!(ConnectionState::Active.is_probed());
        assert!(ConnectionState::Suspect.is_probed());
        assert!(!ConnectionState::Healing.is_probed());
        assert!(!ConnectionState::Closed.is_probed());
    }
}
