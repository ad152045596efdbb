//! Liveness signals exchanged between the prober and the healer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::Generation;
use super::id::{ClientId, ConnectionKey, EndpointId};

/// Result of a single liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

impl Liveness {
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Which side of a connection failed its probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedSide {
    Client,
    Endpoint,
    Both,
}

impl FailedSide {
    /// Build from the two probe outcomes; `None` when both sides are alive
    #[must_use]
    pub const fn from_probes(client: Liveness, endpoint: Liveness) -> Option<Self> {
        match (client, endpoint) {
            (Liveness::Alive, Liveness::Alive) => None,
            (Liveness::Dead, Liveness::Alive) => Some(Self::Client),
            (Liveness::Alive, Liveness::Dead) => Some(Self::Endpoint),
            (Liveness::Dead, Liveness::Dead) => Some(Self::Both),
        }
    }

    /// Combine two observations of the same connection
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Client, Self::Client) => Self::Client,
            (Self::Endpoint, Self::Endpoint) => Self::Endpoint,
            _ => Self::Both,
        }
    }

    #[must_use]
    pub const fn client_failed(self) -> bool {
        matches!(self, Self::Client | Self::Both)
    }

    #[must_use]
    pub const fn endpoint_failed(self) -> bool {
        matches!(self, Self::Endpoint | Self::Both)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Endpoint => "endpoint",
            Self::Both => "both",
        }
    }
}

/// A failed probe for one connection binding
///
/// Not persisted; consumed once by the healer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessEvent {
    pub client_id: ClientId,
    pub endpoint_id: EndpointId,
    pub generation: Generation,
    pub side: FailedSide,
    pub observed_at: DateTime<Utc>,
}

impl LivenessEvent {
    #[must_use]
    pub fn new(key: ConnectionKey, generation: Generation, side: FailedSide) -> Self {
        Self {
            client_id: key.client_id,
            endpoint_id: key.endpoint_id,
            generation,
            side,
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.client_id.clone(), self.endpoint_id.clone())
    }
}
