//! Endpoint selection for new and healed connections

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use nsmesh_core::config::SelectionPolicy;
use nsmesh_core::models::{Endpoint, EndpointId};

/// Picks one endpoint out of a candidate list
///
/// Candidates are ordered by endpoint id before choosing, so ties always
/// resolve the same way.
pub struct EndpointSelector {
    policy: SelectionPolicy,
    /// Next round-robin position per service
    cursors: DashMap<String, usize>,
    /// Logical clock of the last time each endpoint was handed out
    last_used: DashMap<EndpointId, u64>,
    clock: AtomicU64,
}

impl EndpointSelector {
    #[must_use]
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            cursors: DashMap::new(),
            last_used: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Choose an endpoint for `service`; `None` when `candidates` is empty
    pub fn select(&self, service: &str, candidates: &[Endpoint]) -> Option<Endpoint> {
        if candidates.is_empty() {
            return None;
        }

        let mut sorted: Vec<&Endpoint> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));

        let chosen = match self.policy {
            SelectionPolicy::RoundRobin => {
                let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
                let index = *cursor % sorted.len();
                let next = cursor.wrapping_add(1);
                *cursor = next;
                sorted[index]
            }
            SelectionPolicy::LeastRecentlyUsed => sorted
                .iter()
                .copied()
                .min_by_key(|endpoint| {
                    let used = self
                        .last_used
                        .get(&endpoint.endpoint_id)
                        .map_or(0, |tick| *tick);
                    (used, endpoint.endpoint_id.clone())
                })?,
        };

        let tick = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_used.insert(chosen.endpoint_id.clone(), tick);

        Some(chosen.clone())
    }

    /// Drop usage history for an endpoint that left the registry
    pub fn forget(&self, endpoint_id: &EndpointId) {
        self.last_used.remove(endpoint_id);
    }
}
