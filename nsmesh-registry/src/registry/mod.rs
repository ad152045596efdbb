//! Network service registry and connection healing

pub mod connections;
pub mod healer;
pub mod persistence;
pub mod prober;
pub mod selector;
pub mod service;
pub mod signals;
pub mod store;

pub use connections::{ConnectionTable, Opened, Rejection, ReleaseOutcome, Tombstone};
pub use healer::{AttemptOutcome, EventOutcome, HealEvent, Healer};
pub use persistence::{EndpointPersistence, RedisPersistence};
pub use prober::{probe_for, HeartbeatProbe, LivenessProbe, ProbeTarget, Prober, TcpProbe};
pub use selector::EndpointSelector;
pub use service::{EndpointRegistration, Registration, RegistryService};
pub use signals::{Peer, PeerSignals};
pub use store::RegistryStore;
