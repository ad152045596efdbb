pub mod grpc;
pub mod registry;

pub use grpc::{RegistryClient, RegistryServer, NetworkServiceRegistryServer};
pub use registry::{
    ConnectionTable, Healer, HealEvent, PeerSignals, Prober, RegistryService, RegistryStore,
};
