//! Registry gRPC transport

pub mod client;
pub mod proto;
pub mod server;

// Service glue generated by build.rs around the messages in `proto`
pub mod nsmesh {
    pub mod registry {
        include!(concat!(env!("OUT_DIR"), "/nsmesh.registry.NetworkServiceRegistry.rs"));
    }
}

pub use client::{RegistryClient, RegistryClientConfig};
pub use nsmesh::registry::network_service_registry_server::NetworkServiceRegistryServer;
pub use server::RegistryServer;
