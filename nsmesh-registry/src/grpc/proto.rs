//! Wire messages of the `nsmesh.registry.NetworkServiceRegistry` service

use std::collections::HashMap;

use nsmesh_core::models::{Connection, Endpoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerKind {
    Unspecified = 0,
    Client = 1,
    Endpoint = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndpointInfo {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(map = "string, string", tag = "4")]
    pub labels: HashMap<String, String>,
    #[prost(string, tag = "5")]
    pub manager: String,
    /// Unix milliseconds
    #[prost(int64, tag = "6")]
    pub registered_at: i64,
    #[prost(bool, tag = "7")]
    pub alive: bool,
}

impl From<&Endpoint> for EndpointInfo {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            endpoint_id: endpoint.endpoint_id.to_string(),
            service: endpoint.service.clone(),
            address: endpoint.address.clone(),
            labels: endpoint
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            manager: endpoint.manager.clone(),
            registered_at: endpoint.registered_at.timestamp_millis(),
            alive: endpoint.alive,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionInfo {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub endpoint_id: String,
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(string, tag = "4")]
    pub address: String,
    #[prost(uint64, tag = "5")]
    pub generation: u64,
    /// active, suspect or healing
    #[prost(string, tag = "6")]
    pub state: String,
    #[prost(uint32, tag = "7")]
    pub heal_attempts: u32,
    /// Unix milliseconds
    #[prost(int64, tag = "8")]
    pub created_at: i64,
}

impl From<&Connection> for ConnectionInfo {
    fn from(conn: &Connection) -> Self {
        Self {
            client_id: conn.client_id.to_string(),
            endpoint_id: conn.endpoint_id.to_string(),
            service: conn.service.clone(),
            address: conn.address.clone(),
            generation: conn.generation,
            state: conn.state.as_str().to_string(),
            heal_attempts: conn.heal_attempts,
            created_at: conn.created_at.timestamp_millis(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterEndpointRequest {
    /// Optional; assigned by the server when empty
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(map = "string, string", tag = "4")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterEndpointResponse {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
    #[prost(bool, tag = "2")]
    pub already_registered: bool,
    #[prost(string, tag = "3")]
    pub manager: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterEndpointRequest {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterEndpointResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindNetworkServiceRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindNetworkServiceResponse {
    #[prost(message, repeated, tag = "1")]
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestConnectionRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub client_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestConnectionResponse {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(uint64, tag = "3")]
    pub generation: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseConnectionRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub endpoint_id: String,
    #[prost(uint64, tag = "3")]
    pub generation: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseConnectionResponse {
    /// The connection had been closed before this call
    #[prost(bool, tag = "1")]
    pub already_closed: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(enumeration = "PeerKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub peer_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportPeerGoneRequest {
    #[prost(enumeration = "PeerKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub peer_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportPeerGoneResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListConnectionsRequest {
    /// Empty lists every connection
    #[prost(string, tag = "1")]
    pub client_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListConnectionsResponse {
    #[prost(message, repeated, tag = "1")]
    pub connections: Vec<ConnectionInfo>,
}
