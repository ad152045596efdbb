//! Registry gRPC client
//!
//! Thin wrapper over the generated client used by the `nsmesh` CLI and by
//! integration tests. Every call maps a non-OK status back into the
//! domain `Error` so callers match on the same variants the server raised.

use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use nsmesh_core::models::Generation;
use nsmesh_core::{Error, Result};

use super::nsmesh::registry::network_service_registry_client::NetworkServiceRegistryClient;
use super::proto::{
    ConnectionInfo, EndpointInfo, FindNetworkServiceRequest, HeartbeatRequest,
    ListConnectionsRequest, PeerKind, RegisterEndpointRequest, RegisterEndpointResponse,
    ReleaseConnectionRequest, ReleaseConnectionResponse, ReportPeerGoneRequest,
    RequestConnectionRequest, RequestConnectionResponse, UnregisterEndpointRequest,
};

/// Configuration for the registry client
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Timeout for each RPC
    pub request_timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    inner: NetworkServiceRegistryClient<Channel>,
}

impl RegistryClient {
    /// Connect to a registry at `address` (`host:port` or a full URI)
    pub async fn connect(address: &str, config: &RegistryClientConfig) -> Result<Self> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::Rpc(format!("Invalid endpoint URI for {address}: {e}")))?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::Rpc(format!("Failed to connect to {address}: {e}")))?;

        tracing::debug!(address, "Connected to registry");
        Ok(Self {
            inner: NetworkServiceRegistryClient::new(channel),
        })
    }

    pub async fn register_endpoint(
        &self,
        endpoint_id: Option<&str>,
        service: &str,
        address: &str,
        labels: HashMap<String, String>,
    ) -> Result<RegisterEndpointResponse> {
        let request = RegisterEndpointRequest {
            endpoint_id: endpoint_id.unwrap_or_default().to_string(),
            service: service.to_string(),
            address: address.to_string(),
            labels,
        };
        let response = self.inner.clone().register_endpoint(request).await?;
        Ok(response.into_inner())
    }

    pub async fn unregister_endpoint(&self, endpoint_id: &str) -> Result<()> {
        let request = UnregisterEndpointRequest {
            endpoint_id: endpoint_id.to_string(),
        };
        self.inner.clone().unregister_endpoint(request).await?;
        Ok(())
    }

    pub async fn find_network_service(&self, service: &str) -> Result<Vec<EndpointInfo>> {
        let request = FindNetworkServiceRequest {
            service: service.to_string(),
        };
        let response = self.inner.clone().find_network_service(request).await?;
        Ok(response.into_inner().endpoints)
    }

    pub async fn request_connection(
        &self,
        service: &str,
        client_id: &str,
    ) -> Result<RequestConnectionResponse> {
        let request = RequestConnectionRequest {
            service: service.to_string(),
            client_id: client_id.to_string(),
        };
        let response = self.inner.clone().request_connection(request).await?;
        Ok(response.into_inner())
    }

    pub async fn release_connection(
        &self,
        client_id: &str,
        endpoint_id: &str,
        generation: Generation,
    ) -> Result<ReleaseConnectionResponse> {
        let request = ReleaseConnectionRequest {
            client_id: client_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
            generation,
        };
        let response = self.inner.clone().release_connection(request).await?;
        Ok(response.into_inner())
    }

    pub async fn heartbeat(&self, kind: PeerKind, peer_id: &str) -> Result<()> {
        let request = HeartbeatRequest {
            kind: kind as i32,
            peer_id: peer_id.to_string(),
        };
        self.inner.clone().heartbeat(request).await?;
        Ok(())
    }

    pub async fn report_peer_gone(&self, kind: PeerKind, peer_id: &str) -> Result<()> {
        let request = ReportPeerGoneRequest {
            kind: kind as i32,
            peer_id: peer_id.to_string(),
        };
        self.inner.clone().report_peer_gone(request).await?;
        Ok(())
    }

    /// Live connections; `None` lists those of every client
    pub async fn list_connections(&self, client_id: Option<&str>) -> Result<Vec<ConnectionInfo>> {
        let request = ListConnectionsRequest {
            client_id: client_id.unwrap_or_default().to_string(),
        };
        let response = self.inner.clone().list_connections(request).await?;
        Ok(response.into_inner().connections)
    }
}
