//! Registry gRPC server implementation

use std::sync::Arc;
use tonic::{Request, Response, Status};

use nsmesh_core::models::{ClientId, EndpointId};

use super::nsmesh::registry::network_service_registry_server::NetworkServiceRegistry;
use super::proto::{
    ConnectionInfo, EndpointInfo, FindNetworkServiceRequest, FindNetworkServiceResponse,
    HeartbeatRequest, HeartbeatResponse, ListConnectionsRequest, ListConnectionsResponse, PeerKind,
    RegisterEndpointRequest, RegisterEndpointResponse, ReleaseConnectionRequest,
    ReleaseConnectionResponse, ReportPeerGoneRequest, ReportPeerGoneResponse,
    RequestConnectionRequest, RequestConnectionResponse, UnregisterEndpointRequest,
    UnregisterEndpointResponse,
};
use crate::registry::{EndpointRegistration, Peer, RegistryService, ReleaseOutcome};

/// Network service registry gRPC service
#[derive(Clone)]
pub struct RegistryServer {
    service: Arc<RegistryService>,
}

impl RegistryServer {
    #[must_use]
    pub const fn new(service: Arc<RegistryService>) -> Self {
        Self { service }
    }

    fn peer(kind: i32, peer_id: String) -> Result<Peer, Status> {
        match PeerKind::try_from(kind) {
            Ok(PeerKind::Client) => Ok(Peer::Client(ClientId::from(peer_id))),
            Ok(PeerKind::Endpoint) => Ok(Peer::Endpoint(EndpointId::from(peer_id))),
            Ok(PeerKind::Unspecified) | Err(_) => {
                Err(Status::invalid_argument("peer kind must be client or endpoint"))
            }
        }
    }
}

#[tonic::async_trait]
impl NetworkServiceRegistry for RegistryServer {
    async fn register_endpoint(
        &self,
        request: Request<RegisterEndpointRequest>,
    ) -> Result<Response<RegisterEndpointResponse>, Status> {
        let req = request.into_inner();

        let registration = self
            .service
            .register_endpoint(EndpointRegistration {
                endpoint_id: Some(req.endpoint_id),
                service: req.service,
                address: req.address,
                labels: req.labels.into_iter().collect(),
            })
            .await?;

        Ok(Response::new(RegisterEndpointResponse {
            endpoint_id: registration.endpoint.endpoint_id.to_string(),
            already_registered: registration.already_registered,
            manager: registration.endpoint.manager,
        }))
    }

    async fn unregister_endpoint(
        &self,
        request: Request<UnregisterEndpointRequest>,
    ) -> Result<Response<UnregisterEndpointResponse>, Status> {
        let req = request.into_inner();
        self.service.unregister_endpoint(&req.endpoint_id).await?;
        Ok(Response::new(UnregisterEndpointResponse {}))
    }

    async fn find_network_service(
        &self,
        request: Request<FindNetworkServiceRequest>,
    ) -> Result<Response<FindNetworkServiceResponse>, Status> {
        let req = request.into_inner();
        let endpoints = self.service.find_network_service(&req.service)?;

        Ok(Response::new(FindNetworkServiceResponse {
            endpoints: endpoints.iter().map(EndpointInfo::from).collect(),
        }))
    }

    async fn request_connection(
        &self,
        request: Request<RequestConnectionRequest>,
    ) -> Result<Response<RequestConnectionResponse>, Status> {
        let req = request.into_inner();
        let descriptor = self
            .service
            .request_connection(&req.service, &req.client_id)?
            .descriptor();

        Ok(Response::new(RequestConnectionResponse {
            endpoint_id: descriptor.endpoint_id.to_string(),
            address: descriptor.address,
            generation: descriptor.generation,
        }))
    }

    async fn release_connection(
        &self,
        request: Request<ReleaseConnectionRequest>,
    ) -> Result<Response<ReleaseConnectionResponse>, Status> {
        let req = request.into_inner();
        let outcome =
            self.service
                .release_connection(&req.client_id, &req.endpoint_id, req.generation)?;

        let response = match outcome {
            ReleaseOutcome::Released(_) => ReleaseConnectionResponse {
                already_closed: false,
                reason: String::new(),
            },
            ReleaseOutcome::AlreadyClosed(reason) => ReleaseConnectionResponse {
                already_closed: true,
                reason: reason.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.service.heartbeat(Self::peer(req.kind, req.peer_id)?)?;
        Ok(Response::new(HeartbeatResponse {}))
    }

    async fn report_peer_gone(
        &self,
        request: Request<ReportPeerGoneRequest>,
    ) -> Result<Response<ReportPeerGoneResponse>, Status> {
        let req = request.into_inner();
        self.service
            .report_peer_gone(Self::peer(req.kind, req.peer_id)?)?;
        Ok(Response::new(ReportPeerGoneResponse {}))
    }

    async fn list_connections(
        &self,
        request: Request<ListConnectionsRequest>,
    ) -> Result<Response<ListConnectionsResponse>, Status> {
        let req = request.into_inner();
        let connections = self
            .service
            .list_connections(Some(req.client_id.as_str()));

        Ok(Response::new(ListConnectionsResponse {
            connections: connections.iter().map(ConnectionInfo::from).collect(),
        }))
    }
}
