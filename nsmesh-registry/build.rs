use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route_name: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route_name)
        .input_type(format!("crate::grpc::proto::{input}"))
        .output_type(format!("crate::grpc::proto::{output}"))
        .codec_path("tonic_prost::ProstCodec")
        .build()
}

fn main() {
    // Messages live in src/grpc/proto.rs; only the service glue is generated.
    let service = Service::builder()
        .name("NetworkServiceRegistry")
        .package("nsmesh.registry")
        .method(method(
            "register_endpoint",
            "RegisterEndpoint",
            "RegisterEndpointRequest",
            "RegisterEndpointResponse",
        ))
        .method(method(
            "unregister_endpoint",
            "UnregisterEndpoint",
            "UnregisterEndpointRequest",
            "UnregisterEndpointResponse",
        ))
        .method(method(
            "find_network_service",
            "FindNetworkService",
            "FindNetworkServiceRequest",
            "FindNetworkServiceResponse",
        ))
        .method(method(
            "request_connection",
            "RequestConnection",
            "RequestConnectionRequest",
            "RequestConnectionResponse",
        ))
        .method(method(
            "release_connection",
            "ReleaseConnection",
            "ReleaseConnectionRequest",
            "ReleaseConnectionResponse",
        ))
        .method(method(
            "heartbeat",
            "Heartbeat",
            "HeartbeatRequest",
            "HeartbeatResponse",
        ))
        .method(method(
            "report_peer_gone",
            "ReportPeerGone",
            "ReportPeerGoneRequest",
            "ReportPeerGoneResponse",
        ))
        .method(method(
            "list_connections",
            "ListConnections",
            "ListConnectionsRequest",
            "ListConnectionsResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
}
