//! Client sub-commands against a running registry

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};

use nsmesh_registry::grpc::proto::PeerKind;
use nsmesh_registry::grpc::{RegistryClient, RegistryClientConfig};

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Register an endpoint of a network service
    Register {
        service: String,
        /// host:port the endpoint accepts connections on
        address: String,
        /// Endpoint id; assigned by the registry when omitted
        #[arg(long)]
        id: Option<String>,
        /// key=value, repeatable
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Remove an endpoint
    Unregister { endpoint_id: String },
    /// List the endpoints of a network service
    Find { service: String },
    /// Connect a client to a network service
    Request {
        service: String,
        #[arg(long)]
        client_id: String,
    },
    /// Release a connection
    Release {
        #[arg(long)]
        client_id: String,
        #[arg(long)]
        endpoint_id: String,
        #[arg(long)]
        generation: u64,
    },
    /// List live connections
    List {
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Send a liveness heartbeat for a peer
    Heartbeat { kind: PeerArg, peer_id: String },
    /// Report a peer as gone
    Gone { kind: PeerArg, peer_id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum PeerArg {
    Client,
    Endpoint,
}

impl From<PeerArg> for PeerKind {
    fn from(arg: PeerArg) -> Self {
        match arg {
            PeerArg::Client => Self::Client,
            PeerArg::Endpoint => Self::Endpoint,
        }
    }
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label must be key=value, got {raw:?}"))
}

pub async fn run(addr: &str, command: ClientCommand) -> Result<()> {
    let client = RegistryClient::connect(addr, &RegistryClientConfig::default())
        .await
        .with_context(|| format!("cannot reach registry at {addr}"))?;

    match command {
        ClientCommand::Register {
            service,
            address,
            id,
            labels,
        } => {
            let labels: HashMap<_, _> = labels.into_iter().collect();
            let response = client
                .register_endpoint(id.as_deref(), &service, &address, labels)
                .await?;
            let note = if response.already_registered {
                " (already registered)"
            } else {
                ""
            };
            println!("{} via {}{note}", response.endpoint_id, response.manager);
        }
        ClientCommand::Unregister { endpoint_id } => {
            client.unregister_endpoint(&endpoint_id).await?;
            println!("{endpoint_id} unregistered");
        }
        ClientCommand::Find { service } => {
            for endpoint in client.find_network_service(&service).await? {
                let state = if endpoint.alive { "alive" } else { "dead" };
                println!("{}\t{}\t{state}", endpoint.endpoint_id, endpoint.address);
            }
        }
        ClientCommand::Request { service, client_id } => {
            let response = client.request_connection(&service, &client_id).await?;
            println!(
                "{}\t{}\tgeneration {}",
                response.endpoint_id, response.address, response.generation
            );
        }
        ClientCommand::Release {
            client_id,
            endpoint_id,
            generation,
        } => {
            let response = client
                .release_connection(&client_id, &endpoint_id, generation)
                .await?;
            if response.already_closed {
                println!("already closed ({})", response.reason);
            } else {
                println!("released");
            }
        }
        ClientCommand::List { client_id } => {
            for conn in client.list_connections(client_id.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\tgeneration {}\t{}",
                    conn.client_id, conn.service, conn.endpoint_id, conn.generation, conn.state
                );
            }
        }
        ClientCommand::Heartbeat { kind, peer_id } => {
            client.heartbeat(kind.into(), &peer_id).await?;
        }
        ClientCommand::Gone { kind, peer_id } => {
            client.report_peer_gone(kind.into(), &peer_id).await?;
        }
    }

    Ok(())
}
