pub mod connection;
pub mod endpoint;
pub mod id;
pub mod liveness;

pub use connection::{CloseReason, Connection, ConnectionDescriptor, ConnectionState, Generation};
pub use endpoint::Endpoint;
pub use id::{generate_id, ClientId, ConnectionKey, EndpointId};
pub use liveness::{FailedSide, Liveness, LivenessEvent};
