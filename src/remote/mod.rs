//! Remote-NoC transport: request/response command rings over an
//! on-die Ethernet core (spec §4.5).

mod ring;
mod routing_cmd;
mod transport;

pub use ring::RingState;
pub use routing_cmd::{RoutingCmd, RoutingFlags};
pub use transport::{RemoteCommunication, ReservedEthCores};
