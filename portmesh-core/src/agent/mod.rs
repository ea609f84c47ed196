//! Agent side: tunnel specs, outbound tunnels and their retry tasks

pub mod control;
pub mod manager;
pub mod pool;
pub mod resolve;
pub mod spec;

pub use control::{router, serve, ControlClient, ControlReply, ControlService, PortArgs};
pub use manager::{ManagerConfig, TunnelManager};
pub use pool::{ConnectionPool, DialRequest};
pub use resolve::{
    FixedAddresses, LocalAddresses, Resolver, StaticResolver, SystemInterfaces, SystemResolver,
};
pub use spec::{parse_specs, ConnectionKey, PortSpec, TunnelSpec};
