//! # portmesh
//!
//! Reverse tunnels that follow services across hosts.
//!
//! ## Overview
//!
//! An agent runs next to a service and dials the forward server on every
//! address its remote host resolves to. Each server opens a listener on the
//! agent's behalf and relays accepted connections back through the tunnel,
//! so the service becomes reachable on the remote host without a direct
//! route to it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portmesh::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let mut server = Server::builder().build()?;
//! server.users().register_principal("web.8080");
//! server.start().await?;
//!
//! let mut agent = Agent::builder().spec("web:8080@db").build()?;
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`portmesh-common`] - Errors, configuration and defaults
//! - [`portmesh-protocol`] - Frame codec and RFC 4254 payloads
//! - [`portmesh-core`] - Forward engine, lifecycle manager and control endpoint

pub mod agent;
pub mod config;
pub mod server;

// Re-export subcrates
pub use portmesh_common as common;
pub use portmesh_core as core;
pub use portmesh_protocol as protocol;

pub use agent::{Agent, AgentBuilder};
pub use config::{AgentConfig, ServerConfig};
pub use server::{Server, ServerBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::common::{Result, TunnelError};
    pub use crate::core::{
        AuthPolicy, EventSink, ForwardInfo, RecordingSink, TracingSink, TunnelEvent, TunnelSpec,
        UserRegistry,
    };
    pub use crate::{Agent, AgentConfig, Server, ServerConfig};
}

// Convenience re-exports at crate root
pub use common::{Result, TunnelError};
