//! Server side: forward registry, request handler and accept loop

pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;

pub use handler::ForwardHandler;
pub use registry::{ForwardEntry, ForwardRegistry};
pub use relay::{relay, RelayOutcome, RelaySide};
pub use server::{AuthPolicy, ForwardServer};
