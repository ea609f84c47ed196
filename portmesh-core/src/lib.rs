//! Reverse-tunnel forwarding engine
//!
//! The server half ([`forward`]) accepts `tcpip-forward` requests over a
//! [`connection::Connection`], opens listeners on behalf of the peer and
//! relays every accepted socket back through a `forwarded-tcpip` channel.
//! The agent half ([`agent`]) parses tunnel specs, keeps one retry task per
//! local port and fans each spec out to every resolved address of its
//! remote host.

pub mod agent;
pub mod auth;
pub mod connection;
pub mod events;
pub mod forward;
pub mod handoff;
pub mod transport;
pub mod users;

pub use agent::{ControlService, TunnelManager, TunnelSpec};
pub use connection::{Connection, ConnectionOptions};
pub use events::{EventSink, RecordingSink, TracingSink, TunnelEvent};
pub use forward::{AuthPolicy, ForwardHandler, ForwardRegistry, ForwardServer};
pub use users::{ForwardInfo, UserRegistry};
