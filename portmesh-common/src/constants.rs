//! Default ports and addresses for portmesh services.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! across the library, the CLI and the tests.

/// Default port the forward server listens on for tunnel connections.
pub const DEFAULT_SERVER_PORT: u16 = 2222;

/// Default bind address for the forward server (`0.0.0.0:2222`).
pub const DEFAULT_SERVER_BIND: &str = "0.0.0.0:2222";

/// Default port for the agent control endpoint.
pub const DEFAULT_CONTROL_PORT: u16 = 3877;

/// Default bind address for the agent control endpoint (`127.0.0.1:3877`).
pub const DEFAULT_CONTROL_BIND: &str = "127.0.0.1:3877";

/// Default interval between retry attempts, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

/// Shared secret accepted when none is configured.
///
/// Every principal authenticates with this single value unless the operator
/// overrides it. It is weak on purpose: it only exists so a fresh cluster
/// interoperates out of the box.
pub const DEFAULT_SHARED_SECRET: &str = "123456789";

/// Environment variable overriding the originator host announced in
/// `forwarded-tcpip` channels.
pub const BIND_ADDR_ENV: &str = "BINDADDR";
