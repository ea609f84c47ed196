//! Common utilities and types for `portmesh`

pub mod config;
pub mod constants;
pub mod error;

pub use config::{KeepaliveConfig, LimitsConfig, RetryConfig};
pub use constants::{
    BIND_ADDR_ENV, DEFAULT_CONTROL_BIND, DEFAULT_CONTROL_PORT, DEFAULT_RETRY_INTERVAL_SECS,
    DEFAULT_SERVER_BIND, DEFAULT_SERVER_PORT, DEFAULT_SHARED_SECRET,
};
pub use error::{Result, TunnelError};
