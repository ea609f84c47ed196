//! Configuration types for `portmesh` servers and agents.
//!
//! These types provide type-safe configuration for embedding `portmesh`
//! in your applications.

use portmesh_common::{
    KeepaliveConfig, LimitsConfig, Result, RetryConfig, TunnelError, DEFAULT_CONTROL_BIND,
    DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_SERVER_BIND, DEFAULT_SERVER_PORT, DEFAULT_SHARED_SECRET,
};
use portmesh_core::agent::{parse_specs, ManagerConfig};
use portmesh_core::{AuthPolicy, TunnelSpec};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the forward server.
///
/// Use [`ServerBuilder`](crate::ServerBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address agents dial
    pub bind_addr: SocketAddr,

    /// Credential every principal must present
    pub shared_secret: String,

    /// Originator host announced in `forwarded-tcpip`; peer IP when unset
    pub origin_host: Option<String>,

    /// Drop an agent connection after this much silence
    pub session_timeout: Duration,

    pub auth_policy: AuthPolicy,

    /// Frame and handshake limits for agent connections
    pub limits: LimitsConfig,
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.is_empty() {
            return Err(TunnelError::Config("shared_secret is required".into()));
        }
        if self.session_timeout.is_zero() {
            return Err(TunnelError::Config("session_timeout must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            session_timeout: self.session_timeout,
            ..KeepaliveConfig::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_SERVER_BIND
                .parse()
                .unwrap_or_else(|_| ([0, 0, 0, 0], DEFAULT_SERVER_PORT).into()),
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            origin_host: None,
            session_timeout: KeepaliveConfig::default().session_timeout,
            auth_policy: AuthPolicy::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Configuration for the tunnel agent.
///
/// Use [`AgentBuilder`](crate::AgentBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel specs, `lhost:lport[@rhost[:rport]]`
    pub specs: Vec<String>,

    pub shared_secret: String,

    /// Forward server port on every remote host
    pub server_port: u16,

    /// Delay between two attempts of a retry task
    pub retry_interval: Duration,

    /// Control endpoint address; `None` disables it
    pub control_bind: Option<SocketAddr>,

    /// Listen host requested from servers; the resolved IP when unset
    pub forward_bind_host: Option<String>,
}

impl AgentConfig {
    /// Validate the configuration.
    ///
    /// A malformed spec fails validation.
    pub fn validate(&self) -> Result<()> {
        self.parsed_specs()?;
        if self.shared_secret.is_empty() {
            return Err(TunnelError::Config("shared_secret is required".into()));
        }
        if self.server_port == 0 {
            return Err(TunnelError::Config("server_port must not be 0".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(TunnelError::Config("retry_interval must be positive".into()));
        }
        Ok(())
    }

    pub fn parsed_specs(&self) -> Result<Vec<TunnelSpec>> {
        parse_specs(&self.specs)
    }

    pub(crate) fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            server_port: self.server_port,
            credential: self.shared_secret.clone(),
            retry_interval: self.retry_interval,
            forward_bind_host: self.forward_bind_host.clone(),
        }
    }

    pub(crate) fn retry(&self) -> RetryConfig {
        RetryConfig {
            interval: self.retry_interval,
            ..RetryConfig::default()
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            control_bind: DEFAULT_CONTROL_BIND.parse().ok(),
            forward_bind_host: None,
        }
    }
}
