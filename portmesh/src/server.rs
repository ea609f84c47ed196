//! Embeddable forward server with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use portmesh::Server;
//!
//! # async fn example() -> portmesh::Result<()> {
//! let mut server = Server::builder()
//!     .bind("0.0.0.0:2222".parse().unwrap())
//!     .shared_secret("my-secret")
//!     .build()?;
//! server.users().register_principal("web.8080");
//!
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfig;
use portmesh_common::{LimitsConfig, Result, TunnelError};
use portmesh_core::{AuthPolicy, EventSink, ForwardRegistry, ForwardServer, TracingSink, UserRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A forward server that can be embedded in your application.
///
/// Use [`Server::builder()`] to create a new server with the builder pattern.
pub struct Server {
    config: ServerConfig,
    users: UserRegistry,
    events: Arc<dyn EventSink>,
    registry: Option<ForwardRegistry>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Builder for constructing a [`Server`] with ergonomic configuration.
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    users: Option<UserRegistry>,
    events: Option<Arc<dyn EventSink>>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Principals allowed to connect, and their forward callbacks.
    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    /// Forwards currently open. `None` before [`start()`](Self::start).
    pub fn forwards(&self) -> Option<&ForwardRegistry> {
        self.registry.as_ref()
    }

    /// Bind the configured address and start accepting agents.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already running or the address
    /// cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("server already started".into()));
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Starting portmesh server");
        info!("  Tunnel bind: {}", local_addr);
        if let Some(origin) = &self.config.origin_host {
            info!("  Origin host: {}", origin);
        }

        let server = ForwardServer::new(
            local_addr,
            self.config.shared_secret.clone(),
            self.users.clone(),
            self.events.clone(),
        )
        .with_origin_host(self.config.origin_host.clone())
        .with_auth_policy(self.config.auth_policy)
        .with_keepalive(&self.config.keepalive())
        .with_limits(self.config.limits.clone());
        self.registry = Some(server.registry());

        let shutdown = CancellationToken::new();
        self.task = Some(tokio::spawn(server.serve(listener, shutdown.clone())));
        self.shutdown = Some(shutdown);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Run until the accept loop ends.
    pub async fn wait(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| TunnelError::Connection(format!("Server task panicked: {e}")))?,
            None => Ok(()),
        }
    }

    /// Stop accepting, close every agent connection and wait for cleanup.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
        self.wait().await
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
    }
}

impl ServerBuilder {
    /// Address agents dial.
    ///
    /// Default: `0.0.0.0:2222`
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Credential every agent must present.
    ///
    /// Default: the weak built-in secret shared by all installations.
    #[must_use]
    pub fn shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.shared_secret = secret.into();
        self
    }

    /// Originator host announced to agents for forwarded connections.
    #[must_use]
    pub fn origin_host(mut self, host: impl Into<String>) -> Self {
        self.config.origin_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    #[must_use]
    pub fn auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.config.auth_policy = policy;
        self
    }

    /// Frame and handshake limits applied to every agent connection.
    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    /// Share a user registry with the caller.
    #[must_use]
    pub fn users(mut self, users: UserRegistry) -> Self {
        self.users = Some(users);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the server with the configured options.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        Ok(Server {
            config: self.config,
            users: self.users.unwrap_or_default(),
            events: self.events.unwrap_or_else(|| Arc::new(TracingSink)),
            registry: None,
            local_addr: None,
            shutdown: None,
            task: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portmesh_common::DEFAULT_SHARED_SECRET;
    use portmesh_core::connection::{Connection, ConnectionOptions};

    #[test]
    fn test_builder_rejects_empty_secret() {
        assert!(Server::builder().shared_secret("").build().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut server = Server::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(matches!(
            server.start().await,
            Err(TunnelError::InvalidState(_))
        ));
        server.shutdown().await.unwrap();
        assert!(!server.is_running());
    }
    #[tokio::test]
    async fn test_principal_over_limit_rejected() {
        let mut server = Server::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .auth_policy(AuthPolicy::AnyPrincipal)
            .limits(LimitsConfig {
                max_principal_len: 4,
                ..LimitsConfig::default()
            })
            .build()
            .unwrap();
        let addr = server.start().await.unwrap();
        let options = ConnectionOptions::default();

        let secret = DEFAULT_SHARED_SECRET;
        assert!(Connection::dial(addr, "web.8080", secret, &options).await.is_err());
        assert!(Connection::dial(addr, "web", secret, &options).await.is_ok());
        server.shutdown().await.unwrap();
    }
}
