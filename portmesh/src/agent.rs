//! Embeddable tunnel agent with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use portmesh::Agent;
//!
//! # async fn example() -> portmesh::Result<()> {
//! let mut agent = Agent::builder()
//!     .spec("web:8080@db")
//!     .spec("router:*")
//!     .shared_secret("my-secret")
//!     .build()?;
//!
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::AgentConfig;
use portmesh_common::{KeepaliveConfig, Result, TunnelError};
use portmesh_core::agent::{self, ControlService, LocalAddresses, Resolver, TunnelManager};
use portmesh_core::handoff::HostInfo;
use portmesh_core::{ConnectionOptions, EventSink, TracingSink, TunnelSpec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A tunnel agent that can be embedded in your application.
///
/// Use [`Agent::builder()`] to create a new agent with the builder pattern.
pub struct Agent {
    config: AgentConfig,
    specs: Vec<TunnelSpec>,
    service: ControlService,
    control_addr: Option<SocketAddr>,
    control_shutdown: Option<CancellationToken>,
    control_task: Option<JoinHandle<Result<()>>>,
    host: Option<HostInfo>,
    started: bool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("control_addr", &self.control_addr)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Builder for constructing an [`Agent`] with ergonomic configuration.
#[derive(Default)]
pub struct AgentBuilder {
    config: AgentConfig,
    resolver: Option<Arc<dyn Resolver>>,
    local: Option<Arc<dyn LocalAddresses>>,
    events: Option<Arc<dyn EventSink>>,
    host: Option<HostInfo>,
}

impl Agent {
    /// Create a new agent builder.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Open the control endpoint and connect every spec with a concrete port.
    ///
    /// With a host record, its application port is then applied as a port
    /// event. Failed initial connects are logged and retried in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent is already running or the control
    /// address cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(TunnelError::InvalidState("agent already started".into()));
        }
        self.started = true;

        info!("Starting portmesh agent");
        for spec in &self.specs {
            info!("  Spec: {} as {}", spec, spec.identity());
        }
        if let Some(host) = &self.host {
            info!("  Host: pid {} uid {} app port {}", host.pid, host.uid, host.app_port);
        }

        if let Some(bind) = self.config.control_bind {
            let listener = TcpListener::bind(bind).await?;
            self.control_addr = Some(listener.local_addr()?);
            let shutdown = CancellationToken::new();
            self.control_task = Some(tokio::spawn(agent::serve(
                listener,
                self.service.clone(),
                shutdown.clone(),
            )));
            self.control_shutdown = Some(shutdown);
        }

        self.manager().start(&self.specs).await;

        let app_port = self.host.as_ref().map_or(0, |host| host.app_port);
        if app_port != 0 {
            if let Err(e) = self.service.connect(app_port, None).await {
                warn!(app_port, "host application port not connected yet: {}", e);
            }
        }
        Ok(())
    }

    /// Stop the control endpoint and every retry task, tearing tunnels down.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(token) = self.control_shutdown.take() {
            token.cancel();
        }
        if let Some(task) = self.control_task.take() {
            match task.await {
                Ok(Err(e)) => error!("control endpoint failed: {}", e),
                Err(e) => error!("control endpoint panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        self.manager().shutdown().await;
        Ok(())
    }

    /// Apply a port event as the control endpoint would.
    pub async fn connect_port(&self, local_port: u16, remote_port: Option<u16>) -> Result<()> {
        self.service.connect(local_port, remote_port).await
    }

    pub async fn disconnect_port(&self, local_port: u16) {
        self.service.disconnect(local_port).await;
    }

    pub fn manager(&self) -> &TunnelManager {
        self.service.manager()
    }

    pub fn specs(&self) -> &[TunnelSpec] {
        &self.specs
    }

    /// Bound control endpoint address, once started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Host record handed over by the discovery process, if any.
    pub fn host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(token) = self.control_shutdown.take() {
            token.cancel();
        }
    }
}

impl AgentBuilder {
    /// Add one tunnel spec, `lhost:lport[@rhost[:rport]]`.
    #[must_use]
    pub fn spec(mut self, spec: impl Into<String>) -> Self {
        self.config.specs.push(spec.into());
        self
    }

    #[must_use]
    pub fn specs<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.specs.extend(specs.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.shared_secret = secret.into();
        self
    }

    /// Forward server port on the remote hosts.
    ///
    /// Default: `2222`
    #[must_use]
    pub fn server_port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }

    /// Default: 5 seconds
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Control endpoint address; `None` disables it.
    ///
    /// Default: `127.0.0.1:3877`
    #[must_use]
    pub fn control_bind(mut self, addr: Option<SocketAddr>) -> Self {
        self.config.control_bind = addr;
        self
    }

    #[must_use]
    pub fn forward_bind_host(mut self, host: impl Into<String>) -> Self {
        self.config.forward_bind_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn local_addresses(mut self, local: Arc<dyn LocalAddresses>) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Host record from the discovery process.
    ///
    /// Its `app_port` is connected on start like a port event without a
    /// remote port.
    #[must_use]
    pub fn host(mut self, host: HostInfo) -> Self {
        self.host = Some(host);
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the agent with the configured options.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate, including
    /// any malformed spec.
    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;
        let specs = self.config.parsed_specs()?;

        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));
        let options = ConnectionOptions::dialer(&self.config.retry(), &KeepaliveConfig::default());
        let mut manager = TunnelManager::new(self.config.manager_config(), options, events);
        if let Some(resolver) = self.resolver {
            manager = manager.with_resolver(resolver);
        }
        if let Some(local) = self.local {
            manager = manager.with_local_addresses(local);
        }

        Ok(Agent {
            service: ControlService::new(manager, specs.clone()),
            config: self.config,
            specs,
            control_addr: None,
            control_shutdown: None,
            control_task: None,
            host: self.host,
            started: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_malformed_spec() {
        let err = Agent::builder().spec("web:8080").build().unwrap_err();
        assert!(matches!(err, TunnelError::MalformedSpec(_)));
    }

    #[tokio::test]
    async fn test_start_binds_control_endpoint() {
        let mut agent = Agent::builder()
            .spec("router:*")
            .control_bind(Some("127.0.0.1:0".parse().unwrap()))
            .build()
            .unwrap();
        agent.start().await.unwrap();
        let addr = agent.control_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(agent.manager().task_count(), 0);
        assert!(agent.start().await.is_err());
        agent.shutdown().await.unwrap();
    }
}
