use super::handler::ForwardHandler;
use super::registry::ForwardRegistry;
use crate::auth::constant_time_eq;
use crate::connection::{Connection, ConnectionEvents, ConnectionOptions};
use crate::events::EventSink;
use crate::transport;
use crate::users::UserRegistry;
use portmesh_common::{KeepaliveConfig, LimitsConfig, Result};
use portmesh_protocol::constants::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use portmesh_protocol::frame::{HandshakeFrame, HandshakeStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Which principals may open a tunnel connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Only principals present in the [`UserRegistry`]
    #[default]
    RegisteredPrincipals,
    /// Any principal presenting the shared secret
    AnyPrincipal,
}

pub struct ForwardServer {
    addr: SocketAddr,
    shared_secret: String,
    users: UserRegistry,
    handler: ForwardHandler,
    auth_policy: AuthPolicy,
    options: ConnectionOptions,
}

impl ForwardServer {
    pub fn new(
        addr: SocketAddr,
        shared_secret: String,
        users: UserRegistry,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let handler = ForwardHandler::new(ForwardRegistry::new(), users.clone(), events);
        Self {
            addr,
            shared_secret,
            users,
            handler,
            auth_policy: AuthPolicy::default(),
            options: ConnectionOptions::acceptor(&KeepaliveConfig::default(), LimitsConfig::default()),
        }
    }

    #[must_use]
    pub fn with_origin_host(mut self, origin_host: Option<String>) -> Self {
        self.handler = self.handler.with_origin_host(origin_host);
        self
    }

    #[must_use]
    pub fn with_auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.auth_policy = policy;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: &KeepaliveConfig) -> Self {
        self.options.idle_timeout = Some(keepalive.session_timeout);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.options.limits = limits;
        self
    }

    pub fn registry(&self) -> ForwardRegistry {
        self.handler.registry().clone()
    }

    pub fn users(&self) -> UserRegistry {
        self.users.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Accept tunnel connections on `listener` until `shutdown` fires
    ///
    /// Shutting down also closes every connection accepted so far, which
    /// tears down their forwards.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Forward server listening on {}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = transport::accept(&listener) => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let server = server.clone();
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                    warn!("Connection error for {}: {}", peer, e);
                }
            });
        }

        info!("Forward server stopped");
        Ok(())
    }

    fn authorize(&self, handshake: &HandshakeFrame) -> HandshakeStatus {
        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&handshake.version) {
            return HandshakeStatus::VersionMismatch;
        }
        if self.auth_policy == AuthPolicy::RegisteredPrincipals
            && !self.users.contains(&handshake.principal)
        {
            return HandshakeStatus::UnknownPrincipal;
        }
        if !constant_time_eq(
            handshake.credential.as_bytes(),
            self.shared_secret.as_bytes(),
        ) {
            return HandshakeStatus::InvalidCredentials;
        }
        HandshakeStatus::Success
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (conn, events) =
            Connection::accept(stream, peer, &self.options, |hs| self.authorize(hs)).await?;
        let ConnectionEvents {
            mut requests,
            channels,
        } = events;
        // Agents never open channels toward the server
        drop(channels);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    conn.close();
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => self.handler.handle_request(&conn, request).await,
                    None => break,
                },
            }
        }

        let closed = self.handler.connection_closed(conn.id());
        info!(
            connection = conn.id(),
            principal = conn.principal(),
            forwards = closed,
            "tunnel connection finished"
        );
        Ok(())
    }
}
