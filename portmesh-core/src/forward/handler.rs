//! `tcpip-forward` state machine
//!
//! Requested → Listening → (Accepting ⇄ Relaying)* → Closed. A forward is
//! closed by `cancel-tcpip-forward` or when its owning connection ends,
//! whichever comes first.

use super::registry::{ForwardEntry, ForwardRegistry};
use super::relay::relay;
use crate::connection::{Connection, InboundRequest, Responder};
use crate::events::{EventSink, TunnelEvent};
use crate::transport::configure_socket_silent;
use crate::users::{ForwardInfo, UserRegistry};
use bytes::Bytes;
use portmesh_common::{Result, TunnelError};
use portmesh_protocol::constants::{CANCEL_TCPIP_FORWARD, FORWARDED_TCPIP, TCPIP_FORWARD};
use portmesh_protocol::wire::{encode_port_reply, port_from_wire, DirectForward, TcpipForward};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Turns forwarding requests into listeners and relayed channels
#[derive(Clone)]
pub struct ForwardHandler {
    registry: ForwardRegistry,
    users: UserRegistry,
    events: Arc<dyn EventSink>,
    /// Originator host announced in `forwarded-tcpip`; peer IP when unset
    origin_host: Option<String>,
}

impl std::fmt::Debug for ForwardHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandler")
            .field("forwards", &self.registry.len())
            .field("origin_host", &self.origin_host)
            .finish_non_exhaustive()
    }
}

impl ForwardHandler {
    pub fn new(registry: ForwardRegistry, users: UserRegistry, events: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            users,
            events,
            origin_host: None,
        }
    }

    #[must_use]
    pub fn with_origin_host(mut self, origin_host: Option<String>) -> Self {
        self.origin_host = origin_host;
        self
    }

    pub fn registry(&self) -> &ForwardRegistry {
        &self.registry
    }

    /// Dispatch one global request received on `conn`
    pub async fn handle_request(&self, conn: &Connection, request: InboundRequest) {
        match request.name.as_str() {
            TCPIP_FORWARD => self.open_forward(conn, request.payload, request.responder).await,
            CANCEL_TCPIP_FORWARD => {
                self.cancel_forward(conn, request.payload, request.responder)
                    .await;
            }
            other => {
                debug!(connection = conn.id(), request = %other, "unsupported global request");
                request.responder.failure().await;
            }
        }
    }

    async fn open_forward(&self, conn: &Connection, payload: Bytes, responder: Responder) {
        let principal = conn.principal().to_string();
        let request = match TcpipForward::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(%principal, "malformed {} payload: {}", TCPIP_FORWARD, e);
                responder.failure().await;
                return;
            }
        };
        let requested_port = match port_from_wire(request.port) {
            Ok(port) => port,
            Err(e) => {
                warn!(%principal, "rejecting {}: {}", TCPIP_FORWARD, e);
                responder.failure().await;
                return;
            }
        };

        let host = request.host;
        let bind_host = if host.is_empty() { "0.0.0.0" } else { host.as_str() };
        let (listener, bound_addr) = match bind(bind_host, requested_port).await {
            Ok(bound) => bound,
            Err(e) => {
                self.events.emit(TunnelEvent::ListenFailed {
                    principal,
                    addr: format!("{host}:{requested_port}"),
                    reason: e.to_string(),
                });
                responder.failure().await;
                return;
            }
        };

        let peer = conn.peer_addr();
        let remote_ip = match peer.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(_) => {
                self.events.emit(TunnelEvent::Ipv6PeerUnsupported {
                    principal: principal.clone(),
                    peer,
                });
                String::new()
            }
        };

        let entry = Arc::new(ForwardEntry {
            key: ForwardRegistry::key(&host, bound_addr.port()),
            bound_addr,
            connection_id: conn.id(),
            info: ForwardInfo {
                principal: principal.clone(),
                local_host: host,
                local_port: bound_addr.port(),
                remote_ip,
                remote_port: bound_addr.port(),
            },
            shutdown: CancellationToken::new(),
            create_callback: Mutex::default(),
        });

        if let Err(e) = self.registry.insert(entry.clone()) {
            warn!(%principal, "{}", e);
            responder.failure().await;
            return;
        }

        // The requester learns the port before anything is relayed
        let reply = if requested_port == 0 {
            encode_port_reply(bound_addr.port())
        } else {
            Bytes::new()
        };
        responder.success(reply).await;

        self.events.emit(TunnelEvent::ForwardOpened {
            principal: principal.clone(),
            bind_addr: bound_addr,
        });

        tokio::spawn(self.clone().accept_loop(listener, entry.clone(), conn.clone()));

        if let Some(user) = self.users.lookup(&principal) {
            let info = entry.info.clone();
            entry.set_create_callback(tokio::spawn(async move { user.fire_create(&info) }));
        }
    }

    async fn cancel_forward(&self, conn: &Connection, payload: Bytes, responder: Responder) {
        let request = match TcpipForward::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed {} payload: {}", CANCEL_TCPIP_FORWARD, e);
                responder.failure().await;
                return;
            }
        };
        let Ok(port) = port_from_wire(request.port) else {
            responder.failure().await;
            return;
        };

        let key = ForwardRegistry::key(&request.host, port);
        let Some(entry) = self.registry.remove_owned(&key, conn.id()) else {
            debug!(connection = conn.id(), %key, "cancel for unknown forward");
            responder.failure().await;
            return;
        };

        responder
            .success(encode_port_reply(entry.bound_addr.port()))
            .await;
        entry.shutdown.cancel();
        self.events.emit(TunnelEvent::ForwardCancelled {
            principal: entry.info.principal.clone(),
            bind_addr: entry.bound_addr,
        });
        self.fire_delete(&entry);
    }

    /// Close every forward still owned by a finished connection
    ///
    /// Returns how many forwards were closed.
    pub fn connection_closed(&self, connection_id: u64) -> usize {
        let entries = self.registry.drain_connection(connection_id);
        for entry in &entries {
            entry.shutdown.cancel();
            self.events.emit(TunnelEvent::ForwardClosed {
                principal: entry.info.principal.clone(),
                bind_addr: entry.bound_addr,
            });
            self.fire_delete(entry);
        }
        entries.len()
    }

    /// Run the delete callback once the create callback has returned
    fn fire_delete(&self, entry: &ForwardEntry) {
        let create = entry.take_create_callback();
        let Some(user) = self.users.lookup(&entry.info.principal) else {
            return;
        };
        let info = entry.info.clone();
        tokio::spawn(async move {
            if let Some(create) = create {
                if let Err(e) = create.await {
                    warn!(principal = %info.principal, "create callback failed: {}", e);
                }
            }
            user.fire_delete(&info);
        });
    }

    async fn accept_loop(self, listener: TcpListener, entry: Arc<ForwardEntry>, conn: Connection) {
        info!(key = %entry.key, addr = %entry.bound_addr, "accepting forwarded connections");
        loop {
            let (socket, peer) = tokio::select! {
                () = entry.shutdown.cancelled() => break,
                () = conn.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(key = %entry.key, "accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let handler = self.clone();
            let entry = entry.clone();
            let conn = conn.clone();
            tokio::spawn(async move { handler.relay_accepted(&conn, &entry, socket, peer).await });
        }
        debug!(key = %entry.key, "listener closed");
    }

    async fn relay_accepted(
        &self,
        conn: &Connection,
        entry: &ForwardEntry,
        socket: TcpStream,
        peer: SocketAddr,
    ) {
        configure_socket_silent(&socket);

        let origin = DirectForward {
            host1: entry.info.local_host.clone(),
            port1: u32::from(entry.bound_addr.port()),
            host2: self
                .origin_host
                .clone()
                .unwrap_or_else(|| peer.ip().to_string()),
            port2: u32::from(peer.port()),
        };
        let channel = match conn.open_channel(FORWARDED_TCPIP, origin.encode()).await {
            Ok(channel) => channel,
            Err(e) => {
                self.events.emit(TunnelEvent::ChannelOpenFailed {
                    bind_addr: entry.bound_addr,
                    reason: e.to_string(),
                });
                return;
            }
        };

        debug!(key = %entry.key, %peer, channel = channel.id(), "relaying");
        let outcome = relay(socket, channel).await;
        self.events.emit(TunnelEvent::RelayClosed {
            forward: entry.key.clone(),
            error: outcome.error.map(|e| e.to_string()),
        });
    }
}

async fn bind(host: &str, port: u16) -> Result<(TcpListener, SocketAddr)> {
    let listen_error = |e: std::io::Error| TunnelError::Listen {
        addr: format!("{host}:{port}"),
        reason: e.to_string(),
    };
    let listener = TcpListener::bind((host, port)).await.map_err(listen_error)?;
    let addr = listener.local_addr().map_err(listen_error)?;
    Ok((listener, addr))
}
