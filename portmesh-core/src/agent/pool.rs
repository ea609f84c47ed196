//! Outbound tunnels keyed by [`ConnectionKey`]

use super::spec::ConnectionKey;
use crate::connection::{Connection, ConnectionEvents, ConnectionOptions, IncomingChannel};
use crate::events::{EventSink, TunnelEvent};
use crate::forward::relay::relay;
use crate::transport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portmesh_common::{Result, TunnelError};
use portmesh_protocol::constants::{CANCEL_TCPIP_FORWARD, FORWARDED_TCPIP, TCPIP_FORWARD};
use portmesh_protocol::wire::{decode_port_reply, DirectForward, TcpipForward};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Everything needed to open one tunnel
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub key: ConnectionKey,
    /// Forward server at the resolved address
    pub server: SocketAddr,
    pub principal: String,
    pub credential: String,
    /// Host the server should listen on
    pub bind_host: String,
    /// 0 lets the server pick
    pub remote_port: u16,
    /// Where forwarded connections are relayed to
    pub local_target: String,
    /// Retry task that opened the tunnel
    pub owner: String,
}

struct Tunnel {
    connection: Connection,
    bind_host: String,
    remote_port: u16,
    owner: String,
}

/// Live outbound tunnels
///
/// A tunnel whose connection dies removes itself so the next retry attempt
/// dials it again.
#[derive(Clone)]
pub struct ConnectionPool {
    tunnels: Arc<DashMap<ConnectionKey, Arc<Tunnel>>>,
    options: ConnectionOptions,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("tunnels", &self.tunnels.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool dialing with `options`
    pub fn new(options: ConnectionOptions, events: Arc<dyn EventSink>) -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
            options,
            events,
        }
    }

    /// Whether a tunnel for `key` exists and its connection is still open
    pub fn is_connected(&self, key: &ConnectionKey) -> bool {
        self.tunnels
            .get(key)
            .is_some_and(|tunnel| !tunnel.connection.is_closed())
    }

    /// Remote port of the live tunnel for `key`
    pub fn remote_port(&self, key: &ConnectionKey) -> Option<u16> {
        self.tunnels.get(key).map(|tunnel| tunnel.remote_port)
    }

    /// Dial, authenticate and request the forward
    ///
    /// Returns the port the server bound.
    pub async fn connect(&self, request: DialRequest) -> Result<u16> {
        let dial_error = |reason: String| TunnelError::Dial {
            key: request.key.to_string(),
            reason,
        };

        let (connection, events) = Connection::dial(
            request.server,
            &request.principal,
            &request.credential,
            &self.options,
        )
        .await
        .map_err(|e| dial_error(e.to_string()))?;

        let forward = TcpipForward::new(request.bind_host.clone(), request.remote_port);
        let reply = match connection.request(TCPIP_FORWARD, forward.encode()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                connection.close();
                return Err(dial_error(format!(
                    "{TCPIP_FORWARD} {}:{} refused",
                    request.bind_host, request.remote_port
                )));
            }
            Err(e) => {
                connection.close();
                return Err(dial_error(e.to_string()));
            }
        };

        let remote_port = if request.remote_port == 0 {
            match decode_port_reply(&reply) {
                Ok(port) => port,
                Err(e) => {
                    connection.close();
                    return Err(dial_error(format!("bad {TCPIP_FORWARD} reply: {e}")));
                }
            }
        } else {
            request.remote_port
        };

        let tunnel = Arc::new(Tunnel {
            connection: connection.clone(),
            bind_host: request.bind_host,
            remote_port,
            owner: request.owner,
        });
        match self.tunnels.entry(request.key.clone()) {
            Entry::Occupied(occupied) if !occupied.get().connection.is_closed() => {
                // Lost a race with another attempt for the same key
                connection.close();
                return Ok(occupied.get().remote_port);
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(tunnel);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tunnel);
            }
        }

        self.events.emit(TunnelEvent::Connected {
            key: request.key.to_string(),
            remote_port,
        });
        tokio::spawn(self.clone().serve_channels(
            request.key,
            connection,
            events,
            request.local_target,
        ));
        Ok(remote_port)
    }

    async fn serve_channels(
        self,
        key: ConnectionKey,
        connection: Connection,
        events: ConnectionEvents,
        local_target: String,
    ) {
        // The server never sends requests to an agent
        drop(events.requests);

        loop {
            let incoming = tokio::select! {
                () = connection.closed() => break,
                incoming = events.channels.recv() => match incoming {
                    Ok(incoming) => incoming,
                    Err(_) => break,
                },
            };
            if incoming.channel_type != FORWARDED_TCPIP {
                debug!(%key, channel_type = %incoming.channel_type, "ignoring channel");
                continue;
            }
            tokio::spawn(relay_to_local(
                self.events.clone(),
                key.to_string(),
                local_target.clone(),
                incoming,
            ));
        }

        self.tunnels
            .remove_if(&key, |_, tunnel| tunnel.connection.id() == connection.id());
        debug!(%key, "tunnel connection ended");
    }

    /// Cancel the forward and close the tunnel for `key`
    ///
    /// `Ok(false)` when no tunnel was open.
    pub async fn disconnect(&self, key: &ConnectionKey) -> Result<bool> {
        let Some((_, tunnel)) = self.tunnels.remove(key) else {
            return Ok(false);
        };

        let cancel = TcpipForward::new(tunnel.bind_host.clone(), tunnel.remote_port);
        let result = if tunnel.connection.is_closed() {
            Ok(())
        } else {
            match tunnel
                .connection
                .request(CANCEL_TCPIP_FORWARD, cancel.encode())
                .await
            {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(TunnelError::Connection(format!(
                    "{CANCEL_TCPIP_FORWARD} refused for {key}"
                ))),
                Err(e) => Err(e),
            }
        };
        tunnel.connection.close();

        self.events.emit(TunnelEvent::TornDown {
            key: key.to_string(),
        });
        result.map(|()| true)
    }

    /// Keys of the tunnels opened by `owner`
    pub fn keys_owned_by(&self, owner: &str) -> Vec<ConnectionKey> {
        self.tunnels
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of tunnels, including ones whose connection is closing
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

async fn relay_to_local(
    events: Arc<dyn EventSink>,
    key: String,
    local_target: String,
    incoming: IncomingChannel,
) {
    match DirectForward::decode(&incoming.payload) {
        Ok(origin) => debug!(
            %key,
            "forwarded connection from {}:{} via {}:{}",
            origin.host2, origin.port2, origin.host1, origin.port1
        ),
        Err(e) => warn!(%key, "malformed {} payload: {}", FORWARDED_TCPIP, e),
    }

    let local = match TcpStream::connect(&local_target).await {
        Ok(local) => local,
        Err(e) => {
            events.emit(TunnelEvent::LocalDialFailed {
                target: local_target,
                reason: e.to_string(),
            });
            return;
        }
    };
    transport::configure_socket_silent(&local);

    info!(%key, %local_target, "relaying forwarded connection");
    let outcome = relay(local, incoming.stream).await;
    events.emit(TunnelEvent::RelayClosed {
        forward: key,
        error: outcome.error.map(|e| e.to_string()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::spec::TunnelSpec;
    use crate::events::RecordingSink;
    use crate::forward::ForwardServer;
    use crate::users::UserRegistry;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn start_server(principal: &str) -> (SocketAddr, CancellationToken) {
        let users = UserRegistry::new();
        users.register_principal(principal);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ForwardServer::new(addr, "secret".into(), users, Arc::new(RecordingSink::new()));
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, shutdown)
    }

    fn request(server: SocketAddr, local_target: String) -> DialRequest {
        let spec = TunnelSpec::parse("localhost:8080@db").unwrap();
        DialRequest {
            key: ConnectionKey::new(&spec, 8080, Ipv4Addr::LOCALHOST),
            server,
            principal: spec.identity(),
            credential: "secret".into(),
            bind_host: "127.0.0.1".into(),
            remote_port: 0,
            local_target,
            owner: spec.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_relays_to_local_target() {
        let (server, _shutdown) = start_server("localhost.8080").await;

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let sink = Arc::new(RecordingSink::new());
        let pool = ConnectionPool::new(ConnectionOptions::default(), sink.clone());
        let req = request(server, echo_addr.to_string());
        let key = req.key.clone();

        let port = pool.connect(req).await.unwrap();
        assert!(port > 0);
        assert!(pool.is_connected(&key));
        assert_eq!(pool.remote_port(&key), Some(port));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(pool.disconnect(&key).await.unwrap());
        assert!(!pool.is_connected(&key));
        assert!(!pool.disconnect(&key).await.unwrap());
        assert_eq!(
            sink.count(|e| matches!(e, TunnelEvent::TornDown { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_principal_is_dial_error() {
        let (server, _shutdown) = start_server("someone-else").await;
        let pool = ConnectionPool::new(ConnectionOptions::default(), Arc::new(RecordingSink::new()));

        let err = pool
            .connect(request(server, "127.0.0.1:1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_dead_connection_leaves_pool() {
        let (server, shutdown) = start_server("localhost.8080").await;
        let pool = ConnectionPool::new(ConnectionOptions::default(), Arc::new(RecordingSink::new()));
        let req = request(server, "127.0.0.1:1".into());
        let key = req.key.clone();
        pool.connect(req).await.unwrap();
        assert_eq!(pool.keys_owned_by("localhost:8080@db:8080"), vec![key.clone()]);

        shutdown.cancel();
        for _ in 0..100 {
            if pool.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!pool.is_connected(&key));
        assert!(pool.is_empty());
    }
}
