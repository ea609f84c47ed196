//! Authenticated, multiplexed tunnel connection
//!
//! A [`Connection`] is established by a handshake carrying the peer's
//! principal and credential. Afterwards both sides may exchange global
//! requests, correlated by id, and open any number of data channels.

mod mux;
mod request;

pub use mux::{IncomingChannel, Multiplexer, VirtualStream};
pub use request::{InboundRequest, Responder};

use crate::auth::validate_credential_format;
use crate::transport::{self, batched_sender::run_batched_sender};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use portmesh_common::{KeepaliveConfig, LimitsConfig, Result, RetryConfig, TunnelError};
use portmesh_protocol::constants::PROTOCOL_VERSION;
use portmesh_protocol::frame::{Frame, GlobalRequestFrame, HandshakeFrame, HandshakeStatus};
use portmesh_protocol::validation::{validate_frame, ValidationLimits};
use portmesh_protocol::TunnelCodec;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{Framed, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FRAME_QUEUE: usize = 1024;
const REQUEST_QUEUE: usize = 16;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<DashMap<u32, oneshot::Sender<Option<Bytes>>>>;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a global request waits for its reply
    pub request_timeout: Duration,
    /// Heartbeats sent while idle; `None` disables them
    pub heartbeat_interval: Option<Duration>,
    /// Drop the connection after this much inbound silence
    pub idle_timeout: Option<Duration>,
    pub limits: LimitsConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(30)),
            idle_timeout: None,
            limits: LimitsConfig::default(),
        }
    }
}

impl ConnectionOptions {
    /// Options for the agent side, which keeps the connection alive
    pub fn dialer(retry: &RetryConfig, keepalive: &KeepaliveConfig) -> Self {
        Self {
            connect_timeout: retry.connect_timeout,
            request_timeout: retry.request_timeout,
            heartbeat_interval: Some(keepalive.heartbeat_interval),
            idle_timeout: None,
            ..Self::default()
        }
    }

    /// Options for the server side, which drops silent peers
    pub fn acceptor(keepalive: &KeepaliveConfig, limits: LimitsConfig) -> Self {
        Self {
            heartbeat_interval: None,
            idle_timeout: Some(keepalive.session_timeout),
            limits,
            ..Self::default()
        }
    }

    fn codec(&self) -> TunnelCodec {
        TunnelCodec::with_max_frame_size(
            usize::try_from(self.limits.max_frame_bytes).unwrap_or(usize::MAX),
        )
    }

    fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_principal_len: self.limits.max_principal_len,
            max_credential_len: self.limits.max_credential_len,
            max_name_len: self.limits.max_name_len,
            max_payload_bytes: self.limits.max_payload_bytes,
        }
    }
}

/// Receivers for what the peer initiates
#[derive(Debug)]
pub struct ConnectionEvents {
    pub requests: mpsc::Receiver<InboundRequest>,
    pub channels: AsyncReceiver<IncomingChannel>,
}

struct Shared {
    id: u64,
    principal: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    mux: Multiplexer,
    frame_tx: AsyncSender<Frame>,
    pending: PendingMap,
    next_request_id: AtomicU32,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Handle to an established tunnel connection
///
/// Cheap to clone. The connection closes when [`Connection::close`] is called,
/// when the peer goes away, or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("principal", &self.shared.principal)
            .field("peer_addr", &self.shared.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `addr` and authenticate as `principal`
    pub async fn dial(
        addr: SocketAddr,
        principal: &str,
        credential: &str,
        options: &ConnectionOptions,
    ) -> Result<(Self, ConnectionEvents)> {
        validate_credential_format(credential, options.limits.max_credential_len)?;

        let stream = transport::connect(addr, options.connect_timeout).await?;
        let local_addr = stream.local_addr()?;
        let mut framed = Framed::new(stream, options.codec());

        debug!(%addr, %principal, "sending handshake");
        framed
            .send(Frame::Handshake(Box::new(HandshakeFrame {
                version: PROTOCOL_VERSION,
                principal: principal.to_string(),
                credential: credential.to_string(),
            })))
            .await?;

        let reply = timeout(options.handshake_timeout, framed.next())
            .await
            .map_err(|_| TunnelError::Timeout(format!("handshake with {addr}")))?;
        match reply {
            Some(Ok(Frame::HandshakeAck {
                status: HandshakeStatus::Success,
                ..
            })) => {}
            Some(Ok(Frame::HandshakeAck { status, .. })) => {
                return Err(TunnelError::Authentication(format!(
                    "Handshake rejected: {status:?}"
                )));
            }
            Some(Ok(other)) => {
                return Err(TunnelError::Protocol(format!(
                    "Expected HandshakeAck, got {}",
                    other.kind()
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TunnelError::Connection(
                    "Connection closed during handshake".into(),
                ))
            }
        }

        Ok(Self::establish(
            framed,
            principal.to_string(),
            addr,
            local_addr,
            true,
            options,
        ))
    }

    /// Run the accepting side of the handshake on `stream`
    ///
    /// `authorize` decides the handshake status once the frame passed the
    /// format checks. Anything but `Success` is reported to the peer and
    /// returned as an authentication error.
    pub async fn accept<F>(
        stream: TcpStream,
        peer_addr: SocketAddr,
        options: &ConnectionOptions,
        authorize: F,
    ) -> Result<(Self, ConnectionEvents)>
    where
        F: FnOnce(&HandshakeFrame) -> HandshakeStatus,
    {
        let local_addr = stream.local_addr()?;
        let mut framed = Framed::new(stream, options.codec());

        let first = timeout(options.handshake_timeout, framed.next())
            .await
            .map_err(|_| TunnelError::Timeout(format!("handshake from {peer_addr}")))?;
        let handshake = match first {
            Some(Ok(Frame::Handshake(handshake))) => *handshake,
            Some(Ok(other)) => {
                return Err(TunnelError::Protocol(format!(
                    "Expected handshake, got {}",
                    other.kind()
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TunnelError::Connection(
                    "Connection closed before handshake".into(),
                ))
            }
        };

        let status = if handshake.principal.len() > options.limits.max_principal_len {
            warn!("Principal too long from {}", peer_addr);
            HandshakeStatus::UnknownPrincipal
        } else if let Err(e) =
            validate_credential_format(&handshake.credential, options.limits.max_credential_len)
        {
            warn!("Invalid credential format from {}: {}", peer_addr, e);
            HandshakeStatus::InvalidCredentials
        } else {
            authorize(&handshake)
        };

        framed
            .send(Frame::HandshakeAck {
                status,
                version: PROTOCOL_VERSION,
            })
            .await?;

        if status != HandshakeStatus::Success {
            return Err(TunnelError::Authentication(format!(
                "{} from {peer_addr} rejected: {status:?}",
                handshake.principal
            )));
        }

        Ok(Self::establish(
            framed,
            handshake.principal,
            peer_addr,
            local_addr,
            false,
            options,
        ))
    }

    fn establish(
        framed: Framed<TcpStream, TunnelCodec>,
        principal: String,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        is_dialer: bool,
        options: &ConnectionOptions,
    ) -> (Self, ConnectionEvents) {
        let parts = framed.into_parts();
        let (read_half, write_half) = parts.io.into_split();

        // Frames that arrived with the handshake must not be lost
        let mut reader = FramedRead::new(read_half, parts.codec);
        if !parts.read_buf.is_empty() {
            reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        }

        let closed = CancellationToken::new();
        let (frame_tx, frame_rx) = bounded_async::<Frame>(FRAME_QUEUE);
        tokio::spawn(run_batched_sender(
            frame_rx,
            write_half,
            parts.codec,
            closed.clone(),
        ));

        let (mux, incoming_rx) = Multiplexer::new(frame_tx.clone(), is_dialer);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let pending: PendingMap = Arc::new(DashMap::new());
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let read_loop = ReadLoop {
            id,
            reader,
            mux: mux.clone(),
            frame_tx: frame_tx.clone(),
            pending: pending.clone(),
            request_tx,
            closed: closed.clone(),
            idle_timeout: options.idle_timeout,
            limits: options.validation_limits(),
        };
        tokio::spawn(read_loop.run());

        if let Some(period) = options.heartbeat_interval {
            tokio::spawn(run_heartbeat(frame_tx.clone(), period, closed.clone()));
        }

        info!(connection = id, %principal, %peer_addr, "tunnel connection established");

        let connection = Self {
            shared: Arc::new(Shared {
                id,
                principal,
                peer_addr,
                local_addr,
                mux,
                frame_tx,
                pending,
                next_request_id: AtomicU32::new(1),
                request_timeout: options.request_timeout,
                closed,
            }),
        };
        let events = ConnectionEvents {
            requests: request_rx,
            channels: incoming_rx,
        };
        (connection, events)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Principal authenticated by the handshake
    pub fn principal(&self) -> &str {
        &self.shared.principal
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Send a global request and wait for its reply
    ///
    /// `Ok(Some(payload))` on success, `Ok(None)` when the peer refused.
    pub async fn request(&self, name: &str, payload: Bytes) -> Result<Option<Bytes>> {
        let shared = &self.shared;
        let request_id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(request_id, tx);

        if self.is_closed() {
            shared.pending.remove(&request_id);
            return Err(TunnelError::Connection("connection closed".into()));
        }

        let frame = Frame::GlobalRequest(Box::new(GlobalRequestFrame {
            request_id,
            name: name.to_string(),
            want_reply: true,
            payload,
        }));
        if let Err(e) = shared.frame_tx.send(frame).await {
            shared.pending.remove(&request_id);
            return Err(TunnelError::Connection(format!("sending {name}: {e}")));
        }

        match timeout(shared.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TunnelError::Connection(format!(
                "connection closed before {name} was answered"
            ))),
            Err(_) => {
                shared.pending.remove(&request_id);
                Err(TunnelError::Timeout(format!("no reply to {name}")))
            }
        }
    }

    pub async fn open_channel(&self, channel_type: &str, payload: Bytes) -> Result<VirtualStream> {
        if self.is_closed() {
            return Err(TunnelError::Connection("connection closed".into()));
        }
        self.shared.mux.open_channel(channel_type, payload).await
    }
}

struct ReadLoop {
    id: u64,
    reader: FramedRead<OwnedReadHalf, TunnelCodec>,
    mux: Multiplexer,
    frame_tx: AsyncSender<Frame>,
    pending: PendingMap,
    request_tx: mpsc::Sender<InboundRequest>,
    closed: CancellationToken,
    idle_timeout: Option<Duration>,
    limits: ValidationLimits,
}

impl ReadLoop {
    async fn run(mut self) {
        let reason = loop {
            let next = tokio::select! {
                () = self.closed.cancelled() => break "closed locally".to_string(),
                next = next_frame(&mut self.reader, self.idle_timeout) => next,
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break "peer closed".to_string(),
                Err(e) => break e.to_string(),
            };
            if let Err(e) = validate_frame(&frame, &self.limits) {
                break format!("invalid frame: {e}");
            }
            if let Err(e) = self.dispatch(frame).await {
                break e.to_string();
            }
        };

        info!(connection = self.id, %reason, "tunnel connection closed");
        self.closed.cancel();
        self.mux.shutdown();
        self.pending.clear();
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Heartbeat { timestamp } => self
                .frame_tx
                .send(Frame::HeartbeatAck { timestamp })
                .await
                .map_err(|e| TunnelError::Connection(e.to_string())),
            Frame::HeartbeatAck { .. } => {
                debug!(connection = self.id, "heartbeat ack received");
                Ok(())
            }
            Frame::GlobalRequest(request) => {
                let GlobalRequestFrame {
                    request_id,
                    name,
                    want_reply,
                    payload,
                } = *request;
                let inbound = InboundRequest {
                    name,
                    want_reply,
                    payload,
                    responder: Responder::new(request_id, want_reply, self.frame_tx.clone()),
                };
                if let Err(mpsc::error::SendError(inbound)) = self.request_tx.send(inbound).await {
                    debug!(connection = self.id, name = %inbound.name, "no request handler");
                    inbound.responder.failure().await;
                }
                Ok(())
            }
            Frame::RequestSuccess {
                request_id,
                payload,
            } => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let _ = tx.send(Some(payload));
                }
                Ok(())
            }
            Frame::RequestFailure { request_id } => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let _ = tx.send(None);
                }
                Ok(())
            }
            frame @ (Frame::ChannelOpen(_) | Frame::Data { .. } | Frame::ChannelClose { .. }) => {
                self.mux.process_frame(frame).await;
                Ok(())
            }
            other @ (Frame::Handshake(_) | Frame::HandshakeAck { .. }) => Err(
                TunnelError::Protocol(format!("unexpected {} after handshake", other.kind())),
            ),
        }
    }
}

async fn next_frame(
    reader: &mut FramedRead<OwnedReadHalf, TunnelCodec>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Frame>> {
    let next = match idle_timeout {
        Some(limit) => timeout(limit, reader.next())
            .await
            .map_err(|_| TunnelError::Timeout(format!("peer silent for {limit:?}")))?,
        None => reader.next().await,
    };
    next.transpose().map_err(TunnelError::from)
}

async fn run_heartbeat(frame_tx: AsyncSender<Frame>, period: Duration, closed: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            _ = ticker.tick() => {
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                if frame_tx.send(Frame::Heartbeat { timestamp }).await.is_err() {
                    break;
                }
            }
        }
    }
}
