//! Structured event hook
//!
//! Failures on the retry and relay paths are contained rather than returned.
//! They are reported to an [`EventSink`] so embedders and tests can observe
//! them without scraping logs.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    // Server side
    ForwardOpened {
        principal: String,
        bind_addr: SocketAddr,
    },
    ForwardCancelled {
        principal: String,
        bind_addr: SocketAddr,
    },
    /// Owning connection went away while the forward was active
    ForwardClosed {
        principal: String,
        bind_addr: SocketAddr,
    },
    ListenFailed {
        principal: String,
        addr: String,
        reason: String,
    },
    ChannelOpenFailed {
        bind_addr: SocketAddr,
        reason: String,
    },
    Ipv6PeerUnsupported {
        principal: String,
        peer: SocketAddr,
    },

    // Agent side
    ResolutionFailed {
        host: String,
        reason: String,
    },
    SelfConnectionSkipped {
        key: String,
    },
    Connected {
        key: String,
        remote_port: u16,
    },
    DialFailed {
        key: String,
        reason: String,
    },
    TornDown {
        key: String,
    },
    TeardownFailed {
        key: String,
        reason: String,
    },
    RetryStopped {
        local_port: u16,
    },
    LocalDialFailed {
        target: String,
        reason: String,
    },

    // Both sides
    RelayClosed {
        forward: String,
        error: Option<String>,
    },
}

/// Receiver of [`TunnelEvent`]s
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TunnelEvent);
}

/// Default sink: one log line per event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TunnelEvent) {
        match &event {
            TunnelEvent::ForwardOpened {
                principal,
                bind_addr,
            } => info!(%principal, %bind_addr, "forward opened"),
            TunnelEvent::ForwardCancelled {
                principal,
                bind_addr,
            } => info!(%principal, %bind_addr, "forward cancelled"),
            TunnelEvent::ForwardClosed {
                principal,
                bind_addr,
            } => info!(%principal, %bind_addr, "forward closed with its connection"),
            TunnelEvent::Connected { key, remote_port } => {
                info!(%key, remote_port, "tunnel connected");
            }
            TunnelEvent::TornDown { key } => info!(%key, "tunnel torn down"),
            TunnelEvent::RetryStopped { local_port } => info!(local_port, "retry task stopped"),
            TunnelEvent::SelfConnectionSkipped { key } => {
                debug!(%key, "skipping connection to local address");
            }
            TunnelEvent::RelayClosed { forward, error } => match error {
                Some(error) => debug!(%forward, %error, "relay closed with error"),
                None => debug!(%forward, "relay closed"),
            },
            TunnelEvent::Ipv6PeerUnsupported { principal, peer } => {
                warn!(%principal, %peer, "IPv6 peer address not reported to callbacks");
            }
            other => warn!(event = ?other, "tunnel failure"),
        }
    }
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TunnelEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count the recorded events matching `pred`
    pub fn count(&self, pred: impl Fn(&TunnelEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TunnelEvent) {
        TracingSink.emit(event.clone());
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
