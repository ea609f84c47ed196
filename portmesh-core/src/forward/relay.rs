//! Bidirectional byte relay

use portmesh_common::TunnelError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    Local,
    Tunnel,
}

/// How a relay ended
#[derive(Debug)]
pub struct RelayOutcome {
    /// Side whose read half finished first
    pub closed_by: RelaySide,
    /// Bytes moved in the direction that finished
    pub bytes: u64,
    /// Read or write failure that ended the relay, as [`TunnelError::Relay`]
    pub error: Option<TunnelError>,
}

/// Copy bytes both ways until either side closes or fails, then close both
pub async fn relay<L, T>(local: L, tunnel: T) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(tunnel);

    let (closed_by, result) = tokio::select! {
        r = tokio::io::copy(&mut local_rd, &mut tunnel_wr) => (RelaySide::Local, r),
        r = tokio::io::copy(&mut tunnel_rd, &mut local_wr) => (RelaySide::Tunnel, r),
    };

    let _ = local_wr.shutdown().await;
    let _ = tunnel_wr.shutdown().await;

    match result {
        Ok(bytes) => RelayOutcome {
            closed_by,
            bytes,
            error: None,
        },
        Err(e) => RelayOutcome {
            closed_by,
            bytes: 0,
            error: Some(TunnelError::Relay(format!("{closed_by:?} side: {e}"))),
        },
    }
}
