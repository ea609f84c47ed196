//! Plain TCP transport for tunnel connections

use portmesh_common::{Result, TunnelError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub mod batched_sender;
pub mod socket_tuning;

pub use socket_tuning::configure_socket_silent;

/// Dial `addr` and tune the resulting socket
pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout(format!("connecting to {addr}")))??;
    configure_socket_silent(&stream);
    Ok(stream)
}

/// Accept one connection and tune it
pub async fn accept(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    configure_socket_silent(&stream);
    Ok((stream, addr))
}
