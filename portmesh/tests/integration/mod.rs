#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for `portmesh`
//!
//! These tests run a forward server and agents in-process over loopback.

mod agent_test;
mod control_test;
mod forward_test;
mod multi_host_test;

use portmesh::core::agent::{FixedAddresses, StaticResolver};
use portmesh::prelude::*;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

pub const SECRET: &str = "integration-secret";

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(31000);

pub fn get_free_port() -> u16 {
    use std::sync::atomic::Ordering;
    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Wait for a server to start listening
pub async fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Start a TCP server that echoes every byte back
pub async fn start_echo_server(addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    })
}

/// Write `payload` and read the same number of bytes back
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// Forward server on `addr` accepting any principal
pub async fn start_server(addr: SocketAddr, events: RecordingSink) -> Server {
    let mut server = Server::builder()
        .bind(addr)
        .shared_secret(SECRET)
        .auth_policy(AuthPolicy::AnyPrincipal)
        .events(Arc::new(events))
        .build()
        .unwrap();
    server.start().await.unwrap();
    server
}

/// Agent resolving `db` to `ips`, with no local addresses and no control endpoint
pub fn agent_builder(server_port: u16, ips: Vec<Ipv4Addr>) -> portmesh::AgentBuilder {
    Agent::builder()
        .shared_secret(SECRET)
        .server_port(server_port)
        .retry_interval(Duration::from_millis(100))
        .control_bind(None)
        .resolver(Arc::new(StaticResolver::new().with_host("db", ips)))
        .local_addresses(Arc::new(FixedAddresses::default()))
}
