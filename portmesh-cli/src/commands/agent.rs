//! Agent subcommand implementation

use crate::logging;
use anyhow::{Context, Result};
use clap::Args;
use portmesh::common::{
    DEFAULT_CONTROL_BIND, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_SERVER_PORT, DEFAULT_SHARED_SECRET,
};
use portmesh::core::handoff::HostInfo;
use portmesh::Agent;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Tunnel spec `lhost:lport[@rhost[:rport]]`; repeatable
    #[arg(
        short = 'L',
        long = "spec",
        env = "PORTMESH_SPECS",
        value_delimiter = ',',
        required = true
    )]
    specs: Vec<String>,

    /// Forward server port on the remote hosts
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT, env = "PORTMESH_SERVER_PORT")]
    server_port: u16,

    /// Shared secret presented to every server
    #[arg(long, default_value = DEFAULT_SHARED_SECRET, env = "PORTMESH_SECRET", hide_default_value = true)]
    secret: String,

    /// Seconds between two retry attempts
    #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL_SECS, env = "PORTMESH_INTERVAL")]
    interval: u64,

    /// Control endpoint address
    #[arg(long, default_value = DEFAULT_CONTROL_BIND, env = "PORTMESH_CONTROL")]
    control: SocketAddr,

    /// Run without a control endpoint
    #[arg(long, conflicts_with = "control")]
    no_control: bool,

    /// Listen host requested from servers instead of the resolved address
    #[arg(long, env = "PORTMESH_FORWARD_BIND_HOST")]
    forward_bind_host: Option<String>,

    /// Wait for a host record on this Unix socket and connect its app port
    #[arg(long, env = "PORTMESH_HANDOFF")]
    handoff: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

pub async fn run(args: AgentArgs) -> Result<()> {
    logging::init(&args.log_level);

    info!("Starting portmesh agent v{}", env!("CARGO_PKG_VERSION"));
    if args.secret == DEFAULT_SHARED_SECRET {
        warn!("using the built-in shared secret; set --secret or PORTMESH_SECRET");
    }

    let host = match &args.handoff {
        Some(path) => Some(wait_for_host(path).await?),
        None => None,
    };

    let mut builder = Agent::builder()
        .specs(args.specs)
        .shared_secret(args.secret)
        .server_port(args.server_port)
        .retry_interval(Duration::from_secs(args.interval))
        .control_bind((!args.no_control).then_some(args.control));
    if let Some(bind_host) = args.forward_bind_host {
        builder = builder.forward_bind_host(bind_host);
    }
    if let Some(host) = host {
        builder = builder.host(host);
    }
    let mut agent = builder.build().context("invalid agent configuration")?;

    agent.start().await.context("failed to start agent")?;
    if let Some(addr) = agent.control_addr() {
        info!("Port events accepted on {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    agent.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_host(path: &std::path::Path) -> Result<HostInfo> {
    let mut records = portmesh::core::handoff::serve(path)
        .with_context(|| format!("failed to listen on {}", path.display()))?;
    let host = records
        .recv()
        .await
        .context("handoff listener stopped before a record arrived")?;
    info!(
        pid = host.pid,
        app_port = host.app_port,
        uid = host.uid,
        "host handoff received"
    );
    Ok(host)
}

#[cfg(not(unix))]
async fn wait_for_host(_path: &std::path::Path) -> Result<HostInfo> {
    anyhow::bail!("--handoff needs Unix domain sockets")
}
