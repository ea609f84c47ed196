//! Server subcommand implementation

use crate::logging;
use anyhow::{Context, Result};
use clap::Args;
use portmesh::common::{BIND_ADDR_ENV, DEFAULT_SERVER_BIND, DEFAULT_SHARED_SECRET};
use portmesh::core::AuthPolicy;
use portmesh::Server;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address agents dial
    #[arg(long, default_value = DEFAULT_SERVER_BIND, env = "PORTMESH_BIND")]
    bind: SocketAddr,

    /// Shared secret every agent must present
    #[arg(long, default_value = DEFAULT_SHARED_SECRET, env = "PORTMESH_SECRET", hide_default_value = true)]
    secret: String,

    /// Principal allowed to open forwards; repeatable. Any principal is accepted when none is given.
    #[arg(long = "allow", env = "PORTMESH_ALLOW", value_delimiter = ',')]
    allow: Vec<String>,

    /// Originator host announced for forwarded connections
    #[arg(long, env = BIND_ADDR_ENV)]
    origin_host: Option<String>,

    /// Drop agents silent for this many seconds
    #[arg(long, default_value_t = 90, env = "PORTMESH_SESSION_TIMEOUT")]
    session_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    logging::init(&args.log_level);

    info!("Starting portmesh server v{}", env!("CARGO_PKG_VERSION"));
    if args.secret == DEFAULT_SHARED_SECRET {
        warn!("using the built-in shared secret; set --secret or PORTMESH_SECRET");
    }

    let policy = if args.allow.is_empty() {
        warn!("no --allow principals given, accepting any principal");
        AuthPolicy::AnyPrincipal
    } else {
        AuthPolicy::RegisteredPrincipals
    };

    let mut builder = Server::builder()
        .bind(args.bind)
        .shared_secret(args.secret)
        .session_timeout(Duration::from_secs(args.session_timeout))
        .auth_policy(policy);
    if let Some(origin) = args.origin_host {
        builder = builder.origin_host(origin);
    }
    let mut server = builder.build().context("invalid server configuration")?;

    for principal in &args.allow {
        server.users().register_principal(principal.as_str());
    }

    let addr = server.start().await.context("failed to start server")?;
    info!("Accepting agents on {}", addr);

    let interrupted = tokio::select! {
        result = server.wait() => {
            result.context("server stopped")?;
            false
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            true
        }
    };
    if interrupted {
        info!("Shutting down");
        server.shutdown().await?;
    }
    Ok(())
}
