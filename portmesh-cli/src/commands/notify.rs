//! Notify subcommand: deliver a port event to a running agent

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use portmesh::common::DEFAULT_CONTROL_BIND;
use portmesh::core::agent::ControlClient;
use std::net::SocketAddr;

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Control endpoint of the agent
    #[arg(long, default_value = DEFAULT_CONTROL_BIND, env = "PORTMESH_CONTROL")]
    control: SocketAddr,

    #[command(subcommand)]
    event: PortEvent,
}

#[derive(Subcommand, Debug)]
enum PortEvent {
    /// A local port started listening
    Connect {
        lport: String,
        /// Remote port to request; `0` lets the server pick
        rport: Option<String>,
    },

    /// A local port stopped listening
    Disconnect { lport: String },
}

pub async fn run(args: NotifyArgs) -> Result<()> {
    let client = ControlClient::new(args.control);
    match args.event {
        PortEvent::Connect { lport, rport } => client
            .connect(&lport, rport.as_deref())
            .await
            .with_context(|| format!("connect {lport} failed")),
        PortEvent::Disconnect { lport } => client
            .disconnect(&lport)
            .await
            .with_context(|| format!("disconnect {lport} failed")),
    }
}
