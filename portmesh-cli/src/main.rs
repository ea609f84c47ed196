//! portmesh command line
//!
//! Runs the forward server or the tunnel agent, and delivers port events to a
//! running agent.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "portmesh",
    author,
    version,
    about = "Reverse tunnels that follow services across hosts",
    long_about = "portmesh exposes local services on remote hosts through outbound tunnels.\n\n\
                  Run `portmesh server` on every remote host and `portmesh agent` next to\n\
                  the services; port events reach the agent through `portmesh notify`.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the forward server
    Server(commands::server::ServerArgs),

    /// Run the tunnel agent
    Agent(commands::agent::AgentArgs),

    /// Send a port event to a running agent
    Notify(commands::notify::NotifyArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Agent(args) => commands::agent::run(args).await,
        Commands::Notify(args) => commands::notify::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
