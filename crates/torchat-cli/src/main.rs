//! TorChat Command-Line Interface
//!
//! Runs one TorChat node in the terminal. Chat commands are read from
//! stdin and engine events are printed as they arrive.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

mod commands;

/// TorChat - instant messaging over Tor hidden services
#[derive(Parser)]
#[command(name = "torchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TorChat node
    Run {
        /// This node's hidden-service id (16 or 56 base32 characters)
        #[arg(long)]
        id: String,

        /// Local listener the hidden service forwards to
        #[arg(long, default_value = "127.0.0.1:11009")]
        listen: SocketAddr,

        /// Tor SOCKS5 proxy
        #[arg(long, default_value = "127.0.0.1:9050", conflicts_with = "direct")]
        socks: SocketAddr,

        /// Dial `<id>.onion` without a proxy (test networks only)
        #[arg(long)]
        direct: bool,

        /// Port dialled on remote hidden services
        #[arg(long, default_value = "11009")]
        peer_port: u16,

        /// Download folder; `{id}` is replaced by the buddy id
        #[arg(long, default_value = "~/Downloads/torchat/{id}")]
        downloads: String,

        /// Ask before accepting incoming files
        #[arg(long)]
        no_auto_accept: bool,

        /// Profile name sent to buddies
        #[arg(long, default_value = "")]
        name: String,

        /// Buddies to connect to on startup
        #[arg(long)]
        connect: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            id,
            listen,
            socks,
            direct,
            peer_port,
            downloads,
            no_auto_accept,
            name,
            connect,
        } => {
            let options = commands::RunOptions {
                id,
                listen,
                proxy: (!direct).then_some(socks),
                peer_port,
                downloads,
                auto_accept: !no_auto_accept,
                profile_name: name,
                connect,
            };
            commands::run_node(options).await?;
        }
    }

    Ok(())
}
