//! stalltun — run a stallable TCP relay from the command line.
//!
//! Listens locally, relays every client to one fixed upstream, and takes
//! lock/unlock commands on stdin so a person (or a script) can hold traffic
//! in either direction while poking at the client under test.

mod config;
mod control;

use clap::Parser;
use config::{Config, Overrides};
use stalltun_core::Tunnel;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// stalltun — stallable TCP relay for timeout testing
#[derive(Parser, Debug)]
#[command(name = "stalltun", version, about = "Stallable TCP relay for timeout testing")]
struct Cli {
    /// Upstream address every session is relayed to (host:port)
    #[arg(short, long)]
    remote: Option<String>,

    /// Local listen address (default 127.0.0.1:0)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Per-direction transfer buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Give up dialing the upstream after this many milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.stalltun/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries control replies.
    let env_filter = if cli.verbose {
        EnvFilter::new("stalltun=debug,stalltun_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("stalltun=info,stalltun_core=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = Config::load(&PathBuf::from(&cli.config))?;
    let tunnel_config = file.resolve(Overrides {
        listen_addr: cli.listen,
        remote_addr: cli.remote,
        buffer_size: cli.buffer_size,
        connect_timeout_ms: cli.connect_timeout_ms,
    })?;

    let tunnel = Tunnel::start(tunnel_config).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %tunnel.addr(),
        remote = %tunnel.remote_addr(),
        "stalltun ready"
    );
    println!("{}", tunnel.addr());

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let control = tokio::select! {
        result = control::run(&tunnel, stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
        // A fatal accept or dial error ends the loop; close reports it.
        _ = tunnel.stopped() => {
            warn!("tunnel stopped");
            Ok(())
        }
    };

    tunnel.close().await?;
    control
}
