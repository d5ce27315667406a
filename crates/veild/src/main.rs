//! veild: veil VPN session daemon
//!
//! Hosts a [`SessionManager`] over a real TUN device and a UDP transport.
//! Loads the TOML config, connects (or restores the previous session with
//! `--boot`), logs status, and tears the session down on Ctrl-C.

mod config;
mod tun;
mod udp;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use veil_session::{ConnectError, JsonFileStore, KeyPair, SessionManager};

use crate::config::DaemonConfig;
use crate::tun::TunPipeProvider;
use crate::udp::UdpTransportBackend;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "veil VPN session daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Run {
        /// Configuration file
        #[arg(short, long, default_value = "/etc/veil/veild.toml")]
        config: PathBuf,

        /// Restore the previous session instead of forcing a connect;
        /// stays down when no stay-connected intent was stored
        #[arg(long)]
        boot: bool,
    },
    /// Generate a credential keypair for the config file
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Run { config, boot } => run(&config, boot).await,
        Command::Keygen => keygen(),
    }
}

fn keygen() -> Result<()> {
    let pair = KeyPair::generate();
    println!("private_key = \"{}\"", pair.private.to_base64());
    println!("public_key = \"{}\"", pair.public.to_base64());
    Ok(())
}

async fn run(config_path: &Path, boot: bool) -> Result<()> {
    info!("veild starting...");
    let config = DaemonConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let provider = Arc::new(TunPipeProvider::new(config.interface.name.clone()));
    let backend = Arc::new(UdpTransportBackend::new());
    let store = Arc::new(JsonFileStore::new(config.daemon.preferences.clone()));

    let session = SessionManager::builder(provider, backend)
        .store(store)
        .config(config.session_config())
        .build();

    if config.daemon.kill_switch {
        session.set_kill_switch(true).await;
    }

    if boot {
        if session.restore().await.context("session restore failed")? {
            info!("previous session restored");
        } else {
            info!("no stay-connected intent stored; staying down");
        }
    } else {
        let params = config.parameters()?;
        match session.connect(params).await {
            Ok(()) | Err(ConnectError::AlreadyConnected) => {}
            Err(error) => return Err(error).context("connect failed"),
        }
    }

    // periodic status line; state transitions are logged by the session
    let status_session = session.clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            let status = status_session.status();
            info!(
                "status: {} (sent {} B, received {} B)",
                status.state, status.bytes_sent, status.bytes_received
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    status_task.abort();
    session.disconnect().await;
    info!("veild stopped");
    Ok(())
}
