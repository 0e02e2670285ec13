//! Dropwire command-line peer.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use peer::config::Config;
use peer::{OutgoingFile, PeerClient, Transfer, TransferDirection, TransferStatus};
use protocol::PeerInfo;
use tracing_subscriber::EnvFilter;

/// Dropwire - send files directly to peers on your network.
#[derive(Parser, Debug)]
#[command(name = "dropwire")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Signaling server URL (overrides config)
    #[arg(short, long, value_name = "URL")]
    pub server: Option<String>,

    /// Display name shown to other peers
    #[arg(short, long)]
    pub name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the other peers on the signaling server
    Peers {
        /// Seconds to wait for the peer list
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Send files to a peer
    Send {
        /// Peer session id or display name
        #[arg(long)]
        to: String,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Seconds to wait for the peer to appear
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Accept incoming files and save them
    Receive {
        /// Directory to save files into (defaults to the download directory)
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Some(server) = cli.server {
        config.network.signaling_url = server;
    }
    if let Some(name) = cli.name {
        config.general.display_name = Some(name);
    }
    config.validate()?;

    init_tracing(&config, cli.verbose);

    let client = PeerClient::start(&config).await?;

    let result = match cli.command {
        Commands::Peers { wait } => list_peers(&client, Duration::from_secs(wait)).await,
        Commands::Send { to, files, wait } => {
            send(&client, &to, files, Duration::from_secs(wait)).await
        }
        Commands::Receive { out } => {
            let dir = out.unwrap_or_else(|| config.transfer.download_dir());
            receive(&client, dir).await
        }
    };

    client.shutdown().await;
    result
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.general.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for the first peer list after joining.
async fn first_peer_list(client: &PeerClient, wait: Duration) -> anyhow::Result<Vec<PeerInfo>> {
    let mut peers = client.subscribe_peers();
    tokio::time::timeout(wait, peers.changed())
        .await
        .context("Timed out waiting for the peer list")?
        .context("Client stopped")?;
    let list = peers.borrow_and_update().clone();
    Ok(list)
}

async fn list_peers(client: &PeerClient, wait: Duration) -> anyhow::Result<()> {
    let peers = first_peer_list(client, wait).await?;
    if let Some(id) = client.session_id() {
        println!("You are {}", id);
    }
    if peers.is_empty() {
        println!("No other peers online");
    }
    for peer in peers {
        println!("{}  {}", peer.id, peer.name);
    }
    Ok(())
}

async fn send(
    client: &Arc<PeerClient>,
    to: &str,
    paths: Vec<PathBuf>,
    wait: Duration,
) -> anyhow::Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = OutgoingFile::from_path(path)
            .await
            .with_context(|| format!("Cannot send {}", path.display()))?;
        files.push(file);
    }

    let mut peers = client.subscribe_peers();
    let peer = tokio::time::timeout(wait, async {
        loop {
            if let Some(peer) = client.find_peer(to) {
                return Some(peer);
            }
            if peers.changed().await.is_err() {
                return None;
            }
        }
    })
    .await
    .ok()
    .flatten()
    .with_context(|| format!("Peer {} not found", to))?;

    println!("Sending {} file(s) to {} ({})", files.len(), peer.name, peer.id);
    let ids: HashSet<String> = client.send_files(&peer.id, files).await?.into_iter().collect();

    let mut transfers = client.subscribe_transfers();
    let finished = loop {
        let mine: Vec<Transfer> = transfers
            .borrow_and_update()
            .iter()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect();
        if mine.len() == ids.len() && mine.iter().all(|t| t.status.is_terminal()) {
            break mine;
        }
        if transfers.changed().await.is_err() {
            bail!("Client stopped before transfers finished");
        }
    };

    let mut failed = 0;
    for transfer in &finished {
        report(transfer);
        if transfer.status == TransferStatus::Error {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{} of {} transfer(s) failed", failed, finished.len());
    }
    Ok(())
}

async fn receive(client: &Arc<PeerClient>, dir: PathBuf) -> anyhow::Result<()> {
    println!("Waiting for files, saving to {} (Ctrl-C to stop)", dir.display());

    let engine = client.engine();
    let mut transfers = client.subscribe_transfers();
    let mut handled = HashSet::new();

    loop {
        let snapshot = transfers.borrow_and_update().clone();
        for transfer in snapshot
            .iter()
            .filter(|t| t.direction == TransferDirection::Incoming)
        {
            match transfer.status {
                TransferStatus::Pending => {
                    if let Err(e) = engine.accept(&transfer.id).await {
                        tracing::warn!(file_id = %transfer.id, "Failed to accept: {}", e);
                    }
                }
                TransferStatus::Completed if handled.insert(transfer.id.clone()) => {
                    match engine.save_completed(&transfer.id, &dir).await {
                        Ok(path) => println!("Saved {}", path.display()),
                        Err(e) => eprintln!("Failed to save {}: {}", transfer.file_name, e),
                    }
                    let _ = engine.clear(&transfer.id);
                }
                TransferStatus::Error if handled.insert(transfer.id.clone()) => report(transfer),
                _ => {}
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = transfers.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn report(transfer: &Transfer) {
    match transfer.status {
        TransferStatus::Completed => println!("{}: done ({} bytes)", transfer.file_name, transfer.file_size),
        TransferStatus::Error => {
            let reason = transfer.error.as_deref().unwrap_or("unknown error");
            let hint = if transfer.is_connectivity_error() {
                " (connection problem, try again)"
            } else {
                ""
            };
            println!("{}: failed: {}{}", transfer.file_name, reason, hint);
        }
        status => println!("{}: {}", transfer.file_name, status),
    }
}
