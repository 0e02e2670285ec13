//! Dropwire Signaling Server
//!
//! Rendezvous and relay service for Dropwire peers.

use std::path::PathBuf;

use clap::Parser;
use signaling::config::Config;
use signaling::SignalingServer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Dropwire signaling server - peer discovery and negotiation relay.
#[derive(Parser, Debug)]
#[command(name = "dropwire-signaling")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    let _guard = init_tracing(&config, cli.verbose);

    tracing::info!("Dropwire signaling server starting...");

    let server = SignalingServer::new(&config.server);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt");
        }
        shutdown.cancel();
    });

    server.bind_and_serve(&config.server.bind).await?;

    tracing::info!("Dropwire signaling server stopped");
    Ok(())
}

/// Installs the tracing subscriber.
///
/// Logs always go to stderr; when `logging.log_dir` is set they are also
/// written to a daily-rolling file. The returned guard flushes the file
/// writer on drop.
fn init_tracing(config: &Config, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dropwire-signaling.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
