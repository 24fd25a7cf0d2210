use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarm_rs::client::{ClientConfig, TorrentSession};

/// Download the content described by a torrent file.
#[derive(Debug, Parser)]
#[command(name = "swarm_rs", version, about)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Directory to download into.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Directory for resume state; omit to start fresh every run.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Connected-peer target for this torrent.
    #[arg(long, default_value_t = 20)]
    max_peers: usize,

    /// Port reported to the tracker.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::default()
        .with_download_path(args.output)
        .with_listen_port(args.port);
    config.max_peers_per_torrent = args.max_peers;
    if let Some(state_dir) = args.state_dir {
        config = config.with_state_dir(state_dir);
    }

    let session = TorrentSession::new(args.torrent, config).await?;
    session.start().await
}
