//! `rstc` — a thin CLI driving the rs-torrent-client library: inspect a
//! torrent file, list its tracker's peers, or run a full leech download.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rs_torrent_client::download::download;
use rs_torrent_client::torrent::TorrentFile;
use rs_torrent_client::tracker::Client as TrackerClient;
use std::net::SocketAddr;
use std::path::PathBuf;

/// The constant listening port advertised to the tracker. This client never
/// actually listens; seeding is out of scope.
const LISTEN_PORT: u16 = 65534;

#[derive(Parser)]
#[command(name = "rstc", about = "A minimal BitTorrent leech client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a torrent file's metadata.
    Info { torrent_file: PathBuf },
    /// Announce to the tracker and print the peer list.
    Peers { torrent_file: PathBuf },
    /// Download the torrent's content and write it to a single file.
    Download {
        torrent_file: PathBuf,
        output_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info { torrent_file } => cmd_info(&torrent_file),
        Command::Peers { torrent_file } => cmd_peers(&torrent_file).await,
        Command::Download {
            torrent_file,
            output_file,
        } => cmd_download(&torrent_file, &output_file).await,
    }
}

fn load_torrent(path: &std::path::Path) -> Result<TorrentFile> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading torrent file {}", path.display()))?;
    Ok(TorrentFile::parse(&data)?)
}

fn cmd_info(path: &std::path::Path) -> Result<()> {
    let torrent = load_torrent(path)?;
    println!("announce:     {}", torrent.announce);
    println!("info hash:    {}", hex::encode(torrent.info_hash));
    println!("piece length: {}", torrent.piece_length);
    println!("num pieces:   {}", torrent.num_pieces());
    println!("length:       {}", torrent.length());
    Ok(())
}

async fn cmd_peers(path: &std::path::Path) -> Result<()> {
    let torrent = load_torrent(path)?;
    let client = TrackerClient::new(LISTEN_PORT)?;
    let response = client.announce(&torrent).await?;
    for peer in response.peers {
        println!("{}:{}", peer.ip, peer.port);
    }
    Ok(())
}

async fn cmd_download(torrent_path: &std::path::Path, output_path: &std::path::Path) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;
    let client = TrackerClient::new(LISTEN_PORT)?;
    let response = client.announce(&torrent).await?;
    let peers: Vec<SocketAddr> = response
        .peers
        .iter()
        .map(|p| SocketAddr::new(p.ip, p.port))
        .collect();

    if peers.is_empty() {
        anyhow::bail!("tracker returned no peers");
    }

    let content = download(&torrent, client.peer_id(), &peers)
        .await
        .context("download failed")?;
    std::fs::write(output_path, &content)
        .with_context(|| format!("writing output file {}", output_path.display()))?;
    println!("wrote {} bytes to {}", content.len(), output_path.display());
    Ok(())
}
