use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use leechtorrent::{
    conf,
    error::{Error, Result},
    metainfo::Metainfo,
    torrent::Torrent,
    tracker,
};

/// Downloads the single file torrent described by a metainfo document into
/// the current directory.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent metainfo file.
    metainfo: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("error: download did not complete");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let buf = std::fs::read(&args.metainfo)?;
    let metainfo = Metainfo::from_bytes(&buf)?;
    log::info!(
        "Loaded metainfo for {} ({} bytes)",
        metainfo.info.name,
        metainfo.download_len()
    );

    let client_id = conf::generate_peer_id();
    let response = tracker::announce(&tracker::AnnounceParams {
        url: metainfo.announce.clone(),
        info_hash: metainfo.info_hash()?,
        peer_id: client_id,
        port: conf::DEFAULT_PORT,
        uploaded: 0,
        downloaded: 0,
        left: metainfo.download_len(),
    })
    .await?;
    if response.peers.is_empty() {
        return Err(Error::NoPeers);
    }

    let torrent = Torrent::new(&metainfo, client_id, ".")?;
    torrent.start(&response.peers).await
}
