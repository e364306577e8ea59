//! Per-torrent orchestration: the state shared by all peer sessions, the
//! session tasks themselves, and the completion wait.

use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    error::Result,
    metainfo::Metainfo,
    peer::PeerSession,
    piece_picker::PiecePicker,
    storage::{Storage, StorageInfo},
    swarm::Swarm,
    Bitfield, PeerId, Sha1Hash,
};

/// Information and state shared by every peer session of the torrent.
pub(crate) struct Shared {
    /// The torrent's SHA-1 info hash, exchanged in handshakes.
    pub info_hash: Sha1Hash,
    /// The id this client presents to the swarm.
    pub client_id: PeerId,
    /// Static information about the torrent's pieces and length.
    pub storage: StorageInfo,
    /// The expected hash of each piece.
    pub piece_hashes: Vec<Sha1Hash>,
    /// Which pieces we have: verified against their hash and persisted to
    /// the output file. Set-only during the download; full means done.
    pub own_pieces: Mutex<Bitfield>,
}

/// A single torrent download.
///
/// Construction sets up the download state and creates the output file;
/// [`Torrent::start`] drives the swarm until the download completes or every
/// session has stopped.
pub struct Torrent {
    shared: Arc<Shared>,
    picker: Arc<PiecePicker>,
    storage: Arc<Storage>,
    swarm: Arc<Swarm>,
}

impl Torrent {
    /// Sets up the download and creates the output file, named after the
    /// torrent, in the given directory. The client id must be the one
    /// announced to the tracker.
    pub fn new(
        metainfo: &Metainfo,
        client_id: PeerId,
        download_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let info_hash = metainfo.info_hash()?;
        let storage_info = StorageInfo::new(metainfo);
        log::info!(
            "Torrent {} has {} piece(s) of {} bytes",
            hex::encode(info_hash),
            storage_info.piece_count,
            storage_info.piece_len
        );

        let storage = Storage::new(
            storage_info,
            download_dir.as_ref().join(&metainfo.info.name),
        )?;
        let picker = PiecePicker::new(
            storage_info.download_len,
            storage_info.piece_len,
        );
        let shared = Shared {
            info_hash,
            client_id,
            storage: storage_info,
            piece_hashes: metainfo.piece_hashes(),
            own_pieces: Mutex::new(Bitfield::new(storage_info.piece_count)),
        };

        Ok(Self {
            shared: Arc::new(shared),
            picker: Arc::new(picker),
            storage: Arc::new(storage),
            swarm: Arc::new(Swarm::new()),
        })
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.shared.info_hash
    }

    pub fn client_id(&self) -> PeerId {
        self.shared.client_id
    }

    pub fn output_path(&self) -> &Path {
        self.storage.path()
    }

    /// Runs the download against the given peers, one session per address,
    /// until the torrent completes or every session has stopped.
    ///
    /// Returns whether the download completed. The output file is kept only
    /// on completion; an interrupted download removes it.
    pub async fn start(&self, peers: &[SocketAddr]) -> Result<bool> {
        log::info!("Starting torrent with {} peer(s)", peers.len());

        let mut sessions = Vec::with_capacity(peers.len());
        for &addr in peers {
            let (mut session, cmd_chan) = PeerSession::outbound(
                Arc::clone(&self.shared),
                Arc::clone(&self.picker),
                Arc::clone(&self.storage),
                Arc::clone(&self.swarm),
                addr,
            );
            self.swarm.add(addr.to_string(), cmd_chan);
            sessions.push(tokio::spawn(async move {
                if let Err(e) = session.start().await {
                    log::warn!("Peer {} session error: {}", addr, e);
                }
                session.cleanup();
            }));
        }

        // SIGINT and SIGTERM abort the download by closing every session
        let swarm = Arc::clone(&self.swarm);
        let signal_handle = tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => swarm.shutdown(),
                Err(e) => log::error!("Cannot listen for signals: {}", e),
            }
        });

        for session in sessions {
            if let Err(e) = session.await {
                log::error!("Peer session task panicked: {}", e);
            }
        }
        signal_handle.abort();

        let is_complete = self.shared.own_pieces.lock().unwrap().all();
        if is_complete {
            log::info!("Download complete, keeping {:?}", self.output_path());
        } else {
            log::warn!(
                "Download incomplete, removing {:?}",
                self.output_path()
            );
            if let Err(e) = std::fs::remove_file(self.output_path()) {
                log::error!("Cannot remove output file: {}", e);
            }
        }
        Ok(is_complete)
    }
}

/// Completes when the process receives an interrupt or terminate signal.
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    log::info!("Shutdown signal received");
    Ok(())
}
