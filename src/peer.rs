//! One peer session per remote peer.
//!
//! A session dials the peer, exchanges handshakes, and then runs a message
//! loop that keeps a pipeline of block requests filled from the shared piece
//! picker. Incoming blocks are assembled by the storage layer; when a piece
//! completes the session verifies it, persists it, and notifies the swarm.
//! Any error local to the session tears down only this session: outstanding
//! reservations are given back to the picker and the swarm forgets us.

pub mod codec;

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task, time,
    time::Instant,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf,
    error::{Error, Result},
    piece_picker::PiecePicker,
    storage::Storage,
    swarm::Swarm,
    torrent::Shared,
    Bitfield, BlockInfo, PieceIndex,
};
use codec::*;

/// The channel on which the swarm can send a command to the peer session
/// task.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
#[derive(Clone, Copy, Debug)]
pub enum Command {
    /// Announce to the remote peer that we completed and persisted a piece.
    Have(PieceIndex),
    /// Withdraw our request for the block if we have one outstanding;
    /// another session received the block first.
    Cancel(BlockInfo),
    /// Eventually shut down the peer session.
    Shutdown,
}

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<Shared>,
    /// The piece picker picks the next most optimal block to download and is
    /// shared by all sessions of the same torrent.
    picker: Arc<PiecePicker>,
    /// The entity assembling and persisting downloaded blocks.
    storage: Arc<Storage>,
    /// The registry of all live sessions, used to fan out haves and cancels
    /// for the pieces this session completes.
    swarm: Arc<Swarm>,
    /// The port on which the peer session receives commands.
    cmd_port: Receiver,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The key under which this session's reservations and registry entry
    /// are kept: the remote address as a string.
    key: String,
    /// Session related information.
    status: Status,
    /// The pieces the peer advertised through its bitfield and subsequent
    /// have messages.
    peer_pieces: Bitfield,
    /// Our pending requests that we sent to peer, in request order. It
    /// represents the blocks we are expecting: the peer serves requests in
    /// the order they were made, so an incoming block must match the front
    /// of this queue (or a cancelled request whose block was already on the
    /// wire).
    outgoing_requests: VecDeque<BlockInfo>,
    /// Requests we cancelled but whose blocks may still legitimately arrive.
    cancelled_requests: HashSet<BlockInfo>,
    /// How many pieces this peer contributed the completing block to that
    /// then failed hash verification.
    hash_failures: usize,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address and
    /// the channel on which the swarm can command it.
    pub(crate) fn outbound(
        torrent: Arc<Shared>,
        picker: Arc<PiecePicker>,
        storage: Arc<Storage>,
        swarm: Arc<Swarm>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = torrent.storage.piece_count;
        (
            Self {
                torrent,
                picker,
                storage,
                swarm,
                cmd_port,
                addr,
                key: addr.to_string(),
                status: Status::default(),
                peer_pieces: Bitfield::new(piece_count),
                outgoing_requests: VecDeque::new(),
                cancelled_requests: HashSet::new(),
                hash_failures: 0,
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns if the connection is closed or an
    /// error occurs.
    pub(crate) async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = time::timeout(
            conf::CONNECT_TIMEOUT,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            match time::timeout(conf::PEER_TIMEOUT, socket.next())
                .await
                .map_err(|_| Error::Timeout)?
            {
                Some(peer_handshake) => peer_handshake?,
                None => return Err(Error::Truncated),
            };
        log::info!("Received handshake from peer {}", self.addr);
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // codec should only return a handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, handshake.prot);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            // abort session, info hash is invalid
            return Err(Error::BadInfoHash);
        }

        // now that we have the handshake, we need to switch to the peer
        // message codec (note that we need to keep the buffer of the
        // original codec as it may contain bytes of any message the peer may
        // have sent after the handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // a bitfield may only arrive as the peer's first message, so enter
        // the piece availability exchange state until we see what it sends
        // (we don't send one: we start with nothing and advertise through
        // have messages instead)
        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        self.run(socket).await
    }

    /// Runs the session after the connection to the peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that the message handlers can write
        // while the loop holds the read half
        let (mut sink, mut stream) = socket.split();

        // the read deadline is pushed out by anything the peer sends,
        // keep-alives included
        let deadline = time::sleep(conf::PEER_TIMEOUT);
        tokio::pin!(deadline);
        // a keep-alive is written whenever the connection would otherwise go
        // quiet for the whole interval; every other write resets it
        let mut keep_alive = time::interval_at(
            Instant::now() + conf::KEEP_ALIVE_INTERVAL,
            conf::KEEP_ALIVE_INTERVAL,
        );

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    let msg = match maybe_msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            return Ok(());
                        }
                    };
                    deadline.as_mut().reset(Instant::now() + conf::PEER_TIMEOUT);
                    self.handle_msg(&mut sink, &mut keep_alive, msg).await?;
                }
                _ = &mut deadline => {
                    log::warn!("Peer {} timed out", self.addr);
                    return Err(Error::Timeout);
                }
                _ = keep_alive.tick() => {
                    log::debug!("Sending keep alive to peer {}", self.addr);
                    sink.send(Message::KeepAlive).await?;
                }
                maybe_cmd = self.cmd_port.recv() => {
                    let cmd = match maybe_cmd {
                        Some(cmd) => cmd,
                        // the swarm dropped us, nothing left to do
                        None => return Ok(()),
                    };
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            return Ok(());
                        }
                        Command::Have(index) => {
                            self.send(&mut sink, &mut keep_alive, Message::Have(index)).await?;
                        }
                        Command::Cancel(block) => {
                            self.handle_cancel_cmd(&mut sink, &mut keep_alive, block).await?;
                        }
                    }
                }
            }
        }
    }

    /// Handles a message received from the peer, dispatching on the session
    /// state and the message kind.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
        msg: Message,
    ) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );

        // handle the bitfield message separately as it may only be received
        // directly after the handshake; the first message of any other kind
        // also ends the availability exchange
        if self.status.state == State::AvailabilityExchange {
            self.status.state = State::Connected;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );
            if let Message::Bitfield(bytes) = msg {
                return self
                    .handle_bitfield_msg(sink, keep_alive, &bytes)
                    .await;
            }
        }

        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // our outstanding requests stay reserved: the peer may
                    // still serve them after unchoking us, and if not, the
                    // read deadline reclaims them
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // the peer may have dropped the requests it received
                    // while choking us, so re-issue the pipeline before
                    // topping it up
                    let unresolved: Vec<BlockInfo> =
                        self.outgoing_requests.iter().copied().collect();
                    for block in unresolved {
                        self.send(sink, keep_alive, Message::Request(block))
                            .await?;
                    }
                    self.make_requests(sink, keep_alive).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have(index) => {
                self.handle_have_msg(sink, keep_alive, index).await?;
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;
                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink, keep_alive).await?;
            }
            // we never serve pieces so peers have nothing to request from or
            // cancel at us
            Message::Request(_) | Message::Cancel(_) => {
                log::warn!(
                    "Peer {} sent unexpected message: {:?}",
                    self.addr,
                    msg.id()
                );
            }
            Message::Port(port) => {
                log::debug!(
                    "Peer {} sent DHT port {}, ignoring",
                    self.addr,
                    port
                );
            }
        }

        Ok(())
    }

    /// Handles the peer's bitfield: registers its pieces with the picker and
    /// expresses interest if the peer has anything we lack.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
        bytes: &[u8],
    ) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.addr);

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. The spare bits must be zero.
        self.peer_pieces.replace(bytes)?;
        log::debug!(
            "Peer {} has {} pieces",
            self.addr,
            self.peer_pieces.count_ones()
        );
        self.picker.increment_availability(&self.peer_pieces)?;

        let interesting = {
            let own_pieces = self.torrent.own_pieces.lock().unwrap();
            self.peer_pieces.has_any_missing_from(&own_pieces)
        };
        if interesting {
            self.send_interested(sink, keep_alive).await?;
        }
        Ok(())
    }

    /// Handles a have message: the peer gained a piece.
    async fn handle_have_msg(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
        index: PieceIndex,
    ) -> Result<()> {
        log::debug!("Peer {} has piece {}", self.addr, index);
        // only count availability when the bit actually flips, a peer may
        // redundantly announce pieces its bitfield already contained
        if !self.peer_pieces.get(index)? {
            self.peer_pieces.set(index)?;
            self.picker.increment_piece_availability(index)?;
        }

        let own_has = self.torrent.own_pieces.lock().unwrap().get(index)?;
        if !own_has && !self.status.is_interested {
            self.send_interested(sink, keep_alive).await?;
            // if the peer already unchoked us, the new piece may be
            // requestable right away
            self.make_requests(sink, keep_alive).await?;
        }
        Ok(())
    }

    /// Verifies that the block was expected, hands it to storage, and drives
    /// the piece completion steps if it was the piece's last missing block.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        log::debug!("Received block {:?} from peer {}", block, self.addr);

        // the peer serves requests in the order we made them: the block must
        // match the front of the pipeline or a request we cancelled whose
        // block was already on the wire
        if self.outgoing_requests.front() == Some(&block) {
            self.outgoing_requests.pop_front();
        } else if !self.cancelled_requests.remove(&block) {
            log::warn!(
                "Peer {} sent unexpected block: {:?}",
                self.addr,
                block
            );
            return Err(Error::UnexpectedBlock(block));
        }

        let block_index = block.index_in_piece();
        if self
            .picker
            .is_block_already_received(piece_index, block_index)?
        {
            // an endgame duplicate that another session won
            log::debug!("Block {:?} already received, dropping", block);
            return Ok(());
        }

        self.storage.save_at(piece_index, offset, &data)?;
        let completion =
            self.picker
                .mark_block_done(piece_index, block_index, &self.key)?;
        if !completion.other_requesters.is_empty() {
            log::debug!(
                "Cancelling block {:?} at {} other requesters",
                block,
                completion.other_requesters.len()
            );
            self.swarm.broadcast_cancel(block, &self.key);
        }
        if completion.piece_complete {
            self.complete_piece(piece_index).await?;
        }
        Ok(())
    }

    /// Verifies a fully received piece, and on success persists it and
    /// announces it to the swarm. A hash mismatch requeues the piece and
    /// counts against the peer.
    async fn complete_piece(&mut self, index: PieceIndex) -> Result<()> {
        log::info!("Finished piece {} via peer {}", index, self.addr);

        // don't block the executor with the potentially expensive hashing
        let storage = Arc::clone(&self.storage);
        let expected_hash = self.torrent.piece_hashes[index];
        let is_valid =
            task::spawn_blocking(move || storage.verify(index, &expected_hash))
                .await
                .expect("piece verification task panicked")?;

        if !is_valid {
            log::warn!(
                "Piece {} via peer {} failed hash verification",
                index,
                self.addr
            );
            self.picker.fail_piece(index)?;
            self.hash_failures += 1;
            if self.hash_failures > conf::MAX_HASH_FAILURES {
                return Err(Error::TooManyHashFailures(self.hash_failures));
            }
            return Ok(());
        }

        log::info!("Piece {} is valid", index);
        self.picker.mark_piece_done(index)?;
        // nor with the sync disk write
        let storage = Arc::clone(&self.storage);
        task::spawn_blocking(move || storage.write_to_disk(index))
            .await
            .expect("disk write task panicked")?;

        // our bitfield only admits verified and persisted pieces, and is
        // updated before the have broadcast goes out
        let is_download_complete = {
            let mut own_pieces = self.torrent.own_pieces.lock().unwrap();
            own_pieces.set(index)?;
            own_pieces.all()
        };
        self.swarm.broadcast_have(index, &self.key);

        if is_download_complete {
            log::info!("Download complete");
            self.swarm.shutdown();
        }
        Ok(())
    }

    /// Withdraws our request for the block, if one is outstanding: another
    /// session already received the block.
    async fn handle_cancel_cmd(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
        block: BlockInfo,
    ) -> Result<()> {
        if let Some(pos) =
            self.outgoing_requests.iter().position(|b| *b == block)
        {
            log::debug!(
                "Cancelling request {:?} at peer {}",
                block,
                self.addr
            );
            self.outgoing_requests.remove(pos);
            // the peer may have put the block on the wire already, so accept
            // it if it still arrives
            self.cancelled_requests.insert(block);
            self.send(sink, keep_alive, Message::Cancel(block)).await?;
            self.make_requests(sink, keep_alive).await?;
        }
        Ok(())
    }

    /// Fills the session's request pipeline from the picker.
    ///
    /// While we are interested, unchoked, and below the pipeline limit, new
    /// requests are made. When the picker has nothing left for this peer and
    /// no requests are in flight, interest is withdrawn.
    async fn make_requests(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        while self.outgoing_requests.len() < conf::MAX_PIPELINED_REQUESTS {
            let block = match self.picker.pick(&self.peer_pieces, &self.key)? {
                Some(block) => block,
                None => {
                    if self.outgoing_requests.is_empty() {
                        log::info!(
                            "No blocks to request from peer {}",
                            self.addr
                        );
                        self.send(sink, keep_alive, Message::NotInterested)
                            .await?;
                        self.status.is_interested = false;
                    }
                    break;
                }
            };
            log::debug!(
                "Requesting block {:?} from peer {}",
                block,
                self.addr
            );
            self.outgoing_requests.push_back(block);
            self.send(sink, keep_alive, Message::Request(block)).await?;
        }
        Ok(())
    }

    async fn send_interested(
        &mut self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
    ) -> Result<()> {
        log::info!("Interested in peer {}", self.addr);
        self.send(sink, keep_alive, Message::Interested).await?;
        self.status.is_interested = true;
        Ok(())
    }

    async fn send(
        &self,
        sink: &mut MessageSink,
        keep_alive: &mut time::Interval,
        msg: Message,
    ) -> Result<()> {
        sink.send(msg).await?;
        // any write makes a keep-alive unnecessary for another interval
        keep_alive.reset();
        Ok(())
    }

    /// Releases everything the session holds of the shared download state.
    /// Must run on every exit path, error or not.
    pub(crate) fn cleanup(&mut self) {
        log::info!("Peer {} session stopped", self.addr);
        // give back every outstanding reservation so other sessions can pick
        // the blocks up
        while let Some(block) = self.outgoing_requests.pop_front() {
            if let Err(e) = self.picker.fail_block(
                block.piece_index,
                block.index_in_piece(),
                &self.key,
            ) {
                log::warn!("Failed to return block {:?}: {}", block, e);
            }
        }
        if self.peer_pieces.count_ones() > 0 {
            if let Err(e) =
                self.picker.decrement_availability(&self.peer_pieces)
            {
                log::warn!(
                    "Failed to decrement peer {} availability: {}",
                    self.addr,
                    e
                );
            }
        }
        self.swarm.remove(&self.key);
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    /// Never flipped by this client as we don't serve pieces.
    #[allow(dead_code)]
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    #[default]
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The state between the handshake and the peer's first message, which
    /// is the only point a bitfield message is valid. Any subsequent
    /// bitfield message is rejected and the connection dropped, as per the
    /// standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any message,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}
