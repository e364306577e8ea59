//! The piece picker decides, for every requesting peer at every moment, which
//! block of which piece to download next.
//!
//! All sessions of a torrent share one picker, so the selection policy is
//! global: a block is normally requested from a single peer only, partially
//! requested pieces are finished before new ones are started, and new pieces
//! are chosen rarest first once the early random warm-up is over. When the
//! queue of fresh pieces runs dry the picker enters endgame and hands out
//! duplicate requests for the still pending blocks, so the download doesn't
//! stall on a single slow peer.

use std::sync::Mutex;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    bitfield::Bitfield,
    block_count, block_len, conf,
    error::{Error, Result},
    BlockInfo, PieceIndex, BLOCK_LEN,
};

/// At any given time, every piece of the torrent is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet started, any block of it may be picked.
    InQueue,
    /// Some blocks are requested, some are still free to pick.
    InProgress,
    /// Every block has been requested at least once; the piece is waiting for
    /// its remaining blocks to arrive.
    Pending,
    /// All blocks received and the piece hash matched the expected hash. A
    /// piece never leaves this state.
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    InQueue,
    Requested,
    Received,
}

struct Block {
    state: BlockState,
    /// The peers with an outstanding request for this block. Non-empty
    /// exactly when the state is `Requested`; more than one entry only
    /// happens during endgame.
    requesters: Vec<String>,
}

struct Piece {
    state: PieceState,
    /// The number of peers in the swarm known to have this piece.
    availability: u32,
    blocks: Vec<Block>,
}

/// The outcome of registering a received block, used by the session to decide
/// whether to broadcast cancels and whether to verify the piece.
#[derive(Debug, Default)]
pub struct BlockCompletion {
    /// The other peers that also have an outstanding request for this block
    /// (endgame duplicates).
    pub other_requesters: Vec<String>,
    /// True when this call received the piece's last missing block. The piece
    /// stays pending until the session reports the hash verdict via
    /// [`PiecePicker::mark_piece_done`] or [`PiecePicker::fail_piece`].
    pub piece_complete: bool,
}

/// The shared block selection state of a download.
///
/// All operations are atomic: the whole state sits behind a single mutex that
/// each public method holds for the duration of the call. The ordered working
/// list is re-sorted whenever availability or piece states change, so a pick
/// is a linear scan and never sorts.
pub struct PiecePicker {
    inner: Mutex<Inner>,
}

struct Inner {
    pieces: Vec<Piece>,
    /// Indices of pieces that still have blocks free to pick. In-progress
    /// pieces form a prefix (strict priority), the queued remainder is sorted
    /// by ascending availability with ties broken by insertion order.
    working: Vec<PieceIndex>,
    /// How many pieces have ever been moved in progress. Monotonic; drives
    /// the early random warm-up.
    started_count: usize,
    rng: StdRng,
    piece_len: u32,
    download_len: u64,
}

impl PiecePicker {
    /// Creates a picker for a download of the given total and piece length.
    pub fn new(download_len: u64, piece_len: u32) -> Self {
        Self::with_rng(download_len, piece_len, StdRng::from_entropy())
    }

    /// Creates a picker whose random warm-up is driven by the given seed.
    pub fn with_seed(download_len: u64, piece_len: u32, seed: u64) -> Self {
        Self::with_rng(download_len, piece_len, StdRng::seed_from_u64(seed))
    }

    fn with_rng(download_len: u64, piece_len: u32, rng: StdRng) -> Self {
        debug_assert!(piece_len > 0);
        debug_assert!(download_len > 0);
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let pieces = (0..piece_count)
            .map(|index| {
                let piece_len = piece_len_at(download_len, piece_len, index);
                let blocks = (0..block_count(piece_len))
                    .map(|_| Block {
                        state: BlockState::InQueue,
                        requesters: Vec::new(),
                    })
                    .collect();
                Piece {
                    state: PieceState::InQueue,
                    availability: 0,
                    blocks,
                }
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                pieces,
                working: (0..piece_count).collect(),
                started_count: 0,
                rng,
                piece_len,
                download_len,
            }),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.inner.lock().unwrap().pieces.len()
    }

    /// Picks the next block to request from a peer that has the pieces
    /// described by `have`, or `None` if the peer has nothing we need.
    ///
    /// The returned block is reserved for the peer: it won't be offered to
    /// anyone else outside of endgame, and the reservation must eventually be
    /// resolved with [`Self::mark_block_done`] or [`Self::fail_block`].
    pub fn pick(
        &self,
        have: &Bitfield,
        peer: &str,
    ) -> Result<Option<BlockInfo>> {
        let mut inner = self.inner.lock().unwrap();
        if have.len() != inner.pieces.len() {
            return Err(Error::InvalidBitfield("wrong piece count"));
        }

        // strict priority: always continue the first partially requested
        // piece the peer has
        let in_progress = inner.working.iter().copied().find(|&index| {
            inner.pieces[index].state == PieceState::InProgress
                && have.get(index).unwrap_or(false)
        });
        if let Some(index) = in_progress {
            return Ok(Some(inner.pick_block_in(index, peer)));
        }

        let queued = if inner.started_count < conf::WARMUP_PIECE_COUNT {
            // early in the download pick at random to diversify the swarm
            let candidates: Vec<PieceIndex> = inner
                .working
                .iter()
                .copied()
                .filter(|&index| {
                    inner.pieces[index].state == PieceState::InQueue
                        && have.get(index).unwrap_or(false)
                })
                .collect();
            if candidates.is_empty() {
                None
            } else {
                let chosen = inner.rng.gen_range(0..candidates.len());
                Some(candidates[chosen])
            }
        } else {
            // the queued tail of the working list is sorted rarest first
            inner.working.iter().copied().find(|&index| {
                inner.pieces[index].state == PieceState::InQueue
                    && have.get(index).unwrap_or(false)
            })
        };
        if let Some(index) = queued {
            return Ok(Some(inner.pick_block_in(index, peer)));
        }

        // endgame: every remaining piece is pending, so allow duplicating
        // another peer's outstanding request, as long as this peer isn't
        // already a requester of the block
        if inner.working.is_empty() {
            let inner = &mut *inner;
            for (index, piece) in inner.pieces.iter_mut().enumerate() {
                if piece.state != PieceState::Pending
                    || !have.get(index).unwrap_or(false)
                {
                    continue;
                }
                let block_index = piece.blocks.iter().position(|block| {
                    block.state == BlockState::Requested
                        && !block.requesters.iter().any(|r| r == peer)
                });
                if let Some(block_index) = block_index {
                    piece.blocks[block_index]
                        .requesters
                        .push(peer.to_string());
                    let piece_len = piece_len_at(
                        inner.download_len,
                        inner.piece_len,
                        index,
                    );
                    return Ok(Some(BlockInfo {
                        piece_index: index,
                        offset: block_index as u32 * BLOCK_LEN,
                        len: block_len(piece_len, block_index),
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Registers that every piece in the given bitfield gained a peer. Called
    /// when a peer announces its bitfield.
    pub fn increment_availability(&self, have: &Bitfield) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if have.len() != inner.pieces.len() {
            return Err(Error::InvalidBitfield("wrong piece count"));
        }
        for (index, bit) in have.iter() {
            if bit {
                inner.pieces[index].availability += 1;
            }
        }
        inner.sort_working();
        Ok(())
    }

    /// Registers that every piece in the given bitfield lost a peer. Called
    /// when a peer session ends.
    pub fn decrement_availability(&self, have: &Bitfield) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if have.len() != inner.pieces.len() {
            return Err(Error::InvalidBitfield("wrong piece count"));
        }
        for (index, bit) in have.iter() {
            if bit {
                let availability = &mut inner.pieces[index].availability;
                *availability = availability.saturating_sub(1);
            }
        }
        inner.sort_working();
        Ok(())
    }

    /// Registers a single piece gaining a peer. Called on an incoming `have`
    /// message.
    pub fn increment_piece_availability(
        &self,
        index: PieceIndex,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.pieces.len() {
            return Err(Error::InvalidPieceIndex(index));
        }
        inner.pieces[index].availability += 1;
        inner.sort_working();
        Ok(())
    }

    /// Records a block delivered by `peer`, clearing the block's reservations.
    ///
    /// A block that was already received (a late endgame duplicate) is a
    /// no-op reporting no completion.
    pub fn mark_block_done(
        &self,
        index: PieceIndex,
        block_index: usize,
        peer: &str,
    ) -> Result<BlockCompletion> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let piece = inner
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        let block = piece
            .blocks
            .get_mut(block_index)
            .ok_or(Error::InvalidBlockIndex(index, block_index))?;

        if block.state == BlockState::Received {
            return Ok(BlockCompletion::default());
        }
        block.state = BlockState::Received;
        let other_requesters = block
            .requesters
            .drain(..)
            .filter(|requester| requester != peer)
            .collect();

        let piece_complete = piece
            .blocks
            .iter()
            .all(|block| block.state == BlockState::Received);
        if piece_complete {
            // normally the piece is already pending by the time its last
            // block arrives, but a concurrent piece reset may have put it
            // back in the working list
            piece.state = PieceState::Pending;
            inner.working.retain(|&i| i != index);
        }

        Ok(BlockCompletion {
            other_requesters,
            piece_complete,
        })
    }

    /// Marks a fully received piece as done after its hash matched the
    /// expected hash. Done is final: the piece is never offered again.
    pub fn mark_piece_done(&self, index: PieceIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let piece = inner
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        debug_assert!(piece
            .blocks
            .iter()
            .all(|block| block.state == BlockState::Received));
        piece.state = PieceState::Done;
        inner.working.retain(|&i| i != index);
        Ok(())
    }

    /// Returns a peer's block reservation. Called when a request times out or
    /// a session ends with requests still in flight.
    pub fn fail_block(
        &self,
        index: PieceIndex,
        block_index: usize,
        peer: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let piece = inner
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        let block = piece
            .blocks
            .get_mut(block_index)
            .ok_or(Error::InvalidBlockIndex(index, block_index))?;

        // a received block keeps its data no matter how many other
        // reservations are given up
        if block.state != BlockState::Requested {
            return Ok(());
        }
        block.requesters.retain(|requester| requester != peer);
        if !block.requesters.is_empty() {
            return Ok(());
        }
        block.state = BlockState::InQueue;

        match piece.state {
            PieceState::Pending => {
                // the piece has a free block again, put it back in rotation
                piece.state = PieceState::InProgress;
                inner.working.push(index);
            }
            PieceState::InProgress => {
                let untouched = piece.blocks.iter().all(|block| {
                    block.state == BlockState::InQueue
                });
                if untouched {
                    piece.state = PieceState::InQueue;
                }
            }
            _ => {}
        }
        inner.sort_working();
        Ok(())
    }

    /// Resets a whole piece after a hash mismatch: every block becomes free
    /// to pick again and the piece rejoins the working list.
    pub fn fail_piece(&self, index: PieceIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let piece = inner
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        if piece.state == PieceState::Done {
            log::warn!("Piece {} failed after completion, ignoring", index);
            return Ok(());
        }
        for block in piece.blocks.iter_mut() {
            block.state = BlockState::InQueue;
            block.requesters.clear();
        }
        piece.state = PieceState::InQueue;
        if !inner.working.contains(&index) {
            inner.working.push(index);
        }
        inner.sort_working();
        Ok(())
    }

    pub fn piece_state(&self, index: PieceIndex) -> Result<PieceState> {
        let inner = self.inner.lock().unwrap();
        inner
            .pieces
            .get(index)
            .map(|piece| piece.state)
            .ok_or(Error::InvalidPieceIndex(index))
    }

    pub fn is_piece_done(&self, index: PieceIndex) -> Result<bool> {
        Ok(self.piece_state(index)? == PieceState::Done)
    }

    /// Whether the block was already delivered by some peer. Used to decide
    /// if an incoming block is an endgame duplicate that can be dropped.
    pub fn is_block_already_received(
        &self,
        index: PieceIndex,
        block_index: usize,
    ) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        let piece = inner
            .pieces
            .get(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        let block = piece
            .blocks
            .get(block_index)
            .ok_or(Error::InvalidBlockIndex(index, block_index))?;
        Ok(block.state == BlockState::Received)
    }
}

impl Inner {
    /// Requests the lowest free block of the given piece for the peer and
    /// performs the resulting piece state transitions.
    fn pick_block_in(&mut self, index: PieceIndex, peer: &str) -> BlockInfo {
        let piece_len =
            piece_len_at(self.download_len, self.piece_len, index);

        let block_index = {
            let piece = &mut self.pieces[index];
            let block_index = piece
                .blocks
                .iter()
                .position(|block| block.state == BlockState::InQueue);
            // pieces without free blocks are pending and never picked from
            debug_assert!(block_index.is_some());
            let block_index = block_index.unwrap();
            piece.blocks[block_index].state = BlockState::Requested;
            piece.blocks[block_index].requesters.push(peer.to_string());
            block_index
        };

        if self.pieces[index].state == PieceState::InQueue {
            self.pieces[index].state = PieceState::InProgress;
            self.started_count += 1;
            // keep the in-progress pieces a prefix of the working list
            let pos = self.working.iter().position(|&i| i == index);
            debug_assert!(pos.is_some());
            self.working.remove(pos.unwrap());
            let pieces = &self.pieces;
            let prefix_end = self
                .working
                .iter()
                .take_while(|&&i| pieces[i].state == PieceState::InProgress)
                .count();
            self.working.insert(prefix_end, index);
        }

        let exhausted = !self.pieces[index]
            .blocks
            .iter()
            .any(|block| block.state == BlockState::InQueue);
        if exhausted {
            // every block requested at least once: the piece leaves the
            // working list until it completes or a block fails
            self.pieces[index].state = PieceState::Pending;
            self.working.retain(|&i| i != index);
        }

        BlockInfo {
            piece_index: index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(piece_len, block_index),
        }
    }

    /// Restores the working list order: in-progress pieces first (their
    /// relative order untouched), then queued pieces by ascending
    /// availability. The sort is stable so availability ties keep their
    /// insertion order.
    fn sort_working(&mut self) {
        let pieces = &self.pieces;
        self.working.sort_by_key(|&index| match pieces[index].state {
            PieceState::InProgress => (0, 0),
            _ => (1, pieces[index].availability),
        });
    }
}

/// Returns the length of the piece at the given index, which for the last
/// piece may be shorter than the nominal piece length.
fn piece_len_at(
    download_len: u64,
    piece_len: u32,
    index: PieceIndex,
) -> u32 {
    let offset = index as u64 * piece_len as u64;
    debug_assert!(download_len > offset);
    (download_len - offset).min(piece_len as u64) as u32
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    // The dimensions used by the selection policy tests: 29 pieces of 3.5
    // blocks (rounding up to 4 per piece), the last piece 1.5 blocks.
    const PIECE_LEN: u32 = 4 * BLOCK_LEN - 8192;
    const DOWNLOAD_LEN: u64 = 4 * BLOCK_LEN as u64 * 25 - 8192;
    const BLOCKS_PER_PIECE: usize = 4;

    fn peer_bitfield(piece_count: usize, range: std::ops::RangeInclusive<usize>) -> Bitfield {
        let mut bitfield = Bitfield::new(piece_count);
        for index in range {
            bitfield.set(index).unwrap();
        }
        bitfield
    }

    #[test]
    fn test_piece_len_at() {
        assert_eq!(piece_len_at(DOWNLOAD_LEN, PIECE_LEN, 0), PIECE_LEN);
        assert_eq!(piece_len_at(DOWNLOAD_LEN, PIECE_LEN, 27), PIECE_LEN);
        // 28 full pieces leave 1.5 blocks for the last
        assert_eq!(
            piece_len_at(DOWNLOAD_LEN, PIECE_LEN, 28),
            BLOCK_LEN + BLOCK_LEN / 2
        );
    }

    // Strict priority: a started piece is drained before any new piece is
    // begun, so block indices cycle 0,1,2,3 no matter which pieces the
    // warm-up randomness chooses.
    #[test]
    fn test_strict_priority_cycles_blocks() {
        let picker = PiecePicker::with_seed(DOWNLOAD_LEN, PIECE_LEN, 0);
        let have = peer_bitfield(picker.piece_count(), 10..=24);

        let mut current_piece = None;
        for call in 0..10 * BLOCKS_PER_PIECE {
            let block = picker.pick(&have, "peer1").unwrap().unwrap();
            assert_eq!(block.index_in_piece(), call % BLOCKS_PER_PIECE);
            assert!((10..=24).contains(&block.piece_index));
            if call % BLOCKS_PER_PIECE == 0 {
                // a new piece is only started once the previous is drained
                assert_ne!(current_piece, Some(block.piece_index));
                current_piece = Some(block.piece_index);
            } else {
                assert_eq!(current_piece, Some(block.piece_index));
            }
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let first = PiecePicker::with_seed(DOWNLOAD_LEN, PIECE_LEN, 7);
        let second = PiecePicker::with_seed(DOWNLOAD_LEN, PIECE_LEN, 7);
        let have = peer_bitfield(first.piece_count(), 10..=24);

        for _ in 0..10 * BLOCKS_PER_PIECE {
            assert_eq!(
                first.pick(&have, "peer1").unwrap(),
                second.pick(&have, "peer1").unwrap()
            );
        }
    }

    // The first five pieces are chosen randomly from what the peer has; they
    // must be distinct and within the peer's bitfield.
    #[test]
    fn test_warmup_picks_distinct_pieces() {
        let picker = PiecePicker::with_seed(DOWNLOAD_LEN, PIECE_LEN, 0);
        let have = peer_bitfield(picker.piece_count(), 10..=24);

        let mut started = Vec::new();
        for _ in 0..conf::WARMUP_PIECE_COUNT * BLOCKS_PER_PIECE {
            let block = picker.pick(&have, "peer1").unwrap().unwrap();
            if !started.contains(&block.piece_index) {
                started.push(block.piece_index);
            }
        }
        assert_eq!(started.len(), conf::WARMUP_PIECE_COUNT);
        for index in started {
            assert!((10..=24).contains(&index));
            assert_eq!(
                picker.piece_state(index).unwrap(),
                PieceState::Pending
            );
        }
    }

    // After the warm-up, queued pieces are picked in ascending availability
    // order; a piece more peers have comes last even if another peer just
    // announced it.
    #[test]
    fn test_rarest_first_after_warmup() {
        let piece_len = 2 * BLOCK_LEN;
        let download_len = 30 * piece_len as u64;
        let picker = PiecePicker::with_seed(download_len, piece_len, 0);

        // exhaust the warm-up on pieces 0..=4 through the first peer
        let first_have = peer_bitfield(30, 0..=4);
        for _ in 0..conf::WARMUP_PIECE_COUNT * 2 {
            picker.pick(&first_have, "peer1").unwrap().unwrap();
        }

        // a second peer with pieces 10..=24, of which 15 is also available
        // somewhere else
        let second_have = peer_bitfield(30, 10..=24);
        picker.increment_availability(&second_have).unwrap();
        picker.increment_piece_availability(15).unwrap();

        let mut order = Vec::new();
        for _ in 0..15 * 2 {
            let block = picker.pick(&second_have, "peer2").unwrap().unwrap();
            if !order.contains(&block.piece_index) {
                order.push(block.piece_index);
            }
        }
        let expected: Vec<PieceIndex> =
            (10..=24).filter(|&i| i != 15).chain(Some(15)).collect();
        assert_eq!(order, expected);
    }

    // Once the working list drains, pending blocks may be requested from
    // multiple peers, but never twice from the same peer.
    #[test]
    fn test_endgame_duplicates_pending_blocks() {
        let picker = PiecePicker::with_seed(BLOCK_LEN as u64, BLOCK_LEN, 0);
        let mut have = Bitfield::new(1);
        have.set(0).unwrap();

        let block = picker.pick(&have, "peer1").unwrap().unwrap();
        assert_eq!(block.piece_index, 0);
        assert_eq!(
            picker.piece_state(0).unwrap(),
            PieceState::Pending
        );

        // same peer can't duplicate its own request
        assert_eq!(picker.pick(&have, "peer1").unwrap(), None);
        // another peer can
        let duplicate = picker.pick(&have, "peer2").unwrap().unwrap();
        assert_eq!(duplicate, block);

        // the faster peer completes the block, leaving the other requester
        // to be cancelled
        let completion = picker.mark_block_done(0, 0, "peer2").unwrap();
        assert_eq!(completion.other_requesters, vec!["peer1".to_string()]);
        assert!(completion.piece_complete);
        assert!(picker.is_block_already_received(0, 0).unwrap());

        // received blocks are not offered to anyone
        assert_eq!(picker.pick(&have, "peer3").unwrap(), None);

        // the late duplicate delivery reports nothing to do
        let late = picker.mark_block_done(0, 0, "peer1").unwrap();
        assert!(late.other_requesters.is_empty());
        assert!(!late.piece_complete);
    }

    // Failing a just picked block puts the picker back where it was: the
    // same block is offered on the next pick.
    #[test]
    fn test_fail_block_returns_reservation() {
        let piece_len = 2 * BLOCK_LEN;
        let download_len = 30 * piece_len as u64;
        let picker = PiecePicker::with_seed(download_len, piece_len, 0);

        let first_have = peer_bitfield(30, 0..=4);
        for _ in 0..conf::WARMUP_PIECE_COUNT * 2 {
            picker.pick(&first_have, "peer1").unwrap().unwrap();
        }

        let second_have = peer_bitfield(30, 10..=24);
        let block = picker.pick(&second_have, "peer2").unwrap().unwrap();
        assert_eq!(
            picker.piece_state(block.piece_index).unwrap(),
            PieceState::InProgress
        );

        picker
            .fail_block(block.piece_index, block.index_in_piece(), "peer2")
            .unwrap();
        assert_eq!(
            picker.piece_state(block.piece_index).unwrap(),
            PieceState::InQueue
        );
        assert_eq!(picker.pick(&second_have, "peer2").unwrap(), Some(block));
    }

    // Failing a block of a pending piece promotes the piece back into the
    // working list, where strict priority offers the freed block first.
    #[test]
    fn test_fail_block_repromotes_pending_piece() {
        let piece_len = 2 * BLOCK_LEN;
        let picker = PiecePicker::with_seed(piece_len as u64, piece_len, 0);
        let mut have = Bitfield::new(1);
        have.set(0).unwrap();

        let first = picker.pick(&have, "peer1").unwrap().unwrap();
        let second = picker.pick(&have, "peer1").unwrap().unwrap();
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::Pending);

        picker.mark_block_done(0, first.index_in_piece(), "peer1").unwrap();
        picker
            .fail_block(0, second.index_in_piece(), "peer1")
            .unwrap();
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::InProgress);

        // the freed block goes to the next peer that asks
        assert_eq!(picker.pick(&have, "peer2").unwrap(), Some(second));
    }

    // After a hash mismatch the whole piece is requestable again.
    #[test]
    fn test_fail_piece_resets_all_blocks() {
        let piece_len = 2 * BLOCK_LEN;
        let picker = PiecePicker::with_seed(piece_len as u64, piece_len, 0);
        let mut have = Bitfield::new(1);
        have.set(0).unwrap();

        let mut blocks = Vec::new();
        for _ in 0..2 {
            blocks.push(picker.pick(&have, "peer1").unwrap().unwrap());
        }
        for block in &blocks {
            let completion = picker
                .mark_block_done(0, block.index_in_piece(), "peer1")
                .unwrap();
            assert_eq!(
                completion.piece_complete,
                block.index_in_piece() == 1
            );
        }

        picker.fail_piece(0).unwrap();
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::InQueue);
        assert!(!picker.is_block_already_received(0, 0).unwrap());
        assert!(!picker.is_block_already_received(0, 1).unwrap());

        // the reset piece is picked from scratch
        let repicked = picker.pick(&have, "peer2").unwrap().unwrap();
        assert_eq!(repicked, blocks[0]);
    }

    // A verified piece is final.
    #[test]
    fn test_done_piece_is_never_offered() {
        let picker = PiecePicker::with_seed(BLOCK_LEN as u64, BLOCK_LEN, 0);
        let mut have = Bitfield::new(1);
        have.set(0).unwrap();

        picker.pick(&have, "peer1").unwrap().unwrap();
        picker.mark_block_done(0, 0, "peer1").unwrap();
        picker.mark_piece_done(0).unwrap();
        assert!(picker.is_piece_done(0).unwrap());

        picker.fail_piece(0).unwrap();
        assert_eq!(picker.piece_state(0).unwrap(), PieceState::Done);
        assert_eq!(picker.pick(&have, "peer2").unwrap(), None);
    }

    #[test]
    fn test_incompatible_bitfield_size() {
        let picker = PiecePicker::with_seed(DOWNLOAD_LEN, PIECE_LEN, 0);
        let have = Bitfield::new(3);
        assert!(matches!(
            picker.pick(&have, "peer1"),
            Err(Error::InvalidBitfield(_))
        ));
        assert!(picker.increment_availability(&have).is_err());
        assert!(picker.decrement_availability(&have).is_err());
        assert!(picker
            .increment_piece_availability(picker.piece_count())
            .is_err());
    }
}
