//! The closed set of errors the client deals with.
//!
//! Peer related errors are handled at the session task boundary: they
//! terminate the offending session and the rest of the swarm carries on.
//! Only the variants produced while setting up the download (metainfo,
//! tracker, output file) surface from the driver as a process failure.

use crate::{BlockInfo, PieceIndex};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error ocurred.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A peer stopped responding within the allowed window.
    #[error("operation timed out")]
    Timeout,

    /// The stream ended in the middle of a frame.
    #[error("stream ended mid frame")]
    Truncated,

    /// The handshake length prefix was not the length of the expected
    /// protocol string.
    #[error("handshake protocol string length {0}")]
    BadPstrLen(u8),

    /// The handshake protocol string was not "BitTorrent protocol".
    #[error("handshake protocol string mismatch")]
    BadPstr,

    /// The info hash in the peer's handshake did not match our own.
    #[error("handshake info hash mismatch")]
    BadInfoHash,

    /// A message with an id outside the protocol's 0..=9 range was received.
    #[error("unknown message id {0}")]
    BadMessageId(u8),

    /// A message payload did not have the length its id mandates.
    #[error("malformed payload for message id {0}")]
    BadMessagePayload(u8),

    /// A frame longer than any valid protocol message was announced.
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// A bitfield message arrived after the availability exchange that
    /// directly follows the handshake.
    #[error("bitfield sent not after handshake")]
    BitfieldNotAfterHandshake,

    /// A peer bitfield's raw bytes don't describe this torrent (wrong byte
    /// count or nonzero spare bits).
    #[error("invalid bitfield: {0}")]
    InvalidBitfield(&'static str),

    /// A peer sent a block we have no record of requesting.
    #[error("block {0:?} was not requested")]
    UnexpectedBlock(BlockInfo),

    /// A peer served too many pieces that failed hash verification.
    #[error("{0} piece hash failures exceeded the limit")]
    TooManyHashFailures(usize),

    /// A piece index outside the torrent was used.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// A block index outside its piece was used.
    #[error("invalid block index {1} in piece {0}")]
    InvalidBlockIndex(PieceIndex, usize),

    /// A piece buffer was queried before any of its blocks were saved.
    #[error("no data for piece {0}")]
    PieceNotAvailable(PieceIndex),

    /// The metainfo file doesn't describe a torrent we can download.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// Bencode encoding or decoding failed.
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// The announce request could not be made.
    #[error("tracker request: {0}")]
    Tracker(#[from] reqwest::Error),

    /// The tracker answered the announce with a failure reason.
    #[error("tracker rejected announce: {0}")]
    TrackerFailure(String),

    /// The tracker's peer list contained no usable address.
    #[error("tracker returned no usable peers")]
    NoPeers,
}
