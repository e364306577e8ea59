//! Framing of the two formats sharing the peer transport: the fixed length
//! handshake that opens a connection and the length prefixed messages
//! exchanged afterwards.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of a complete handshake: length prefix byte, protocol string,
/// 8 reserved bytes, info hash, and peer id.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_STRING.len();

/// No message this client accepts is anywhere near this long (the largest
/// legitimate frames are block payloads and the bitfields of very large
/// torrents). Anything longer is treated as hostile.
const MAX_FRAME_LEN: u32 = 0x10_0000;

/// The handshake exchanged right after establishing the TCP connection.
/// After both sides sent one, they must agree on the info hash or the
/// session is aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved for extensions, all zeros for us.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The arbitrary 20 byte id of the sending peer.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the length prefix can be rejected before the rest of the handshake
        // arrives
        let prot_len = buf[0];
        if prot_len as usize != PROTOCOL_STRING.len() {
            return Err(Error::BadPstrLen(prot_len));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot[..] != *PROTOCOL_STRING.as_bytes() {
            return Err(Error::BadPstr);
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        match self.decode(buf)? {
            Some(handshake) => Ok(Some(handshake)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Truncated),
        }
    }
}

/// The id of a message, which is the first byte of a non keep-alive frame's
/// payload.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            9 => Ok(Port),
            _ => Err(Error::BadMessageId(id)),
        }
    }
}

/// The messages of the peer protocol, a closed set of ten kinds plus the
/// empty keep-alive frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    /// The raw bitfield bytes. Validation against the torrent's piece count
    /// happens in the session, which knows the expected length.
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    /// The message's wire id, or `None` for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
        }
    }
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                // checked by the exhaustive match above
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Have(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_prefix = [0; 4];
        len_prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(len_prefix);
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame_len as usize));
        }
        if buf.len() < 4 + frame_len as usize {
            // wait for the rest of the frame without copying the prefix out
            buf.reserve(4 + frame_len as usize - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let id = buf.get_u8();
        let payload_len = frame_len as usize - 1;

        use MessageId::*;
        let msg = match MessageId::try_from(id)? {
            Choke | Unchoke | Interested | NotInterested
                if payload_len != 0 =>
            {
                return Err(Error::BadMessagePayload(id));
            }
            Choke => Message::Choke,
            Unchoke => Message::Unchoke,
            Interested => Message::Interested,
            NotInterested => Message::NotInterested,
            Have => {
                if payload_len != 4 {
                    return Err(Error::BadMessagePayload(id));
                }
                Message::Have(buf.get_u32() as PieceIndex)
            }
            Bitfield => {
                let mut bytes = vec![0; payload_len];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(bytes)
            }
            Request | Cancel => {
                if payload_len != 12 {
                    return Err(Error::BadMessagePayload(id));
                }
                let block = BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                };
                if id == MessageId::Request as u8 {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            Piece => {
                if payload_len < 8 {
                    return Err(Error::BadMessagePayload(id));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
            Port => {
                if payload_len != 2 {
                    return Err(Error::BadMessagePayload(id));
                }
                Message::Port(buf.get_u16())
            }
        };
        Ok(Some(msg))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Truncated),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_encode() {
        let mut info_hash = [0u8; 20];
        for (i, b) in info_hash.iter_mut().enumerate() {
            *b = 20 - i as u8;
        }
        let mut peer_id = [0u8; 20];
        for (i, b) in peer_id.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }

        let buf = encode_handshake(Handshake::new(info_hash, peer_id));
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let mut expected = vec![19];
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0; 8]);
        expected.extend_from_slice(&info_hash);
        expected.extend_from_slice(&peer_id);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0xab; 20], [0xcd; 20]);
        let mut buf = encode_handshake(handshake);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_decode_waits_for_more() {
        let mut buf = encode_handshake(Handshake::new([1; 20], [2; 20]));
        let mut partial = buf.split_to(30);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
        // an eof mid handshake is an error, not silence
        assert!(matches!(
            HandshakeCodec.decode_eof(&mut partial),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn test_handshake_rejects_bad_prot_len() {
        let mut buf = encode_handshake(Handshake::new([1; 20], [2; 20]));
        buf[0] = 18;
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::BadPstrLen(18))
        ));
    }

    #[test]
    fn test_handshake_rejects_bad_prot() {
        let mut buf = encode_handshake(Handshake::new([1; 20], [2; 20]));
        buf[1] = b'b';
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::BadPstr)
        ));
    }

    #[test]
    fn test_keep_alive_encoding() {
        let buf = encode_msg(Message::KeepAlive);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut buf = buf;
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
    }

    #[test]
    fn test_bitfield_encoding() {
        let buf = encode_msg(Message::Bitfield(vec![10, 15, 5]));
        assert_eq!(&buf[..], &[0, 0, 0, 4, 5, 10, 15, 5]);

        let mut buf = buf;
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Bitfield(vec![10, 15, 5]))
        );
    }

    #[test]
    fn test_message_round_trips() {
        let block = BlockInfo {
            piece_index: 42,
            offset: 0x4000,
            len: 0x4000,
        };
        let msgs = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(1234),
            Message::Bitfield(vec![0b1010_0000]),
            Message::Request(block),
            Message::Piece {
                piece_index: 42,
                offset: 0x4000,
                data: vec![1, 2, 3, 4, 5],
            },
            Message::Cancel(block),
            Message::Port(6881),
        ];
        for msg in msgs {
            let mut buf = encode_msg(msg.clone());
            assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(msg));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_request_wire_format() {
        let buf = encode_msg(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, 6, // length prefix and id
                0, 0, 0, 1, // piece index
                0, 0, 0x40, 0, // offset
                0, 0, 0x40, 0, // length
            ]
        );
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let mut full = encode_msg(Message::Have(7));
        let mut buf = full.split_to(3);
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
        buf.unsplit(full);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Have(7))
        );
    }

    #[test]
    fn test_rejects_unknown_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(10);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::BadMessageId(10))
        ));
    }

    #[test]
    fn test_rejects_malformed_payload() {
        // a have message with a short payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(7);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::BadMessagePayload(4))
        ));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        buf.put_u8(MessageId::Bitfield as u8);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
