//! Decoding of the bencoded metainfo file and the info hash derived from it.

use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// The parsed metainfo file.
///
/// Only single file torrents are supported: a metainfo whose info dictionary
/// contains a `files` list is rejected.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

/// The torrent's info dictionary.
///
/// Field order matters: the info hash is computed over the canonical bencode
/// encoding of this dictionary, whose keys are sorted.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    pub private: Option<u8>,
    pub files: Option<Vec<File>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.files.is_some() {
            return Err(Error::InvalidMetainfo(
                "multi file torrents are not supported",
            ));
        }
        if self.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length is zero"));
        }
        let length = self
            .info
            .length
            .ok_or(Error::InvalidMetainfo("length is missing"))?;
        if length == 0 {
            return Err(Error::InvalidMetainfo("length is zero"));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces is not a multiple of 20 bytes",
            ));
        }
        // every piece, including a shorter last one, must have a hash
        let piece_count = (length + self.info.piece_length as u64 - 1)
            / self.info.piece_length as u64;
        if piece_count != (self.info.pieces.len() / 20) as u64 {
            return Err(Error::InvalidMetainfo(
                "piece hash count doesn't match the download length",
            ));
        }
        Ok(())
    }

    /// The total download length, in bytes.
    pub fn download_len(&self) -> u64 {
        // validated at construction
        self.info.length.unwrap_or_default()
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Computes the SHA-1 hash of the canonical bencode encoding of the info
    /// dictionary, which identifies the torrent everywhere: in tracker
    /// announces and in peer handshakes.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Splits the `pieces` concatenation into one 20 byte hash per piece.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A handcrafted single file torrent: two 16 KiB pieces, the second one
    // truncated by the download length.
    fn test_torrent() -> (Vec<u8>, Vec<u8>) {
        let info = format!(
            "d6:lengthi20000e4:name8:test.bin12:piece lengthi16384e6:pieces40:{}{}e",
            "a".repeat(20),
            "b".repeat(20),
        );
        let metainfo = format!("d8:announce18:http://tr/announce4:info{}e", info);
        (metainfo.into_bytes(), info.into_bytes())
    }

    #[test]
    fn test_parse() {
        let (buf, _) = test_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "http://tr/announce");
        assert_eq!(metainfo.info.name, "test.bin");
        assert_eq!(metainfo.info.piece_length, 16384);
        assert_eq!(metainfo.download_len(), 20000);
        assert_eq!(metainfo.piece_count(), 2);
    }

    #[test]
    fn test_info_hash_is_over_canonical_encoding() {
        let (buf, info) = test_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let expected: [u8; 20] = Sha1::digest(&info).into();
        assert_eq!(metainfo.info_hash().unwrap(), expected);
    }

    #[test]
    fn test_piece_hashes() {
        let (buf, _) = test_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let hashes = metainfo.piece_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], [b'a'; 20]);
        assert_eq!(hashes[1], [b'b'; 20]);
    }

    #[test]
    fn test_rejects_invalid_pieces_len() {
        // 19 bytes of piece hashes is not a multiple of 20
        let buf = format!(
            "d8:announce9:http://tr4:infod6:lengthi100e4:name1:a\
12:piece lengthi100e6:pieces19:{}ee",
            "a".repeat(19)
        )
        .into_bytes();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_rejects_multi_file() {
        let buf = format!(
            "d8:announce9:http://tr4:infod5:filesld6:lengthi10e4:pathl\
1:aeee4:name1:a12:piece lengthi16384e6:pieces20:{}ee",
            "a".repeat(20)
        )
        .into_bytes();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_piece_count() {
        // 20000 bytes at 16 KiB pieces needs two hashes, only one given
        let buf = format!(
            "d8:announce9:http://tr4:infod6:lengthi20000e4:name1:a\
12:piece lengthi16384e6:pieces20:{}ee",
            "a".repeat(20)
        )
        .into_bytes();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
