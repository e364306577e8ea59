//! In-memory piece buffers, piece hash verification, and positional writes
//! to the single output file.

use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::Mutex,
};

use nix::sys::uio::pwrite;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Copy, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the downloaded file.
    pub download_len: u64,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.info.piece_length;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }
}

/// The entity responsible for assembling downloaded blocks into whole pieces,
/// verifying them, and saving them to disk.
///
/// Each piece gets its own write buffer, allocated lazily when the first
/// block of the piece arrives. At any one time only the session that fetched
/// the completing block verifies and persists a given piece, so buffers need
/// no finer synchronisation than the single buffer table lock.
pub struct Storage {
    info: StorageInfo,
    path: PathBuf,
    file: File,
    pieces: Mutex<Vec<Option<Vec<u8>>>>,
}

impl Storage {
    /// Creates the output file at the given path, sized to the full download
    /// length up front so that piece writes at arbitrary offsets are in
    /// bounds.
    pub fn new(info: StorageInfo, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        log::info!("Creating {} byte output file {:?}", info.download_len, path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(info.download_len)?;
        Ok(Self {
            pieces: Mutex::new(vec![None; info.piece_count]),
            info,
            path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies a block's bytes into its piece's write buffer at the given
    /// offset, allocating the buffer if this is the piece's first block.
    pub fn save_at(
        &self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let piece_len = self.info.piece_len(index)?;
        let end = offset as usize + data.len();
        if end > piece_len as usize {
            return Err(Error::InvalidBlockIndex(
                index,
                (offset / BLOCK_LEN) as usize,
            ));
        }

        let mut pieces = self.pieces.lock().unwrap();
        let buf = pieces[index]
            .get_or_insert_with(|| vec![0; piece_len as usize]);
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// Calculates the piece's hash over its write buffer and returns whether
    /// it matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    pub fn verify(
        &self,
        index: PieceIndex,
        expected_hash: &Sha1Hash,
    ) -> Result<bool> {
        let pieces = self.pieces.lock().unwrap();
        let buf = pieces
            .get(index)
            .ok_or(Error::InvalidPieceIndex(index))?
            .as_ref()
            .ok_or(Error::PieceNotAvailable(index))?;
        let hash = Sha1::digest(buf);
        log::debug!("Piece {} hash: {:x}", index, hash);
        Ok(hash.as_slice() == expected_hash)
    }

    /// Writes the piece's buffer to the output file at the piece's absolute
    /// offset.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    pub fn write_to_disk(&self, index: PieceIndex) -> Result<()> {
        let pieces = self.pieces.lock().unwrap();
        let buf = pieces
            .get(index)
            .ok_or(Error::InvalidPieceIndex(index))?
            .as_ref()
            .ok_or(Error::PieceNotAvailable(index))?;

        let piece_offset = index as u64 * self.info.piece_len as u64;
        // IO syscalls are not guaranteed to write the whole input buffer in
        // one go, so we need to write until all bytes have been confirmed to
        // be written to disk (or an error occurs)
        let mut written = 0;
        while written < buf.len() {
            let count = pwrite(
                self.file.as_raw_fd(),
                &buf[written..],
                (piece_offset + written as u64) as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.path, e);
                Error::Io(std::io::Error::from_raw_os_error(e as i32))
            })?;
            written += count;
        }
        log::trace!(
            "Wrote piece {} ({} bytes) at file offset {}",
            index,
            written,
            piece_offset
        );
        Ok(())
    }

    /// Returns a copy of the piece's write buffer, if any blocks of it have
    /// been saved.
    pub fn piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .get(index)
            .ok_or(Error::InvalidPieceIndex(index))?
            .clone()
            .ok_or(Error::PieceNotAvailable(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two pieces of 32 KiB, the last truncated to 1.5 blocks.
    fn test_info() -> StorageInfo {
        StorageInfo {
            piece_count: 2,
            piece_len: 2 * BLOCK_LEN,
            last_piece_len: BLOCK_LEN + BLOCK_LEN / 2,
            download_len: 2 * BLOCK_LEN as u64 + BLOCK_LEN as u64 / 2 * 3,
        }
    }

    fn test_storage(info: StorageInfo) -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(info, dir.path().join("out.bin")).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_piece_len() {
        let info = test_info();
        assert_eq!(info.piece_len(0).unwrap(), 2 * BLOCK_LEN);
        assert_eq!(info.piece_len(1).unwrap(), BLOCK_LEN + BLOCK_LEN / 2);
        assert!(matches!(
            info.piece_len(2),
            Err(Error::InvalidPieceIndex(2))
        ));
    }

    #[test]
    fn test_save_and_verify() {
        let (storage, _dir) = test_storage(test_info());
        let piece: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| (i % 251) as u8).collect();
        let expected: Sha1Hash = Sha1::digest(&piece).into();

        storage.save_at(0, 0, &piece[..BLOCK_LEN as usize]).unwrap();
        storage.save_at(0, BLOCK_LEN, &piece[BLOCK_LEN as usize..]).unwrap();

        assert!(storage.verify(0, &expected).unwrap());
        assert!(!storage.verify(0, &[0; 20]).unwrap());
        assert_eq!(storage.piece(0).unwrap(), piece);
    }

    #[test]
    fn test_verify_without_data() {
        let (storage, _dir) = test_storage(test_info());
        assert!(matches!(
            storage.verify(1, &[0; 20]),
            Err(Error::PieceNotAvailable(1))
        ));
    }

    #[test]
    fn test_save_out_of_bounds() {
        let (storage, _dir) = test_storage(test_info());
        // a full block starting in the last block slot of the short piece
        // overhangs the piece end
        assert!(storage
            .save_at(1, BLOCK_LEN, &[0; BLOCK_LEN as usize])
            .is_err());
        assert!(storage.save_at(2, 0, &[0; 1]).is_err());
    }

    #[test]
    fn test_write_to_disk() {
        let info = test_info();
        let (storage, _dir) = test_storage(info);

        let first: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| (i % 251) as u8).collect();
        let last: Vec<u8> = (0..info.last_piece_len).map(|i| (i % 241) as u8).collect();

        // write the pieces out of order to exercise positional writes
        storage.save_at(1, 0, &last).unwrap();
        storage.write_to_disk(1).unwrap();
        storage.save_at(0, 0, &first).unwrap();
        storage.write_to_disk(0).unwrap();

        let contents = std::fs::read(storage.path()).unwrap();
        assert_eq!(contents.len() as u64, info.download_len);
        assert_eq!(&contents[..first.len()], &first[..]);
        assert_eq!(&contents[first.len()..], &last[..]);
    }
}
