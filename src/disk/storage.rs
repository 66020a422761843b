//! Byte-range mapping and verified-write dispatch for a single torrent's
//! on-disk storage.
//!
//! Piece verification is split out to
//! [`crate::piece_manager::PieceManager`] (the normal path hashes and
//! verifies in the calling task before ever reaching here), while this
//! module additionally offers a combined hash+write shortcut
//! ([`Self::write_piece_verified`]) for the "verified write" optimization —
//! eligible only when a piece spans a single file and that file's
//! [`super::file::FileCapabilities::verified_write`] is set, which this
//! backend always reports.
//!
//! Also carries a read cache: a bounded LRU of whole decoded pieces,
//! avoiding a re-read from disk when the same piece is requested by
//! multiple peers in quick succession.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha1::{Digest, Sha1};

use crate::storage_info::{FsStructure, StorageInfo};
use crate::{FileIndex, PieceIndex, Sha1Hash};

use super::error::{NewTorrentError, WriteError};
use super::file::TorrentFile;
use super::piece;

/// A torrent's on-disk storage: open file handles, the expected piece
/// hashes, and a bounded read cache.
///
/// Also holds the per-file "skipped" flags and the lazily-opened `.parts`
/// holding files: while a file is deprioritized (skipped), pieces that fit
/// entirely within it are written to `<file>.parts` instead of the real
/// file, so a long-running download doesn't punch holes of verified data
/// into a file the user doesn't currently want. [`Self::materialize_piece`]
/// copies a piece back out of the holding file once the real file is
/// un-skipped.
pub(crate) struct TorrentStorage {
    info: StorageInfo,
    files: Arc<Vec<Mutex<TorrentFile>>>,
    piece_hashes: Vec<u8>,
    read_cache: Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
    skip: Vec<AtomicBool>,
    parts: Vec<Mutex<Option<File>>>,
}

impl TorrentStorage {
    /// Creates the torrent's directory structure (if any) and opens all of
    /// its file handles up front.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_capacity: usize,
    ) -> Result<Self, NewTorrentError> {
        if info.download_dir.exists() {
            log::warn!("Download dir {:?} exists", info.download_dir);
        }

        let open_file = |path: std::path::PathBuf,
                          file_info: crate::storage_info::FileInfo| {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    NewTorrentError::Io(e)
                })?;
            Ok::<_, NewTorrentError>(Mutex::new(TorrentFile::new(
                crate::storage_info::FileInfo { path, ..file_info },
                handle,
            )))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                vec![open_file(
                    info.download_dir.join(&file.path),
                    file.clone(),
                )?]
            }
            FsStructure::Archive { files } => {
                let mut opened = Vec::with_capacity(files.len());
                for file in files {
                    opened.push(open_file(
                        info.download_dir.join(&file.path),
                        file.clone(),
                    )?);
                }
                opened
            }
        };

        let read_cache_capacity = read_cache_capacity.max(1);
        let file_count = files.len();
        Ok(Self {
            info,
            files: Arc::new(files),
            piece_hashes,
            read_cache: Mutex::new(LruCache::new(read_cache_capacity)),
            skip: (0..file_count).map(|_| AtomicBool::new(false)).collect(),
            parts: (0..file_count).map(|_| Mutex::new(None)).collect(),
        })
    }

    /// Marks `file_index` as skipped (priority 0) or wanted. Does not by
    /// itself move any bytes -- the caller (`Torrent::set_file_priority`)
    /// is responsible for calling [`Self::materialize_piece`] for each
    /// already-verified piece that lies entirely within the file once it
    /// flips from skipped back to wanted.
    pub fn set_skip(&self, file_index: FileIndex, skip: bool) {
        if let Some(flag) = self.skip.get(file_index) {
            flag.store(skip, Ordering::SeqCst);
        }
    }

    fn is_skipped(&self, file_index: FileIndex) -> bool {
        self.skip
            .get(file_index)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether writing `index` will be routed into a `.parts` holding file
    /// (single-file span, and that file currently skipped). The disk actor
    /// uses this to decide whether the write must serialize on
    /// `DiskQueue`'s `.parts` lock (see `disk::mod::run`'s `WritePiece`
    /// handler) rather than running concurrently with ordinary writes.
    pub fn is_parts_write(&self, index: PieceIndex) -> bool {
        match self.file_range(index) {
            Ok(file_range) => {
                file_range.end - file_range.start == 1 && self.is_skipped(file_range.start)
            }
            Err(_) => false,
        }
    }

    /// The path of the holding file a skipped file's verified-but-unwanted
    /// pieces are buffered in: the real file's path with `.parts` appended.
    fn parts_path(&self, file_index: FileIndex) -> std::path::PathBuf {
        let file = self.files[file_index].lock().unwrap();
        let mut name = file.info.path.clone().into_os_string();
        name.push(".parts");
        std::path::PathBuf::from(name)
    }

    fn open_parts_file(&self, file_index: FileIndex) -> Result<(), WriteError> {
        let mut guard = self.parts[file_index].lock().unwrap();
        if guard.is_none() {
            let path = self.parts_path(file_index);
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            *guard = Some(handle);
        }
        Ok(())
    }

    /// Writes `buffer` into `file_index`'s `.parts` holding file at the same
    /// file-relative offset it would occupy in the real file.
    fn write_piece_to_parts(
        &self,
        file_index: FileIndex,
        torrent_offset: u64,
        buffer: &[u8],
    ) -> Result<usize, WriteError> {
        self.open_parts_file(file_index)?;
        let slice = {
            let file = self.files[file_index].lock().unwrap();
            file.info.get_slice(torrent_offset, buffer.len() as u64)
        };
        let guard = self.parts[file_index].lock().unwrap();
        let handle = guard.as_ref().expect("parts file just opened");
        handle.write_all_at(buffer, slice.offset)?;
        Ok(buffer.len())
    }

    /// Copies a previously-buffered piece out of its `.parts` holding file
    /// and into the real file, now that the file it belongs to is no
    /// longer skipped. A no-op if the piece spans more than one file (it
    /// was never routed to a holding file to begin with) or if nothing was
    /// ever buffered for it (the piece was verified before the file was
    /// ever skipped).
    pub fn materialize_piece(&self, index: PieceIndex) -> Result<(), WriteError> {
        let file_range = self.file_range(index)?;
        if file_range.end - file_range.start != 1 {
            return Ok(());
        }
        let file_index = file_range.start;
        let torrent_offset = self.info.torrent_piece_offset(index);
        let len = self
            .info
            .piece_len(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let slice = {
            let file = self.files[file_index].lock().unwrap();
            file.info.get_slice(torrent_offset, len as u64)
        };
        let mut buf = vec![0u8; slice.len as usize];
        {
            let guard = self.parts[file_index].lock().unwrap();
            let handle = match guard.as_ref() {
                Some(handle) => handle,
                None => return Ok(()),
            };
            handle.read_exact_at(&mut buf, slice.offset)?;
        }
        let file = self.files[file_index].lock().unwrap();
        file.handle.write_all_at(&buf, slice.offset)?;
        Ok(())
    }

    /// Removes `file_index`'s `.parts` holding file once every piece that
    /// was buffered in it has been materialized. Best-effort: a missing or
    /// never-created holding file is not an error.
    pub fn drop_parts_file(&self, file_index: FileIndex) {
        let mut guard = self.parts[file_index].lock().unwrap();
        if guard.take().is_some() {
            let _ = fs::remove_file(self.parts_path(file_index));
        }
    }

    fn expected_hash(&self, index: PieceIndex) -> Result<Sha1Hash, WriteError> {
        let pos = index * 20;
        let slice = self
            .piece_hashes
            .get(pos..pos + 20)
            .ok_or(WriteError::InvalidPieceIndex)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }

    fn file_range(&self, index: PieceIndex) -> Result<std::ops::Range<FileIndex>, WriteError> {
        self.info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex)
    }

    /// Writes a piece buffer that has already been verified by the caller
    /// (the normal path: `PieceManager` is the sole verification authority).
    /// Populates the read cache with the freshly written piece.
    pub fn write_piece(
        &self,
        index: PieceIndex,
        buffer: Arc<Vec<u8>>,
    ) -> Result<usize, WriteError> {
        let file_range = self.file_range(index)?;
        let torrent_offset = self.info.torrent_piece_offset(index);

        let write_count = if file_range.end - file_range.start == 1
            && self.is_skipped(file_range.start)
        {
            self.write_piece_to_parts(file_range.start, torrent_offset, &buffer)?
        } else {
            piece::write_piece(torrent_offset, &buffer, &self.files, file_range)?
        };
        self.read_cache.lock().unwrap().put(index, buffer);
        Ok(write_count)
    }

    /// Hashes `buffer` and writes it in one call, used only when the piece
    /// is eligible for the verified-write optimization (single-file span
    /// and the file reports `verified_write` support). Returns `Ok(None)`
    /// if the hash doesn't match, in which case nothing is written.
    pub fn write_piece_verified(
        &self,
        index: PieceIndex,
        buffer: Arc<Vec<u8>>,
    ) -> Result<Option<usize>, WriteError> {
        let expected = self.expected_hash(index)?;
        let mut hasher = Sha1::new();
        hasher.input(&*buffer);
        let digest = hasher.result();
        if digest.as_slice() != expected {
            log::warn!("Piece {} failed verified-write hash check", index);
            return Ok(None);
        }
        let write_count = self.write_piece(index, buffer)?;
        Ok(Some(write_count))
    }

    /// Returns whether `index` is eligible for the verified-write
    /// optimization: it must span exactly one file, and that file must
    /// report `verified_write` support.
    pub fn supports_verified_write(&self, index: PieceIndex) -> Result<bool, WriteError> {
        let file_range = self.file_range(index)?;
        if file_range.end - file_range.start != 1 {
            return Ok(false);
        }
        let file = self.files[file_range.start].lock().unwrap();
        Ok(file.capabilities().verified_write)
    }

    /// Re-reads a whole piece directly from disk, bypassing the read cache
    /// entirely. Used only by [`crate::torrent::Torrent::recheck_data`],
    /// which needs the actual on-disk bytes rather than whatever (possibly
    /// stale, possibly absent) entry happens to sit in the cache.
    pub fn read_piece_from_disk(&self, index: PieceIndex) -> Result<Vec<u8>, WriteError> {
        let file_range = self.file_range(index)?;
        let torrent_offset = self.info.torrent_piece_offset(index);
        let len = self
            .info
            .piece_len(index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        piece::read_piece(torrent_offset, len, &self.files, file_range)
    }

    /// Reads the block at `(piece, offset, len)`, serving it out of the
    /// read cache when possible and falling back to re-verifying and
    /// caching the owning piece is not supported here (the cache is
    /// populated only by writes) — an uncached read is reported as a
    /// miss and left to the caller (the disk actor re-requests it from
    /// `PieceManager`'s own verified buffer, since this backend does not
    /// re-read unwritten pieces from disk).
    pub fn read_cached_block(
        &self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<Vec<u8>> {
        let mut cache = self.read_cache.lock().unwrap();
        let piece = cache.get(&index)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > piece.len() {
            return None;
        }
        Some(piece[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileInfo;
    use tempfile::tempdir;

    fn make_storage(dir: &std::path::Path, piece_len: u32, data: &[u8]) -> TorrentStorage {
        let file = FileInfo {
            path: std::path::PathBuf::from("file.bin"),
            len: data.len() as u64,
            torrent_offset: 0,
        };
        let piece_count = ((data.len() as u32 + piece_len - 1) / piece_len) as usize;
        let last_piece_len = data.len() as u32 - piece_len * (piece_count as u32 - 1);
        let info = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: data.len() as u64,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(file),
        };

        let mut piece_hashes = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let mut hasher = Sha1::new();
            hasher.input(chunk);
            piece_hashes.extend_from_slice(hasher.result().as_slice());
        }

        TorrentStorage::new(info, piece_hashes, 4).unwrap()
    }

    #[test]
    fn write_then_read_cached_round_trips() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; 32];
        let storage = make_storage(dir.path(), 16, &data);

        storage.write_piece(0, Arc::new(data[0..16].to_vec())).unwrap();
        let read = storage.read_cached_block(0, 0, 16).unwrap();
        assert_eq!(read, data[0..16]);
    }

    #[test]
    fn verified_write_rejects_mismatching_hash() {
        let dir = tempdir().unwrap();
        let data = vec![1u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        let bogus = Arc::new(vec![9u8; 16]);
        let result = storage.write_piece_verified(0, bogus).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn verified_write_accepts_matching_hash() {
        let dir = tempdir().unwrap();
        let data = vec![3u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        let result = storage
            .write_piece_verified(0, Arc::new(data.clone()))
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn single_file_torrent_always_supports_verified_write() {
        let dir = tempdir().unwrap();
        let data = vec![0u8; 16];
        let storage = make_storage(dir.path(), 16, &data);
        assert!(storage.supports_verified_write(0).unwrap());
    }

    #[test]
    fn skipped_file_writes_land_in_parts_file_not_the_real_file() {
        let dir = tempdir().unwrap();
        let data = vec![5u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        storage.set_skip(0, true);
        storage.write_piece(0, Arc::new(data.clone())).unwrap();

        let real = fs::read(dir.path().join("file.bin")).unwrap();
        assert!(real.is_empty(), "real file must stay untouched while skipped");

        let parts = fs::read(dir.path().join("file.bin.parts")).unwrap();
        assert_eq!(parts, data);
    }

    #[test]
    fn materialize_piece_copies_parts_buffer_into_real_file() {
        let dir = tempdir().unwrap();
        let data = vec![9u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        storage.set_skip(0, true);
        storage.write_piece(0, Arc::new(data.clone())).unwrap();

        storage.set_skip(0, false);
        storage.materialize_piece(0).unwrap();

        let real = fs::read(dir.path().join("file.bin")).unwrap();
        assert_eq!(real, data);
    }

    #[test]
    fn drop_parts_file_removes_holding_file_from_disk() {
        let dir = tempdir().unwrap();
        let data = vec![2u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        storage.set_skip(0, true);
        storage.write_piece(0, Arc::new(data)).unwrap();
        assert!(dir.path().join("file.bin.parts").exists());

        storage.drop_parts_file(0);
        assert!(!dir.path().join("file.bin.parts").exists());
    }

    #[test]
    fn materialize_piece_is_a_noop_when_nothing_was_ever_buffered() {
        let dir = tempdir().unwrap();
        let data = vec![4u8; 16];
        let storage = make_storage(dir.path(), 16, &data);

        // never skipped, so there's no `.parts` file to pull from
        assert!(storage.materialize_piece(0).is_ok());
    }
}
