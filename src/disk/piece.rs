//! Splitting a complete, assembled piece buffer into the vectored writes
//! needed to land it in the one or more files it overlaps.
//!
//! Takes a flat byte buffer -- the piece is already fully assembled by
//! [`crate::download::ActivePiece`] before it ever reaches the disk task --
//! rather than a `BTreeMap<u32, Vec<u8>>` of separately-received blocks.

use std::ops::Range;
use std::sync::Mutex;

use crate::iovecs::{IoVec, IoVecs};
use crate::FileIndex;

use super::error::WriteError;
use super::file::TorrentFile;

/// Writes `buffer` (a complete piece, `piece_len` bytes) to the files it
/// overlaps, starting at `piece_torrent_offset`.
///
/// `files` is the torrent's full file table; `file_range` is the
/// (pre-computed) slice of it this piece intersects.
pub(crate) fn write_piece(
    piece_torrent_offset: u64,
    buffer: &[u8],
    files: &[Mutex<TorrentFile>],
    file_range: Range<FileIndex>,
) -> Result<usize, WriteError> {
    let mut total_write_count = 0;
    let mut bufs: Vec<IoVec<'_>> = vec![IoVec::from_slice(buffer)];

    let files = &files[file_range];
    debug_assert!(!files.is_empty());

    if files.len() == 1 {
        let file = files.first().unwrap().lock().unwrap();
        let slice = file.info.get_slice(piece_torrent_offset, buffer.len() as u64);
        let mut iovecs = IoVecs::unbounded(&bufs);
        total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
        bufs = iovecs.into_tail();
    } else {
        let mut write_torrent_offset = piece_torrent_offset;
        for file in files.iter() {
            let file = file.lock().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, buffer.len() as u64);
            debug_assert!(slice.len > 0);
            debug_assert!(!bufs.is_empty());

            let mut iovecs = IoVecs::bounded(&bufs, slice.len as usize);
            let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;

            bufs = iovecs.into_tail();

            write_torrent_offset += write_count as u64;
            total_write_count += write_count;
        }
    }

    debug_assert!(bufs.is_empty());
    Ok(total_write_count)
}

/// Reads `len` bytes starting at `piece_torrent_offset` back out of the
/// files they span, for [`crate::torrent::Torrent::recheck_data`]. Mirrors
/// [`write_piece`]'s file-walking shape but in the read direction.
pub(crate) fn read_piece(
    piece_torrent_offset: u64,
    len: u32,
    files: &[Mutex<TorrentFile>],
    file_range: Range<FileIndex>,
) -> Result<Vec<u8>, WriteError> {
    let mut buf = vec![0u8; len as usize];
    let mut written = 0usize;
    let mut read_torrent_offset = piece_torrent_offset;

    for file in &files[file_range] {
        let file = file.lock().unwrap();
        let slice = file.info.get_slice(read_torrent_offset, (len as usize - written) as u64);
        let chunk = &mut buf[written..written + slice.len as usize];
        file.read_exact_at(chunk, slice.offset)?;
        written += slice.len as usize;
        read_torrent_offset += slice.len;
    }

    debug_assert_eq!(written, len as usize);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    // `write_piece`/`read_piece` require real, opened file handles (they
    // issue genuine `pwritev`/`pread` syscalls), so they are exercised
    // indirectly via `disk::storage`'s own tests, which set up temporary
    // files.
}
