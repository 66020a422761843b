//! A single torrent file's handle and capability query.
//!
//! Capabilities are queried explicitly (`FileCapabilities`) rather than by
//! probing for a method at runtime.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use nix::sys::uio::pwritev;

use crate::iovecs::IoVecs;
use crate::storage_info::FileInfo;

use super::error::WriteError;

/// What a file handle supports, queried explicitly rather than by probing
/// for a method's presence at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileCapabilities {
    /// Whether this handle's backend can perform a write + hash-check as a
    /// single operation (see [`super::storage::TorrentStorage::write_piece_verified`]).
    pub verified_write: bool,
}

pub(crate) struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    pub fn new(info: FileInfo, handle: File) -> Self {
        Self { info, handle }
    }

    /// This backend always supports the combined write+hash-check
    /// operation: `TorrentStorage` performs the hash check itself before
    /// issuing the write, so no OS-level atomic primitive is required.
    pub fn capabilities(&self) -> FileCapabilities {
        FileCapabilities { verified_write: true }
    }

    /// Writes `iovecs` at `offset`, looping until every buffer has been
    /// confirmed written (a single `pwritev` call is not guaranteed to
    /// consume the whole input).
    pub fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64)
                .map_err(|e| {
                    log::warn!("file {:?} write error: {}", self.info.path, e);
                    WriteError::from(e)
                })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    /// Reads exactly `buf.len()` bytes at `offset`, used only by
    /// [`crate::torrent::Torrent::recheck_data`]'s full re-read, which
    /// bypasses the disk queue's normal write serialization under an
    /// implicit read-only contract.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), WriteError> {
        self.handle.read_exact_at(buf, offset).map_err(|e| {
            log::warn!("file {:?} read error: {}", self.info.path, e);
            WriteError::from(e)
        })
    }
}
