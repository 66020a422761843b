//! The disk actor: the single task that owns every torrent's on-disk
//! storage and serializes mutating access to it through [`queue::DiskQueue`].
//!
//! [`DiskHandle`] is the cloneable, channel-backed front door `Torrent` and
//! `peer::PeerSession` talk to; the actual task owns the per-torrent
//! [`storage::TorrentStorage`] table and the shared [`queue::DiskQueue`]
//! worker pool.

pub(crate) mod error;
pub(crate) mod file;
pub(crate) mod piece;
pub(crate) mod queue;
pub(crate) mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::storage_info::StorageInfo;
use crate::{PieceIndex, TorrentId};

use error::{NewTorrentError, WriteError};
use queue::DiskQueue;
use storage::TorrentStorage;

/// The result of a piece write dispatched through [`DiskHandle::write_piece`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Ok,
    HashMismatch,
}

enum Command {
    AllocateTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_capacity: usize,
        reply: oneshot::Sender<Result<(), NewTorrentError>>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    /// Writes an already hash-verified piece buffer, or -- when the piece
    /// spans a single verified-write-capable file -- hashes and writes it
    /// in one step.
    WritePiece {
        id: TorrentId,
        index: PieceIndex,
        buffer: Arc<Vec<u8>>,
        /// Whether this write should take the combined hash+write path
        /// (the caller, `Torrent::handle_block`, decides eligibility via
        /// `storage_info`/file-span queries it already has the data for).
        verify: bool,
        reply: oneshot::Sender<Result<WriteOutcome, WriteError>>,
    },
    ReadBlock {
        id: TorrentId,
        index: PieceIndex,
        offset: u32,
        len: u32,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Whether `index` is eligible for the verified-write optimization, so
    /// the caller (`PeerSession::handle_block`) can decide whether to hash
    /// the piece itself before writing, or leave the single combined
    /// hash+write to `WritePiece`'s verified path and avoid hashing twice.
    SupportsVerifiedWrite {
        id: TorrentId,
        index: PieceIndex,
        reply: oneshot::Sender<bool>,
    },
    /// Re-reads a whole piece straight from disk for `Torrent::recheck_data`.
    /// Bypasses `DiskQueue` entirely, since recheck is a read-only scan that
    /// must not contend with, or be throttled by, the write worker pool.
    ReadPiece {
        id: TorrentId,
        index: PieceIndex,
        reply: oneshot::Sender<Result<Vec<u8>, WriteError>>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
    Resume,
    Destroy,
    /// Marks a file as skipped (priority 0) or wanted; future piece writes
    /// that fit entirely within it are routed to its `.parts` holding file
    /// (or back to the real file) accordingly.
    SetFileSkip {
        id: TorrentId,
        file_index: crate::FileIndex,
        skip: bool,
    },
    /// Copies an already-verified piece out of its file's `.parts` holding
    /// file and into the real file, now that the file is no longer skipped.
    MaterializePiece {
        id: TorrentId,
        index: PieceIndex,
        reply: oneshot::Sender<Result<(), WriteError>>,
    },
    /// Removes a file's `.parts` holding file once every piece buffered in
    /// it has been materialized.
    DropPartsFile {
        id: TorrentId,
        file_index: crate::FileIndex,
    },
}

/// A cheaply-cloneable handle to the disk actor task. Every torrent shares
/// the same actor (and the same bounded worker pool); the SHA-1 hasher is
/// stateless per call and may be shared across torrents the same way.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DiskHandle {
    /// Spawns the disk actor task with a worker pool of `worker_count`
    /// concurrent (non-`.parts`) jobs, returning a handle to it.
    pub fn spawn(worker_count: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = DiskQueue::new(worker_count);
        tokio::spawn(run(rx, queue));
        Self { commands: tx }
    }

    /// Allocates on-disk storage for a newly added torrent: opens (or
    /// creates) every file it owns and registers its expected piece
    /// hashes.
    pub async fn allocate_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        read_cache_capacity: usize,
    ) -> Result<(), NewTorrentError> {
        let (reply, recv) = oneshot::channel();
        self.commands
            .send(Command::AllocateTorrent {
                id,
                info,
                piece_hashes,
                read_cache_capacity,
                reply,
            })
            .map_err(|_| NewTorrentError::Io(closed_io_error()))?;
        recv.await.map_err(|_| NewTorrentError::Io(closed_io_error()))?
    }

    /// Drops a torrent's storage from the actor's table (its file handles
    /// are closed when the last `Arc<TorrentStorage>` referencing them is
    /// dropped).
    pub fn remove_torrent(&self, id: TorrentId) {
        let _ = self.commands.send(Command::RemoveTorrent { id });
    }

    /// Writes a complete, already-assembled piece buffer. `verify` requests
    /// the combined hash+write ("verified write") path; the actor falls
    /// back to a plain write if the piece doesn't qualify (spans more than
    /// one file, or the caller already verified the hash itself).
    pub async fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        buffer: Arc<Vec<u8>>,
        verify: bool,
    ) -> Result<WriteOutcome, WriteError> {
        let (reply, recv) = oneshot::channel();
        self.commands
            .send(Command::WritePiece {
                id,
                index,
                buffer,
                verify,
                reply,
            })
            .map_err(|_| WriteError::QueueClosed)?;
        recv.await.map_err(|_| WriteError::QueueClosed)?
    }

    /// Reads a block out of the read cache, bypassing the disk queue.
    /// Returns `None` on a cache miss; the caller has no unwritten-piece
    /// re-read path, matching
    /// [`storage::TorrentStorage::read_cached_block`]'s contract.
    pub async fn read_block(
        &self,
        id: TorrentId,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<Vec<u8>> {
        let (reply, recv) = oneshot::channel();
        self.commands
            .send(Command::ReadBlock {
                id,
                index,
                offset,
                len,
                reply,
            })
            .ok()?;
        recv.await.ok().flatten()
    }

    /// Re-reads a whole piece directly from disk, for recheck. Unlike
    /// [`Self::write_piece`], this never goes through `DiskQueue`: recheck
    /// scans are read-only and must proceed even while the queue is
    /// draining.
    pub async fn read_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
    ) -> Result<Vec<u8>, WriteError> {
        let (reply, recv) = oneshot::channel();
        self.commands
            .send(Command::ReadPiece { id, index, reply })
            .map_err(|_| WriteError::QueueClosed)?;
        recv.await.map_err(|_| WriteError::QueueClosed)?
    }

    /// Reports whether `index` qualifies for the combined hash+write fast
    /// path, so a caller that would otherwise hash the piece itself (e.g.
    /// [`crate::peer::session::PeerSession::handle_block`]) can skip that
    /// work and leave the single hash to [`Self::write_piece`]'s verified
    /// path instead of hashing the buffer twice.
    pub async fn supports_verified_write(&self, id: TorrentId, index: PieceIndex) -> bool {
        let (reply, recv) = oneshot::channel();
        if self
            .commands
            .send(Command::SupportsVerifiedWrite { id, index, reply })
            .is_err()
        {
            return false;
        }
        recv.await.unwrap_or(false)
    }

    /// Stops accepting new jobs and waits for every in-flight job to drain.
    pub async fn drain(&self) {
        let (reply, recv) = oneshot::channel();
        if self.commands.send(Command::Drain { reply }).is_ok() {
            let _ = recv.await;
        }
    }

    /// Re-enables submission after [`Self::drain`].
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Permanently stops accepting new jobs, rejecting every job still in
    /// flight or queued with [`WriteError::QueueClosed`].
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy);
    }

    /// Marks `file_index` as skipped or wanted for `id`'s storage.
    pub fn set_file_skip(&self, id: TorrentId, file_index: crate::FileIndex, skip: bool) {
        let _ = self
            .commands
            .send(Command::SetFileSkip { id, file_index, skip });
    }

    /// Materializes an already-verified piece out of its `.parts` holding
    /// file, now that the file it belongs to is no longer skipped.
    pub async fn materialize_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
    ) -> Result<(), WriteError> {
        let (reply, recv) = oneshot::channel();
        self.commands
            .send(Command::MaterializePiece { id, index, reply })
            .map_err(|_| WriteError::QueueClosed)?;
        recv.await.map_err(|_| WriteError::QueueClosed)?
    }

    /// Removes `file_index`'s `.parts` holding file.
    pub fn drop_parts_file(&self, id: TorrentId, file_index: crate::FileIndex) {
        let _ = self
            .commands
            .send(Command::DropPartsFile { id, file_index });
    }
}

fn closed_io_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "disk actor task is gone")
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, queue: DiskQueue) {
    let mut torrents: HashMap<TorrentId, Arc<TorrentStorage>> = HashMap::new();

    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::AllocateTorrent {
                id,
                info,
                piece_hashes,
                read_cache_capacity,
                reply,
            } => {
                let result = tokio::task::spawn_blocking(move || {
                    TorrentStorage::new(info, piece_hashes, read_cache_capacity)
                })
                .await;
                match result {
                    Ok(Ok(storage)) => {
                        torrents.insert(id, Arc::new(storage));
                        let _ = reply.send(Ok(()));
                    }
                    Ok(Err(e)) => {
                        let _ = reply.send(Err(e));
                    }
                    Err(_) => {
                        let _ = reply.send(Err(NewTorrentError::Io(closed_io_error())));
                    }
                }
            }
            Command::RemoveTorrent { id } => {
                torrents.remove(&id);
            }
            Command::WritePiece {
                id,
                index,
                buffer,
                verify,
                reply,
            } => {
                let storage = torrents.get(&id).cloned();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let storage = match storage {
                        Some(s) => s,
                        None => {
                            let _ = reply.send(Err(WriteError::InvalidPieceIndex));
                            return;
                        }
                    };
                    let eligible = verify
                        && storage.supports_verified_write(index).unwrap_or(false);
                    let is_parts_file = storage.is_parts_write(index);
                    let result = queue
                        .submit(is_parts_file, async {
                            tokio::task::spawn_blocking(move || {
                                if eligible {
                                    storage
                                        .write_piece_verified(index, buffer)
                                        .map(|written| match written {
                                            Some(_) => WriteOutcome::Ok,
                                            None => WriteOutcome::HashMismatch,
                                        })
                                } else {
                                    storage
                                        .write_piece(index, buffer)
                                        .map(|_| WriteOutcome::Ok)
                                }
                            })
                            .await
                            .map_err(|_| WriteError::Io(closed_io_error()))?
                        })
                        .await;
                    let _ = reply.send(result);
                });
            }
            Command::ReadBlock {
                id,
                index,
                offset,
                len,
                reply,
            } => {
                let storage = torrents.get(&id).cloned();
                tokio::spawn(async move {
                    let block = match storage {
                        Some(storage) => tokio::task::spawn_blocking(move || {
                            storage.read_cached_block(index, offset, len)
                        })
                        .await
                        .unwrap_or(None),
                        None => None,
                    };
                    let _ = reply.send(block);
                });
            }
            Command::ReadPiece { id, index, reply } => {
                let storage = torrents.get(&id).cloned();
                tokio::spawn(async move {
                    let result = match storage {
                        Some(storage) => tokio::task::spawn_blocking(move || {
                            storage.read_piece_from_disk(index)
                        })
                        .await
                        .unwrap_or(Err(WriteError::Io(closed_io_error()))),
                        None => Err(WriteError::InvalidPieceIndex),
                    };
                    let _ = reply.send(result);
                });
            }
            Command::SupportsVerifiedWrite { id, index, reply } => {
                let supported = torrents
                    .get(&id)
                    .and_then(|storage| storage.supports_verified_write(index).ok())
                    .unwrap_or(false);
                let _ = reply.send(supported);
            }
            Command::Drain { reply } => {
                queue.drain().await;
                let _ = reply.send(());
            }
            Command::Resume => queue.resume(),
            Command::Destroy => {
                queue.destroy();
                torrents.clear();
            }
            Command::SetFileSkip { id, file_index, skip } => {
                // Routed through the `.parts` lock too: a skip/unskip flip
                // must not be observed mid-flight by a `.parts` write or a
                // materialize that started under the old flag value.
                if let Some(storage) = torrents.get(&id).cloned() {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        let _ = queue
                            .submit(true, async move {
                                storage.set_skip(file_index, skip);
                                Ok::<(), WriteError>(())
                            })
                            .await;
                    });
                }
            }
            Command::MaterializePiece { id, index, reply } => {
                let storage = torrents.get(&id).cloned();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let result = match storage {
                        Some(storage) => {
                            queue
                                .submit(true, async {
                                    tokio::task::spawn_blocking(move || {
                                        storage.materialize_piece(index)
                                    })
                                    .await
                                    .map_err(|_| WriteError::Io(closed_io_error()))?
                                })
                                .await
                        }
                        None => Err(WriteError::InvalidPieceIndex),
                    };
                    let _ = reply.send(result);
                });
            }
            Command::DropPartsFile { id, file_index } => {
                if let Some(storage) = torrents.get(&id).cloned() {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        let _ = queue
                            .submit(true, async move {
                                tokio::task::spawn_blocking(move || {
                                    storage.drop_parts_file(file_index);
                                })
                                .await
                                .map_err(|_| WriteError::Io(closed_io_error()))?;
                                Ok::<(), WriteError>(())
                            })
                            .await;
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use sha1::{Digest, Sha1};
    use tempfile::tempdir;

    fn single_file_info(dir: &std::path::Path, piece_len: u32, data: &[u8]) -> StorageInfo {
        let file = FileInfo {
            path: std::path::PathBuf::from("a.bin"),
            len: data.len() as u64,
            torrent_offset: 0,
        };
        let piece_count = ((data.len() as u32 + piece_len - 1) / piece_len) as usize;
        let last_piece_len = data.len() as u32 - piece_len * (piece_count as u32 - 1);
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: data.len() as u64,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(file),
        }
    }

    fn hashes_for(data: &[u8], piece_len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let mut hasher = Sha1::new();
            hasher.input(chunk);
            out.extend_from_slice(hasher.result().as_slice());
        }
        out
    }

    #[tokio::test]
    async fn allocate_write_and_read_back_round_trips() {
        let dir = tempdir().unwrap();
        let data = vec![9u8; 32];
        let info = single_file_info(dir.path(), 16, &data);
        let hashes = hashes_for(&data, 16);

        let disk = DiskHandle::spawn(2);
        disk.allocate_torrent(1, info, hashes, 4).await.unwrap();

        let outcome = disk
            .write_piece(1, 0, Arc::new(data[0..16].to_vec()), false)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Ok);

        let read = disk.read_block(1, 0, 0, 16).await.unwrap();
        assert_eq!(read, data[0..16]);
    }

    #[tokio::test]
    async fn verified_write_rejects_mismatched_hash_without_writing() {
        let dir = tempdir().unwrap();
        let data = vec![1u8; 16];
        let info = single_file_info(dir.path(), 16, &data);
        let hashes = hashes_for(&data, 16);

        let disk = DiskHandle::spawn(2);
        disk.allocate_torrent(1, info, hashes, 4).await.unwrap();

        let outcome = disk
            .write_piece(1, 0, Arc::new(vec![0xAA; 16]), true)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::HashMismatch);
    }

    #[tokio::test]
    async fn destroyed_disk_rejects_further_writes() {
        let dir = tempdir().unwrap();
        let data = vec![1u8; 16];
        let info = single_file_info(dir.path(), 16, &data);
        let hashes = hashes_for(&data, 16);

        let disk = DiskHandle::spawn(2);
        disk.allocate_torrent(1, info, hashes, 4).await.unwrap();
        disk.destroy();

        // give the actor a chance to process the destroy command before the
        // write lands
        tokio::time::delay_for(std::time::Duration::from_millis(20)).await;

        let result = disk.write_piece(1, 0, Arc::new(data), false).await;
        assert!(matches!(result, Err(WriteError::QueueClosed)));
    }
}
