//! Disk-subsystem specific error types, converting into [`crate::error::Error`]
//! at the boundary the same way `metainfo`'s bencode errors do.

use std::fmt;

/// Failure allocating a new torrent's on-disk storage.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// A torrent with this id is already allocated.
    AlreadyExists,
    /// The download path already exists on disk.
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "IO error allocating torrent storage: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure writing or reading a piece/block.
#[derive(Debug)]
pub(crate) enum WriteError {
    InvalidPieceIndex,
    Io(std::io::Error),
    /// The disk queue has been drained/destroyed and rejects new jobs.
    QueueClosed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "disk IO error: {}", e),
            Self::QueueClosed => write!(f, "disk queue is draining or destroyed"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for WriteError {
    fn from(_: nix::Error) -> Self {
        Self::Io(std::io::Error::last_os_error())
    }
}

impl From<NewTorrentError> for crate::error::Error {
    fn from(e: NewTorrentError) -> Self {
        match e {
            NewTorrentError::AlreadyExists => {
                crate::error::Error::ProtocolViolation("torrent already allocated".to_owned())
            }
            NewTorrentError::Io(e) => crate::error::Error::Io(e),
        }
    }
}

impl From<WriteError> for crate::error::Error {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::InvalidPieceIndex => crate::error::Error::InvalidPieceIndex,
            WriteError::Io(e) => crate::error::Error::Io(e),
            WriteError::QueueClosed => {
                crate::error::Error::ProtocolViolation("disk queue closed".to_owned())
            }
        }
    }
}
