//! The crate-wide error type.
//!
//! Sub-areas that need a richer vocabulary of failure modes (disk IO, the
//! wire protocol codec) define their own, more specific error enums in their
//! own `error` modules and convert into this one at the boundary, the same
//! way `disk::error::WriteError` converts into `Error` here.

use std::fmt;

use tokio::sync::mpsc::error::SendError;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that may occur anywhere in the engine and that don't warrant their
/// own dedicated error enum.
#[derive(Debug)]
pub enum Error {
    /// Wraps a generic IO error (socket or filesystem).
    Io(std::io::Error),
    /// The metadata (`.torrent`/magnet-derived info dict) failed to parse or
    /// validate.
    Bencode(serde_bencode::Error),
    /// A torrent id was used that isn't known to the engine.
    InvalidTorrentId,
    /// A piece index was used that is out of range for the torrent.
    InvalidPieceIndex,
    /// A peer's handshake advertised an info hash that doesn't match the
    /// torrent we're downloading.
    InvalidPeerInfoHash,
    /// A peer's handshake carried a malformed protocol string.
    InvalidProtocolString,
    /// We only support downloading (not yet resuming with partial data), so
    /// our peers must be seeds; a non-seed peer causes the session to abort.
    PeerNotSeed,
    /// Peer sent a bitfield message at a point in the session other than
    /// directly after the handshake, which is a protocol violation.
    BitfieldNotAfterHandshake,
    /// A received bitfield's length didn't match `ceil(piece_count / 8)`.
    InvalidBitfieldLength,
    /// A peer requested (or sent) a block whose offset/length falls outside
    /// its piece.
    InvalidBlockRequest,
    /// A peer requested a block larger than the protocol maximum.
    RequestTooLarge,
    /// The wire frame length prefix exceeded the maximum allowed frame size.
    FrameTooLarge,
    /// An internal channel closed unexpectedly; this generally means the
    /// task on the other end has shut down or panicked.
    ChannelClosed,
    /// A generic protocol violation, carrying a human readable reason.
    ProtocolViolation(String),
    /// An operation was attempted on a torrent that doesn't have its
    /// metadata yet.
    MetainfoMissing,
    /// The fetched metadata's hash didn't match the torrent's info hash.
    MetainfoHashMismatch,
    /// A torrent's metadata failed the structural validation spelled out in
    /// the `ParsedTorrent` contract (piece length bounds, length/piece-count
    /// consistency, contiguous file offsets).
    InvalidMetainfo(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::InvalidProtocolString => {
                write!(f, "peer handshake protocol string mismatch")
            }
            Error::PeerNotSeed => write!(f, "peer is not a seed"),
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message sent after handshake window")
            }
            Error::InvalidBitfieldLength => {
                write!(f, "bitfield length doesn't match piece count")
            }
            Error::InvalidBlockRequest => write!(f, "invalid block request"),
            Error::RequestTooLarge => write!(f, "requested block too large"),
            Error::FrameTooLarge => write!(f, "wire frame too large"),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::ProtocolViolation(reason) => {
                write!(f, "protocol violation: {}", reason)
            }
            Error::MetainfoMissing => write!(f, "torrent metadata not yet known"),
            Error::MetainfoHashMismatch => {
                write!(f, "fetched metadata hashes to the wrong info hash")
            }
            Error::InvalidMetainfo(reason) => {
                write!(f, "invalid torrent metadata: {}", reason)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

/// The reason a peer address was banned in the [`crate::swarm::Swarm`].
///
/// `ProtocolError` is recoverable (lifted by
/// [`crate::swarm::Swarm::unban_recoverable`]); `CorruptData` is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BanReason {
    /// The peer violated the wire protocol (bad handshake, oversized frame,
    /// malformed bitfield).
    ProtocolError,
    /// The peer repeatedly contributed the majority of the blocks of a piece
    /// that failed hash verification.
    CorruptData,
}

impl BanReason {
    /// Whether [`crate::swarm::Swarm::unban_recoverable`] should lift a ban
    /// with this reason.
    pub fn is_recoverable(self) -> bool {
        match self {
            BanReason::ProtocolError => true,
            BanReason::CorruptData => false,
        }
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanReason::ProtocolError => write!(f, "protocol_error"),
            BanReason::CorruptData => write!(f, "corrupt data"),
        }
    }
}
