//! The peer connection layer.
//!
//! [`session::PeerSession`] is the actor running a single connection; the
//! types here are the shared vocabulary it uses to talk to `Torrent`: the
//! [`Command`]s `Torrent` pushes down into a running session, the [`Event`]s
//! a session reports back up, and the [`Status`] bookkeeping a session
//! keeps on itself.
//!
//! A session talks to `Torrent` over channels rather than `Torrent` reaching
//! into the session directly.

pub(crate) mod codec;
pub(crate) mod session;

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::Error;
use crate::{PeerId, PieceIndex};

pub(crate) use session::PeerSession;

/// The lifecycle state of a single peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    AwaitHandshake,
    Connected,
    Disconnected,
}

/// The four choke/interest booleans a connection tracks in both directions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Status {
    /// Whether we are choking the peer (if so, we don't serve their
    /// requests).
    pub am_choking: bool,
    /// Whether we are interested in the peer (if so, and once unchoked, we
    /// may request blocks from them).
    pub am_interested: bool,
    /// Whether the peer is choking us.
    pub peer_choking: bool,
    /// Whether the peer is interested in us.
    pub peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// A point-in-time snapshot of a connected session's public state, handed
/// to `Torrent` for feeding into [`crate::peer_coordinator::PeerCoordinator`]
/// and [`crate::swarm::Swarm`] bookkeeping, without giving either a live
/// reference into the session.
#[derive(Clone, Debug)]
pub(crate) struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    pub client_name: Option<String>,
    pub status: Status,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub connected_at: Instant,
    pub last_data_received: Option<Instant>,
}

/// Commands `Torrent` sends down into a running [`session::PeerSession`]
/// task.
#[derive(Debug)]
pub(crate) enum Command {
    Choke,
    Unchoke,
    /// A piece became wanted or its priority changed; wakes the session's
    /// request loop in case it has pipeline room to fill.
    PiecesAvailable,
    /// Announces a newly verified piece to this peer.
    Have(PieceIndex),
    /// Closes the connection (`Torrent` is shutting down, or dropped the
    /// peer deliberately as a coordinator drop decision).
    Shutdown,
}

/// Events a [`session::PeerSession`] task reports back to `Torrent`, always
/// paired with the session's address since `Torrent` multiplexes many of
/// these over one channel.
#[derive(Debug)]
pub(crate) enum Event {
    /// The handshake (and, if supported, the extension handshake)
    /// completed.
    Connected { peer_id: PeerId },
    /// A piece was received, hashed, and found to match -- `Torrent` should
    /// broadcast a `have` to every other connected peer.
    PieceVerified { piece_index: PieceIndex },
    /// A completed piece failed its hash check. Carries how many blocks
    /// each contributing peer supplied, so `Torrent` can tell whether a
    /// peer supplied a supermajority of the corrupt data and ban it.
    PieceHashMismatch {
        piece_index: PieceIndex,
        contributors: Vec<(PeerId, u32)>,
    },
    /// The connection ended, carrying the error that caused it, if any (a
    /// clean disconnect from the other side carries `None`).
    Disconnected { error: Option<Error> },
    /// A periodic snapshot of this session's bookkeeping, sent alongside
    /// its own internal cleanup tick. `Torrent` folds these into
    /// [`PeerInfo`] records it feeds to `PeerCoordinator`/`Swarm`, since it
    /// holds no live reference into the session task that produced them.
    Stats {
        peer_interested: bool,
        am_choking: bool,
        peer_choking: bool,
        download_rate: u64,
        upload_rate: u64,
        downloaded: u64,
        uploaded: u64,
        connected_at: Instant,
        last_data_received: Option<Instant>,
    },
}
