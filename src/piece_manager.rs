//! The authority on which pieces the local client has, which are hashed and
//! durable, and how rare each piece is across currently connected peers.
//!
//! [`PieceManager`] owns the torrent's own [`BitField`], the expected piece
//! hashes, the per-piece priority vector and the availability vector. It
//! knows nothing about peer connections or sockets -- peers are referred to
//! only by the opaque [`PeerId`]-keyed handle the caller supplies, so
//! `PieceManager` holds no references to peers at all.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use sha1::{Digest, Sha1};

use crate::{bitfield::BitField, PieceIndex, Sha1Hash};

/// A piece's priority, as set by [`PieceManager::set_piece_priority`] (which
/// `Torrent::set_file_priority` recomputes from overlapping file
/// priorities).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Priority {
    /// The piece's file(s) are deprioritized; it is never picked.
    Skip = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Skip,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Identifies which peer a piece of availability/rarity bookkeeping
/// concerns. An opaque key, not a socket or connection handle.
pub type PeerKey = u64;

/// Derives a [`PeerKey`] from a peer's socket address. Stable for the
/// lifetime of a connection (addresses don't change mid-session), and
/// available before the handshake completes, unlike the peer's actual
/// 20 byte id.
pub(crate) fn peer_key(addr: &SocketAddr) -> PeerKey {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish()
}

/// The authoritative record of piece state for a single torrent.
pub(crate) struct PieceManager {
    /// The local client's own bitfield: which pieces are verified and
    /// durable on disk.
    own: BitField,
    /// The expected SHA-1 hash of each piece, in piece index order.
    hashes: Vec<Sha1Hash>,
    /// The nominal piece length (the last piece may be shorter).
    piece_len: u32,
    /// The length of the last piece.
    last_piece_len: u32,
    /// Per-piece priority; index-aligned with `own`/`hashes`.
    priority: Vec<Priority>,
    /// Per-piece count of currently connected peers known to have the
    /// piece, saturating at `u16::MAX`.
    availability: Vec<u16>,
    /// The last bitfield we received from each connected peer, kept so
    /// that on disconnect we know which counts in `availability` to
    /// decrement.
    peer_bitfields: HashMap<PeerKey, BitField>,
}

impl PieceManager {
    /// Creates a piece manager for a torrent with `hashes.len()` pieces, all
    /// initially missing and of normal priority.
    pub fn new(hashes: Vec<Sha1Hash>, piece_len: u32, last_piece_len: u32) -> Self {
        let n = hashes.len();
        Self {
            own: BitField::new(n),
            hashes,
            piece_len,
            last_piece_len,
            priority: vec![Priority::Normal; n],
            availability: vec![0; n],
            peer_bitfields: HashMap::new(),
        }
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// A read-only view of the local client's own bitfield.
    pub fn own_bitfield(&self) -> &BitField {
        &self.own
    }

    /// The length, in bytes, of the piece at `index`.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.hashes.len() {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// The priority of the piece at `index`.
    pub fn priority(&self, index: PieceIndex) -> Priority {
        self.priority[index]
    }

    /// Sets the priority of the piece at `index`. The piece may then need to
    /// be reconsidered by the picker (it is not itself touched here).
    pub fn set_piece_priority(&mut self, index: PieceIndex, priority: Priority) {
        self.priority[index] = priority;
    }

    /// The number of connected peers known to have the piece at `index`.
    pub fn availability(&self, index: PieceIndex) -> u16 {
        self.availability[index]
    }

    /// The full availability vector, as consumed by the piece picker.
    pub fn availability_vec(&self) -> &[u16] {
        &self.availability
    }

    /// The full priority vector, as consumed by the piece picker.
    pub fn priority_vec(&self) -> &[Priority] {
        &self.priority
    }

    /// Hashes `buffer` (expected to be exactly the piece's full length) and
    /// compares it against the piece's expected hash.
    ///
    /// Constant-time comparison is not required: the expected hash
    /// originates from trusted, already-authenticated torrent metadata, not
    /// from the peer whose data is being checked.
    pub fn verify_piece(&self, index: PieceIndex, buffer: &[u8]) -> bool {
        let mut hasher = Sha1::new();
        hasher.input(buffer);
        let digest = hasher.result();
        digest.as_slice() == self.hashes[index]
    }

    /// Marks a piece as verified and durable in the local client's own
    /// bitfield.
    ///
    /// Returns `true` if this is the first time the piece was marked (a
    /// redundant call, which shouldn't normally happen, is a no-op).
    pub fn mark_verified(&mut self, index: PieceIndex) -> bool {
        if self.own.get(index) {
            return false;
        }
        self.own.set(index, true);
        true
    }

    /// Folds a peer's full bitfield into the availability vector, replacing
    /// whatever bitfield we previously had on file for them (if any).
    pub fn on_peer_bitfield(&mut self, peer: PeerKey, bitfield: BitField) {
        if let Some(prev) = self.peer_bitfields.get(&peer) {
            for i in 0..prev.len() {
                if prev.get(i) {
                    self.availability[i] = self.availability[i].saturating_sub(1);
                }
            }
        }
        for i in 0..bitfield.len() {
            if bitfield.get(i) {
                self.availability[i] = self.availability[i].saturating_add(1);
            }
        }
        self.peer_bitfields.insert(peer, bitfield);
    }

    /// Registers a single `have` announce from a peer, incrementing that
    /// piece's availability and updating our record of the peer's bitfield.
    pub fn on_peer_have(&mut self, peer: PeerKey, index: PieceIndex) {
        let bitfield = self
            .peer_bitfields
            .entry(peer)
            .or_insert_with(|| BitField::new(self.hashes.len()));
        if !bitfield.get(index) {
            bitfield.set(index, true);
            self.availability[index] = self.availability[index].saturating_add(1);
        }
    }

    /// Removes a disconnected peer's contribution to the availability
    /// vector, decrementing the count for every piece the peer was last
    /// known to have.
    pub fn on_peer_disconnect(&mut self, peer: PeerKey) {
        if let Some(bitfield) = self.peer_bitfields.remove(&peer) {
            for i in 0..bitfield.len() {
                if bitfield.get(i) {
                    self.availability[i] = self.availability[i].saturating_sub(1);
                }
            }
        }
    }

    /// The lowest piece index that we don't have and that is wanted
    /// (priority != skip), used as a cheaper starting point for picker
    /// scans late in a download. Returns `None` if no such piece exists.
    pub fn first_needed_piece(&self) -> Option<PieceIndex> {
        (0..self.hashes.len())
            .find(|&i| !self.own.get(i) && self.priority[i] != Priority::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: u8, len: usize) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.input(&vec![byte; len]);
        let digest = hasher.result();
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn verify_piece_matches_expected_hash() {
        let hashes = vec![hash_of(7, 16), hash_of(8, 16)];
        let pm = PieceManager::new(hashes, 16, 16);
        assert!(pm.verify_piece(0, &vec![7; 16]));
        assert!(!pm.verify_piece(0, &vec![9; 16]));
        assert!(pm.verify_piece(1, &vec![8; 16]));
    }

    #[test]
    fn mark_verified_sets_own_bitfield_once() {
        let hashes = vec![hash_of(1, 16); 3];
        let mut pm = PieceManager::new(hashes, 16, 16);
        assert!(pm.mark_verified(0));
        assert!(pm.own_bitfield().get(0));
        assert!(!pm.mark_verified(0));
    }

    #[test]
    fn availability_tracks_connected_peers_only() {
        let hashes = vec![hash_of(1, 16); 3];
        let mut pm = PieceManager::new(hashes, 16, 16);

        let mut peer_a = BitField::new(3);
        peer_a.set(0, true);
        peer_a.set(1, true);
        pm.on_peer_bitfield(1, peer_a);

        let mut peer_b = BitField::new(3);
        peer_b.set(0, true);
        pm.on_peer_bitfield(2, peer_b);

        assert_eq!(pm.availability(0), 2);
        assert_eq!(pm.availability(1), 1);
        assert_eq!(pm.availability(2), 0);

        pm.on_peer_disconnect(1);
        assert_eq!(pm.availability(0), 1);
        assert_eq!(pm.availability(1), 0);
    }

    #[test]
    fn have_message_increments_availability_once() {
        let hashes = vec![hash_of(1, 16); 2];
        let mut pm = PieceManager::new(hashes, 16, 16);
        pm.on_peer_have(1, 0);
        pm.on_peer_have(1, 0);
        assert_eq!(pm.availability(0), 1);
    }

    #[test]
    fn first_needed_piece_skips_have_and_skip_priority() {
        let hashes = vec![hash_of(1, 16); 4];
        let mut pm = PieceManager::new(hashes, 16, 16);
        pm.mark_verified(0);
        pm.set_piece_priority(1, Priority::Skip);
        assert_eq!(pm.first_needed_piece(), Some(2));
    }
}
