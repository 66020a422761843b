//! Per-piece block buffering and outstanding-request tracking for pieces
//! that are currently being downloaded.
//!
//! [`ActivePieceManager`] is owned by the `Torrent`, not by an individual
//! `PeerSession`, and is shared behind `Arc<RwLock<_>>` (see
//! `peer::session`). This lets a block be re-requested from a different peer
//! after the peer that had it outstanding disconnects.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{block_count, block_len, BlockInfo, PeerId, PieceIndex};

/// A single outstanding block request: who it was sent to and when.
#[derive(Clone, Copy, Debug)]
struct PendingRequest {
    peer: PeerId,
    requested_at: Instant,
}

/// The mutable, in-progress state of a single piece download: its write
/// buffer, which blocks have arrived, and which are outstanding and to
/// whom.
pub(crate) struct ActivePiece {
    /// The piece's dense byte buffer, sized to the piece's full length.
    /// Bytes for blocks not yet received are left zeroed (but are not
    /// observable as such since `is_complete` gates hashing/writing).
    buf: Vec<u8>,
    /// Which blocks (indexed by block-in-piece) have been received.
    received: Vec<bool>,
    /// Outstanding requests, keyed by block-in-piece index. A block absent
    /// from this map and not yet in `received` is simply unrequested.
    pending: HashMap<usize, PendingRequest>,
    /// Per-peer count of blocks actually received for this piece, kept so
    /// that a failed hash check can identify which peer supplied a
    /// supermajority of the corrupt data.
    contributors: HashMap<PeerId, u32>,
    created_at: Instant,
    last_activity_at: Instant,
}

impl ActivePiece {
    fn new(len: u32, now: Instant) -> Self {
        let n_blocks = block_count(len);
        Self {
            buf: vec![0; len as usize],
            received: vec![false; n_blocks],
            pending: HashMap::new(),
            contributors: HashMap::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// The piece's length, in bytes.
    pub fn len(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Picks up to `n` unrequested (or re-requestable, i.e. timed-out)
    /// blocks and marks them as requested from `peer`, appending their
    /// `BlockInfo`s to `out`.
    pub fn pick_blocks(
        &mut self,
        index: PieceIndex,
        peer: PeerId,
        n: usize,
        now: Instant,
        out: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for block_idx in 0..self.received.len() {
            if picked >= n {
                break;
            }
            if self.received[block_idx] || self.pending.contains_key(&block_idx) {
                continue;
            }
            let offset = block_idx as u32 * crate::BLOCK_LEN;
            let len = block_len(self.len(), block_idx);
            self.pending.insert(
                block_idx,
                PendingRequest {
                    peer,
                    requested_at: now,
                },
            );
            out.push(BlockInfo {
                piece_index: index,
                offset,
                len,
            });
            picked += 1;
        }
        if picked > 0 {
            self.last_activity_at = now;
        }
    }

    /// Copies a received block's data into the buffer, marks it received
    /// and removes its pending-request entry.
    ///
    /// Returns `false` if the block overlaps an already-received region (in
    /// which case the caller should drop the data), or if the offset isn't
    /// block-aligned.
    pub fn receive_block(&mut self, offset: u32, data: &[u8], now: Instant) -> bool {
        if offset % crate::BLOCK_LEN != 0 {
            return false;
        }
        let block_idx = (offset / crate::BLOCK_LEN) as usize;
        if block_idx >= self.received.len() || self.received[block_idx] {
            return false;
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            return false;
        }
        self.buf[start..end].copy_from_slice(data);
        self.received[block_idx] = true;
        if let Some(req) = self.pending.remove(&block_idx) {
            *self.contributors.entry(req.peer).or_insert(0) += 1;
        }
        self.last_activity_at = now;
        true
    }

    /// Per-peer count of blocks actually received for this piece so far, as
    /// consumed when attributing a failed hash check to a contributor.
    pub fn contributors(&self) -> &HashMap<PeerId, u32> {
        &self.contributors
    }

    /// Whether every block has been received.
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&b| b)
    }

    /// The assembled piece buffer. Only meaningful once `is_complete`.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Drops every outstanding request attributed to `peer`, making those
    /// blocks eligible for re-request (from any peer, including the same
    /// one, once reconnected).
    pub fn clear_requests_for_peer(&mut self, peer: PeerId) {
        self.pending.retain(|_, req| req.peer != peer);
    }

    /// Drops outstanding requests older than `timeout`, freeing the blocks
    /// for re-request. Does not touch the piece's own liveness.
    pub fn expire_stale_requests(&mut self, now: Instant, timeout: Duration) {
        self.pending
            .retain(|_, req| now.duration_since(req.requested_at) <= timeout);
    }

    /// Whether the piece has had no activity (arrival of data) for
    /// `timeout`, and has received no blocks at all -- the wholesale
    /// inactivity condition that causes the piece itself (not just
    /// individual requests) to be abandoned.
    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        self.received.iter().all(|&b| !b)
            && now.duration_since(self.last_activity_at) >= timeout
    }

    /// The total number of bytes occupied by received blocks, using the
    /// canonical block length (with the usual last-block adjustment).
    fn received_bytes(&self, piece_len: u32) -> u64 {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, &r)| r)
            .map(|(i, _)| block_len(piece_len, i) as u64)
            .sum()
    }
}

/// Owns every piece currently being downloaded for a torrent, enforcing two
/// capacity bounds: a maximum active-piece count and a maximum total
/// buffered-byte count.
pub(crate) struct ActivePieceManager {
    pieces: HashMap<PieceIndex, ActivePiece>,
    max_active_pieces: usize,
    max_buffered_bytes: u64,
    stale_timeout: Duration,
}

impl ActivePieceManager {
    pub fn new(max_active_pieces: usize, max_buffered_bytes: u64, stale_timeout: Duration) -> Self {
        Self {
            pieces: HashMap::new(),
            max_active_pieces,
            max_buffered_bytes,
            stale_timeout,
        }
    }

    /// Whether `index` currently has an active (in-progress) buffer.
    pub fn has(&self, index: PieceIndex) -> bool {
        self.pieces.contains_key(&index)
    }

    /// The set of indices with an active buffer, in the layout the picker
    /// expects: a dense `started[index] = true/false` vector.
    pub fn started_vec(&self, piece_count: usize) -> Vec<bool> {
        let mut started = vec![false; piece_count];
        for &index in self.pieces.keys() {
            started[index] = true;
        }
        started
    }

    /// The sum of all buffered bytes across every active piece.
    pub fn total_buffered_bytes(&self) -> u64 {
        self.pieces.values().map(|p| p.buf.len() as u64).sum()
    }

    /// Returns the active piece at `index`, lazily creating it (and
    /// counting it against the capacity caps) if it doesn't exist yet.
    /// Returns `None` if creating it would exceed `max_active_pieces` or
    /// `max_buffered_bytes`.
    pub fn get_or_create(
        &mut self,
        index: PieceIndex,
        len: u32,
        now: Instant,
    ) -> Option<&mut ActivePiece> {
        if !self.pieces.contains_key(&index) {
            if self.pieces.len() >= self.max_active_pieces {
                return None;
            }
            if self.total_buffered_bytes() + len as u64 > self.max_buffered_bytes {
                return None;
            }
            self.pieces.insert(index, ActivePiece::new(len, now));
        }
        self.pieces.get_mut(&index)
    }

    /// Returns the active piece at `index`, if any, without creating it.
    pub fn get_mut(&mut self, index: PieceIndex) -> Option<&mut ActivePiece> {
        self.pieces.get_mut(&index)
    }

    /// Removes a piece's active buffer, whether because it verified
    /// successfully or because it was abandoned (hash mismatch, stale
    /// timeout, explicit abort).
    pub fn remove(&mut self, index: PieceIndex) -> Option<ActivePiece> {
        self.pieces.remove(&index)
    }

    /// Drops every outstanding request attributed to `peer` across all
    /// active pieces, freeing those blocks for re-request elsewhere.
    pub fn clear_requests_for_peer(&mut self, peer: PeerId) {
        for piece in self.pieces.values_mut() {
            piece.clear_requests_for_peer(peer);
        }
    }

    /// Expires stale individual block requests (not whole pieces) across
    /// every active piece.
    pub fn expire_stale_requests(&mut self, now: Instant, request_timeout: Duration) {
        for piece in self.pieces.values_mut() {
            piece.expire_stale_requests(now, request_timeout);
        }
    }

    /// Scans for pieces with no activity and no received blocks for longer
    /// than the configured stale timeout, and removes them, returning their
    /// indices so the caller can log/account for the abandonment.
    pub fn remove_stale_pieces(&mut self, now: Instant) -> Vec<PieceIndex> {
        let stale: Vec<PieceIndex> = self
            .pieces
            .iter()
            .filter(|(_, p)| p.is_stale(now, self.stale_timeout))
            .map(|(&index, _)| index)
            .collect();
        for &index in &stale {
            self.pieces.remove(&index);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        let mut id = [0; 20];
        id[0] = n;
        id
    }

    #[test]
    fn get_or_create_respects_max_active_pieces_cap() {
        let mut mgr = ActivePieceManager::new(1, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        assert!(mgr.get_or_create(0, 16384, now).is_some());
        assert!(mgr.get_or_create(1, 16384, now).is_none());
    }

    #[test]
    fn get_or_create_respects_max_buffered_bytes_cap() {
        let mut mgr = ActivePieceManager::new(10, 16384, Duration::from_secs(60));
        let now = Instant::now();
        assert!(mgr.get_or_create(0, 16384, now).is_some());
        assert!(mgr.get_or_create(1, 16384, now).is_none());
    }

    #[test]
    fn blocks_are_requested_exactly_once_until_timeout() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        let piece = mgr.get_or_create(0, 32768, now).unwrap();
        let mut out = Vec::new();
        piece.pick_blocks(0, peer(1), 10, now, &mut out);
        // only 2 blocks exist in a 32 KiB piece
        assert_eq!(out.len(), 2);
        out.clear();
        // no more blocks to give out, all outstanding
        piece.pick_blocks(0, peer(2), 10, now, &mut out);
        assert!(out.is_empty());

        // after the request timeout the blocks become eligible again
        piece.expire_stale_requests(now + Duration::from_secs(61), Duration::from_secs(30));
        piece.pick_blocks(0, peer(2), 10, now + Duration::from_secs(61), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn receiving_a_block_completes_the_piece() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        let piece = mgr.get_or_create(0, 16384, now).unwrap();
        assert!(!piece.is_complete());
        assert!(piece.receive_block(0, &vec![1; 16384], now));
        assert!(piece.is_complete());
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        let piece = mgr.get_or_create(0, 16384, now).unwrap();
        assert!(piece.receive_block(0, &vec![1; 16384], now));
        assert!(!piece.receive_block(0, &vec![2; 16384], now));
    }

    #[test]
    fn clear_requests_for_peer_frees_only_that_peers_blocks() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        let piece = mgr.get_or_create(0, 32768, now).unwrap();
        let mut out = Vec::new();
        piece.pick_blocks(0, peer(1), 1, now, &mut out);
        piece.pick_blocks(0, peer(2), 1, now, &mut out);
        assert_eq!(out.len(), 2);

        piece.clear_requests_for_peer(peer(1));
        out.clear();
        piece.pick_blocks(0, peer(3), 10, now, &mut out);
        // only peer(1)'s block should have been freed
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn stale_piece_with_no_received_blocks_is_removed() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        mgr.get_or_create(0, 16384, now);
        let later = now + Duration::from_secs(61);
        let removed = mgr.remove_stale_pieces(later);
        assert_eq!(removed, vec![0]);
        assert!(!mgr.has(0));
    }

    #[test]
    fn piece_with_received_blocks_is_never_pruned_by_staleness() {
        let mut mgr = ActivePieceManager::new(10, 1024 * 1024, Duration::from_secs(60));
        let now = Instant::now();
        {
            let piece = mgr.get_or_create(0, 16384, now).unwrap();
            piece.receive_block(0, &vec![1; 16384], now);
        }
        let later = now + Duration::from_secs(1000);
        let removed = mgr.remove_stale_pieces(later);
        assert!(removed.is_empty());
    }
}
