//! Address-keyed peer registry with connect-candidate selection and backoff.
//!
//! `Swarm` never owns a live connection, only the address key and metadata
//! about it -- the `PeerConnection` itself lives exclusively on `Torrent`
//! (see `torrent.rs`), which breaks the otherwise-cyclic ownership between
//! torrent, connection and swarm.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::BanReason;
use crate::PeerId;

/// A quick disconnect is a connection that didn't last long enough to be
/// considered productive.
const QUICK_DISCONNECT_THRESHOLD: Duration = Duration::from_secs(30);

/// The cap on exponential backoff delays, for both failed dials and quick
/// disconnects.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Where a peer address was learned from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerSource {
    Tracker,
    Dht,
    Pex,
    /// Supplied directly by the user (e.g. via a magnet hint or manual add).
    Manual,
}

/// A [`SwarmPeer`]'s lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Banned,
}

/// Everything the swarm tracks about one peer address.
pub(crate) struct SwarmPeer {
    pub source: PeerSource,
    pub state: PeerState,
    pub connect_failures: u32,
    pub quick_disconnects: u32,
    pub last_disconnect: Option<Instant>,
    pub connected_at: Option<Instant>,
    pub ban_reason: Option<BanReason>,
    pub peer_id: Option<PeerId>,
    pub client_name: Option<String>,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl SwarmPeer {
    fn new(source: PeerSource) -> Self {
        Self {
            source,
            state: PeerState::Idle,
            connect_failures: 0,
            quick_disconnects: 0,
            last_disconnect: None,
            connected_at: None,
            ban_reason: None,
            peer_id: None,
            client_name: None,
            downloaded: 0,
            uploaded: 0,
        }
    }
}

/// The registry of every peer address known for a torrent, connected or
/// not.
pub(crate) struct Swarm {
    peers: HashMap<SocketAddr, SwarmPeer>,
}

impl Swarm {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Registers a peer address learned from `source`, if not already
    /// known. A peer already on file is left untouched (its state isn't
    /// reset by re-discovery).
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) {
        self.peers.entry(addr).or_insert_with(|| SwarmPeer::new(source));
    }

    /// Registers a batch of addresses, de-duplicating against what's
    /// already known.
    pub fn add_peers(&mut self, addrs: impl IntoIterator<Item = SocketAddr>, source: PeerSource) {
        for addr in addrs {
            self.add_peer(addr, source);
        }
    }

    /// Read-only access to a peer's record, if known.
    pub fn get(&self, addr: &SocketAddr) -> Option<&SwarmPeer> {
        self.peers.get(addr)
    }

    pub fn mark_connecting(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Connecting;
        }
    }

    pub fn mark_connected(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Connected;
            peer.connected_at = Some(now);
        }
    }

    /// Records a failed dial attempt, incrementing the address's backoff
    /// counter.
    pub fn mark_connect_failed(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Failed;
            peer.connect_failures += 1;
            peer.last_disconnect = Some(now);
        }
    }

    /// Records a disconnect from a previously connected peer, updating the
    /// quick-disconnect counter based on how long the connection lasted.
    pub fn mark_disconnected(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(peer) = self.peers.get_mut(addr) {
            let was_quick = peer
                .connected_at
                .map(|connected_at| now.saturating_duration_since(connected_at) < QUICK_DISCONNECT_THRESHOLD)
                .unwrap_or(true);
            if was_quick {
                peer.quick_disconnects += 1;
            } else {
                peer.quick_disconnects = 0;
            }
            peer.state = PeerState::Idle;
            peer.connected_at = None;
            peer.last_disconnect = Some(now);
        }
    }

    /// Bans an address, permanently (absent an explicit unban) excluding it
    /// from connect candidates.
    pub fn ban(&mut self, addr: &SocketAddr, reason: BanReason) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Banned;
            peer.ban_reason = Some(reason);
        }
    }

    /// Lifts a ban unconditionally, regardless of reason.
    pub fn unban(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.state == PeerState::Banned {
                peer.state = PeerState::Idle;
                peer.ban_reason = None;
            }
        }
    }

    /// Lifts every ban whose reason is recoverable (protocol errors, not
    /// corrupt-data bans).
    pub fn unban_recoverable(&mut self) {
        for peer in self.peers.values_mut() {
            if peer.state == PeerState::Banned {
                if peer.ban_reason.map(BanReason::is_recoverable).unwrap_or(false) {
                    peer.state = PeerState::Idle;
                    peer.ban_reason = None;
                }
            }
        }
    }

    /// Records the peer's wire identity once known (post-handshake).
    pub fn set_identity(&mut self, addr: &SocketAddr, peer_id: PeerId, client_name: Option<String>) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.peer_id = Some(peer_id);
            peer.client_name = client_name;
        }
    }

    /// The exponential backoff delay, in seconds, for `failures` consecutive
    /// failures of a given kind, capped at [`MAX_BACKOFF`].
    fn backoff_delay(failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let secs = 2u64.saturating_pow(failures.min(63));
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    /// Whether `peer` is currently excluded from connect candidates: banned,
    /// already connecting/connected, or still within a backoff window.
    fn is_connectable(peer: &SwarmPeer, now: Instant) -> bool {
        match peer.state {
            PeerState::Connecting | PeerState::Connected | PeerState::Banned => return false,
            PeerState::Idle | PeerState::Failed => {}
        }
        if let Some(last_disconnect) = peer.last_disconnect {
            let elapsed = now.saturating_duration_since(last_disconnect);
            let dial_backoff = Self::backoff_delay(peer.connect_failures);
            let quick_disconnect_backoff = Self::backoff_delay(peer.quick_disconnects);
            if elapsed < dial_backoff || elapsed < quick_disconnect_backoff {
                return false;
            }
        }
        true
    }

    /// Selects up to `n` addresses eligible to be dialed right now,
    /// excluding banned, already-connecting/connected and backed-off peers.
    pub fn get_connectable_peers(&self, n: usize, now: Instant) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, peer)| Self::is_connectable(peer, now))
            .map(|(&addr, _)| addr)
            .take(n)
            .collect()
    }

    /// The number of peers currently in the `connected` state.
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn add_peer_is_idempotent_and_does_not_reset_state() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        swarm.add_peer(a, PeerSource::Tracker);
        swarm.mark_connecting(&a);
        swarm.add_peer(a, PeerSource::Dht);
        assert_eq!(swarm.get(&a).unwrap().state, PeerState::Connecting);
    }

    #[test]
    fn banned_peer_is_never_connectable() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        swarm.add_peer(a, PeerSource::Tracker);
        swarm.ban(&a, BanReason::CorruptData);
        let now = Instant::now();
        assert!(swarm.get_connectable_peers(10, now).is_empty());
    }

    #[test]
    fn unban_recoverable_lifts_protocol_error_bans_only() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        let b = addr(2);
        swarm.add_peer(a, PeerSource::Tracker);
        swarm.add_peer(b, PeerSource::Tracker);
        swarm.ban(&a, BanReason::ProtocolError);
        swarm.ban(&b, BanReason::CorruptData);
        swarm.unban_recoverable();
        assert_eq!(swarm.get(&a).unwrap().state, PeerState::Idle);
        assert_eq!(swarm.get(&b).unwrap().state, PeerState::Banned);
    }

    #[test]
    fn failed_dial_backs_off_exponentially() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        swarm.add_peer(a, PeerSource::Tracker);
        let now = Instant::now();
        swarm.mark_connect_failed(&a, now);
        // 2^1 = 2s backoff; not yet elapsed
        assert!(swarm.get_connectable_peers(10, now + Duration::from_secs(1)).is_empty());
        assert_eq!(
            swarm.get_connectable_peers(10, now + Duration::from_secs(3)),
            vec![a]
        );
    }

    #[test]
    fn quick_disconnect_increments_counter_long_connection_resets_it() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        swarm.add_peer(a, PeerSource::Tracker);
        let now = Instant::now();
        swarm.mark_connected(&a, now);
        swarm.mark_disconnected(&a, now + Duration::from_secs(5));
        assert_eq!(swarm.get(&a).unwrap().quick_disconnects, 1);

        swarm.mark_connected(&a, now + Duration::from_secs(100));
        swarm.mark_disconnected(&a, now + Duration::from_secs(200));
        assert_eq!(swarm.get(&a).unwrap().quick_disconnects, 0);
    }

    #[test]
    fn connecting_and_connected_peers_are_excluded_from_candidates() {
        let mut swarm = Swarm::new();
        let a = addr(1);
        let b = addr(2);
        swarm.add_peer(a, PeerSource::Tracker);
        swarm.add_peer(b, PeerSource::Tracker);
        let now = Instant::now();
        swarm.mark_connecting(&a);
        swarm.mark_connected(&b, now);
        assert!(swarm.get_connectable_peers(10, now).is_empty());
    }
}
