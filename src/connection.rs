//! Slot filling and dial-timeout bookkeeping for outbound peer connections.
//!
//! `ConnectionManager` doesn't own sockets itself -- dialing and the
//! resulting `PeerSession` task are `Torrent`'s job (see `torrent.rs`), which
//! exclusively owns each peer connection. This module only decides *how
//! many* and *which* addresses to dial next, and tracks in-flight dials so
//! `Torrent` knows when to time one out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Tracks how many outbound connection slots are available and which
/// addresses are currently being dialed, so the maintenance loop can fill
/// slots from the swarm's connect candidates without exceeding configured
/// caps or losing track of stalled dials.
pub(crate) struct ConnectionManager {
    max_connected: usize,
    min_desired: usize,
    connect_timeout: Duration,
    /// Addresses currently being dialed, with the instant the dial started.
    pending: HashMap<SocketAddr, Instant>,
}

impl ConnectionManager {
    pub fn new(max_connected: usize, min_desired: usize, connect_timeout: Duration) -> Self {
        Self {
            max_connected,
            min_desired,
            connect_timeout,
            pending: HashMap::new(),
        }
    }

    /// The number of additional connections wanted right now, given
    /// `connected_count` already-established connections. Takes in-flight
    /// dials into account so the maintenance loop doesn't over-dial while
    /// previous attempts are still outstanding.
    pub fn slots_to_fill(&self, connected_count: usize) -> usize {
        let committed = connected_count + self.pending.len();
        self.max_connected.saturating_sub(committed)
    }

    /// Whether the swarm should be queried at all -- an optimization
    /// mirroring `min_requested_peer_count`: don't bother filling slots
    /// while we're already comfortably above the minimum desired count.
    pub fn wants_more_peers(&self, connected_count: usize) -> bool {
        connected_count + self.pending.len() < self.min_desired
            || connected_count + self.pending.len() < self.max_connected
    }

    /// Records that a dial to `addr` has begun.
    pub fn begin_dial(&mut self, addr: SocketAddr, now: Instant) {
        self.pending.insert(addr, now);
    }

    /// Records that a dial to `addr` has concluded (successfully or not).
    pub fn end_dial(&mut self, addr: &SocketAddr) {
        self.pending.remove(addr);
    }

    /// Returns every address whose dial has been outstanding longer than
    /// the configured connect timeout, removing them from the pending set
    /// (the caller is expected to abort those dial futures).
    pub fn take_timed_out_dials(&mut self, now: Instant) -> Vec<SocketAddr> {
        let expired: Vec<SocketAddr> = self
            .pending
            .iter()
            .filter(|(_, &started)| now.saturating_duration_since(started) >= self.connect_timeout)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in &expired {
            self.pending.remove(addr);
        }
        expired
    }

    /// The number of dials currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn slots_to_fill_accounts_for_pending_dials() {
        let mut cm = ConnectionManager::new(10, 5, Duration::from_secs(15));
        assert_eq!(cm.slots_to_fill(3), 7);
        cm.begin_dial(addr(1), Instant::now());
        cm.begin_dial(addr(2), Instant::now());
        assert_eq!(cm.slots_to_fill(3), 5);
    }

    #[test]
    fn wants_more_peers_below_minimum_even_if_dials_pending() {
        let cm = ConnectionManager::new(50, 10, Duration::from_secs(15));
        assert!(cm.wants_more_peers(3));
    }

    #[test]
    fn dial_timeout_is_detected_and_clears_pending_entry() {
        let mut cm = ConnectionManager::new(10, 5, Duration::from_secs(15));
        let now = Instant::now();
        cm.begin_dial(addr(1), now);
        assert!(cm.take_timed_out_dials(now + Duration::from_secs(5)).is_empty());
        let expired = cm.take_timed_out_dials(now + Duration::from_secs(16));
        assert_eq!(expired, vec![addr(1)]);
        assert_eq!(cm.pending_count(), 0);
    }
}
