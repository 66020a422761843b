//! Tit-for-tat + optimistic unchoke algorithm and the companion download
//! optimizer that recommends dropping under-performing peers.
//!
//! Driven by `TorrentConf`'s tunables (`choke_interval`,
//! `optimistic_unchoke_interval`, `max_upload_slots`, `new_peer_threshold`,
//! `choked_peer_timeout`, `min_connection_age`, `min_peer_speed`,
//! `drop_below_average_ratio`, `min_peers_before_dropping`). Built in the
//! same plain-struct, `Duration`-tick idiom the rest of the crate uses (see
//! `rate_limiter::TokenBucket`, `counter::ThroughputCounter`), including the
//! same "caller supplies `now`/randomness" testability discipline.

use std::net::SocketAddr;
use std::time::Instant;

use crate::conf::TorrentConf;

/// A read-only snapshot of one connected peer's state, as `Torrent` gathers
/// it from its live `PeerSession`s before invoking the coordinator. The
/// coordinator never holds a reference to the peer itself.
#[derive(Clone, Debug)]
pub(crate) struct PeerSnapshot {
    pub addr: SocketAddr,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub peer_choking: bool,
    pub download_rate: u64,
    pub connected_at: Instant,
    pub last_data_received: Option<Instant>,
}

/// Whether an unchoke decision is un-choking or (re-)choking the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnchokeAction {
    Choke,
    Unchoke,
}

/// Why an unchoke decision was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnchokeReason {
    TitForTat,
    Optimistic,
    /// The peer was unchoked previously but lost its slot to a better
    /// candidate this round.
    Replaced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UnchokeDecision {
    pub addr: SocketAddr,
    pub action: UnchokeAction,
    pub reason: UnchokeReason,
}

/// Why the download optimizer recommends dropping a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DropReason {
    ChokedTimeout,
    TooSlow,
    BelowAverage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DropDecision {
    pub addr: SocketAddr,
    pub reason: DropReason,
}

/// Runs the unchoke algorithm and the download optimizer in a fixed order,
/// and remembers which peer currently holds the rotating optimistic unchoke
/// slot.
pub(crate) struct PeerCoordinator {
    optimistic: Option<SocketAddr>,
    last_optimistic_rotation: Option<Instant>,
}

impl PeerCoordinator {
    pub fn new() -> Self {
        Self {
            optimistic: None,
            last_optimistic_rotation: None,
        }
    }

    /// Runs one evaluation tick: the unchoke algorithm (which peers get
    /// upload slots) followed by the download optimizer (which peers are
    /// recommended for disconnection).
    ///
    /// `rng` is a caller-supplied value in `[0, 1)` used to weight the
    /// optimistic unchoke pick -- kept as an explicit parameter (rather
    /// than calling into `rand` here) so the selection is deterministic and
    /// testable, mirroring the rest of the crate's "caller supplies `now`"
    /// discipline.
    pub fn tick(
        &mut self,
        peers: &[PeerSnapshot],
        conf: &TorrentConf,
        now: Instant,
        rng: f64,
        skip_speed_checks: bool,
        has_replacement_candidates: bool,
    ) -> (Vec<UnchokeDecision>, Vec<DropDecision>) {
        let protected = self.unchoke_protected_set(peers, conf, now, rng);
        let unchokes = self.unchoke_decisions(peers, &protected);
        let drops = self.download_optimizer(
            peers,
            conf,
            now,
            &protected,
            skip_speed_checks,
            has_replacement_candidates,
        );
        (unchokes, drops)
    }

    /// Computes the set of peers that should hold an upload slot this
    /// round: the top `maxUploadSlots - 1` interested peers by download
    /// rate (tit-for-tat), plus one optimistic pick.
    fn unchoke_protected_set(
        &mut self,
        peers: &[PeerSnapshot],
        conf: &TorrentConf,
        now: Instant,
        rng: f64,
    ) -> Vec<(SocketAddr, UnchokeReason)> {
        let mut interested: Vec<&PeerSnapshot> =
            peers.iter().filter(|p| p.peer_interested).collect();
        interested.sort_by(|a, b| b.download_rate.cmp(&a.download_rate));

        let tit_for_tat_count = conf.max_upload_slots.saturating_sub(1);
        let tit_for_tat: Vec<SocketAddr> = interested
            .iter()
            .take(tit_for_tat_count)
            .map(|p| p.addr)
            .collect();

        let needs_rotation = self
            .last_optimistic_rotation
            .map(|t| now.saturating_duration_since(t) >= conf.optimistic_unchoke_interval)
            .unwrap_or(true);
        let optimistic_still_valid = self.optimistic.map_or(false, |addr| {
            !tit_for_tat.contains(&addr)
                && peers.iter().any(|p| p.addr == addr && p.peer_interested)
        });

        if needs_rotation || !optimistic_still_valid {
            let candidates: Vec<&PeerSnapshot> = interested
                .iter()
                .filter(|p| !tit_for_tat.contains(&p.addr))
                .copied()
                .collect();
            self.optimistic = Self::pick_weighted(&candidates, conf, now, rng);
            self.last_optimistic_rotation = Some(now);
        }

        let mut protected: Vec<(SocketAddr, UnchokeReason)> = tit_for_tat
            .into_iter()
            .map(|addr| (addr, UnchokeReason::TitForTat))
            .collect();
        if let Some(addr) = self.optimistic {
            protected.push((addr, UnchokeReason::Optimistic));
        }
        protected
    }

    /// Weighted-random pick among optimistic-slot candidates: peers younger
    /// than `new_peer_threshold` get weight 3, older peers weight 1.
    fn pick_weighted(
        candidates: &[&PeerSnapshot],
        conf: &TorrentConf,
        now: Instant,
        rng: f64,
    ) -> Option<SocketAddr> {
        if candidates.is_empty() {
            return None;
        }
        let weight = |p: &&PeerSnapshot| -> u32 {
            if now.saturating_duration_since(p.connected_at) < conf.new_peer_threshold {
                3
            } else {
                1
            }
        };
        let total_weight: u32 = candidates.iter().map(weight).sum();
        let target = rng.clamp(0.0, 0.999_999) * total_weight as f64;
        let mut cumulative = 0u32;
        for p in candidates {
            cumulative += weight(p);
            if target < cumulative as f64 {
                return Some(p.addr);
            }
        }
        candidates.last().map(|p| p.addr)
    }

    /// Turns the protected set into concrete choke/unchoke actions: protected
    /// peers currently choked are unchoked; previously-unchoked peers that
    /// fell out of the protected set are choked with reason `replaced`.
    fn unchoke_decisions(
        &self,
        peers: &[PeerSnapshot],
        protected: &[(SocketAddr, UnchokeReason)],
    ) -> Vec<UnchokeDecision> {
        let mut decisions = Vec::new();
        for &(addr, reason) in protected {
            if let Some(peer) = peers.iter().find(|p| p.addr == addr) {
                if peer.am_choking {
                    decisions.push(UnchokeDecision {
                        addr,
                        action: UnchokeAction::Unchoke,
                        reason,
                    });
                }
            }
        }
        for peer in peers {
            if !peer.am_choking && !protected.iter().any(|(addr, _)| *addr == peer.addr) {
                decisions.push(UnchokeDecision {
                    addr: peer.addr,
                    action: UnchokeAction::Choke,
                    reason: UnchokeReason::Replaced,
                });
            }
        }
        decisions
    }

    /// Evaluates the three independent drop rules, applying the guards:
    /// never drop a protected peer, never drop below the minimum connected
    /// count, never drop with no replacement candidates, suppress speed
    /// rules while rate-limited.
    fn download_optimizer(
        &self,
        peers: &[PeerSnapshot],
        conf: &TorrentConf,
        now: Instant,
        protected: &[(SocketAddr, UnchokeReason)],
        skip_speed_checks: bool,
        has_replacement_candidates: bool,
    ) -> Vec<DropDecision> {
        if peers.len() < conf.min_peers_before_dropping || !has_replacement_candidates {
            return Vec::new();
        }

        let avg_rate = if peers.is_empty() {
            0.0
        } else {
            peers.iter().map(|p| p.download_rate as f64).sum::<f64>() / peers.len() as f64
        };

        let mut drops = Vec::new();
        for peer in peers {
            if protected.iter().any(|(addr, _)| *addr == peer.addr) {
                continue;
            }

            let choked_timeout = peer.peer_choking
                && peer
                    .last_data_received
                    .map(|t| now.saturating_duration_since(t) >= conf.choked_peer_timeout)
                    .unwrap_or(true);
            if choked_timeout {
                drops.push(DropDecision {
                    addr: peer.addr,
                    reason: DropReason::ChokedTimeout,
                });
                continue;
            }

            if skip_speed_checks {
                continue;
            }

            let age = now.saturating_duration_since(peer.connected_at);
            if age >= conf.min_connection_age && peer.download_rate < conf.min_peer_speed {
                drops.push(DropDecision {
                    addr: peer.addr,
                    reason: DropReason::TooSlow,
                });
                continue;
            }

            if (peer.download_rate as f64) < conf.drop_below_average_ratio * avg_rate {
                drops.push(DropDecision {
                    addr: peer.addr,
                    reason: DropReason::BelowAverage,
                });
            }
        }
        drops
    }
}
