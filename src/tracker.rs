//! The external tracker collaborator and the per-torrent scheduler that
//! multiplexes announces across every tracker URL a torrent knows about.
//!
//! The wire format (HTTP/UDP tracker protocol) is left to the host;
//! [`Tracker`] is the seam a host implementation plugs into, the one
//! external collaborator trait this crate defines. `TrackerManager` owns
//! only the scheduling state -- announce intervals, backoff,
//! de-duplication -- the `TorrentConf` fields
//! (`tracker_error_threshold`, `tracker_max_retry_interval`,
//! `announce_interval`) already anticipate.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::{PeerId, Sha1Hash};

/// The announce event accompanying a tracker request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    None,
    Completed,
    Stopped,
}

/// What a torrent reports about itself in an announce request.
#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub num_want: Option<usize>,
}

/// What a tracker hands back.
#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

/// A future-returning boxed trait object, since this crate's dependency
/// stack (no `async-trait`) predates `async fn` in traits.
pub type AnnounceFuture = Pin<Box<dyn Future<Output = Result<AnnounceResponse>> + Send>>;

/// The engine-facing contract a host implements for each tracker protocol
/// (HTTP, UDP, ...). The engine only ever calls `announce`; it neither
/// parses nor constructs the wire format itself.
pub trait Tracker: Send + Sync {
    /// The tracker's announce URL, used for logging and de-duplication.
    fn url(&self) -> &str;

    /// Sends an announce request and returns the tracker's response.
    fn announce(&self, req: AnnounceRequest) -> AnnounceFuture;
}

/// Per-tracker scheduling state: when to next announce, and how far behind
/// its retry backoff currently is.
struct TrackerWorker {
    tracker: Box<dyn Tracker>,
    interval: Duration,
    min_interval: Option<Duration>,
    consecutive_failures: u32,
    retry_delay: Duration,
    next_announce_at: Instant,
}

impl TrackerWorker {
    fn new(tracker: Box<dyn Tracker>, default_interval: Duration, now: Instant) -> Self {
        Self {
            tracker,
            interval: default_interval,
            min_interval: None,
            consecutive_failures: 0,
            retry_delay: default_interval,
            next_announce_at: now,
        }
    }

    fn due(&self, now: Instant) -> bool {
        now >= self.next_announce_at
    }
}

/// Multiplexes announces across every tracker a torrent has, de-duplicating
/// the peer addresses they collectively return before handing them to the
/// [`crate::swarm::Swarm`].
pub(crate) struct TrackerManager {
    workers: Vec<TrackerWorker>,
    error_threshold: u32,
    max_retry_interval: Duration,
    default_interval: Duration,
}

impl TrackerManager {
    pub fn new(
        trackers: Vec<Box<dyn Tracker>>,
        default_interval: Duration,
        error_threshold: u32,
        max_retry_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            workers: trackers
                .into_iter()
                .map(|t| TrackerWorker::new(t, default_interval, now))
                .collect(),
            error_threshold,
            max_retry_interval,
            default_interval,
        }
    }

    /// Announces to every tracker regardless of schedule, as happens on
    /// torrent start (`event=started`) and stop (`event=stopped`).
    pub async fn announce_all(
        &mut self,
        base_req: AnnounceRequest,
        now: Instant,
    ) -> Vec<SocketAddr> {
        let mut peers = HashSet::new();
        for worker in &mut self.workers {
            let req = AnnounceRequest {
                event: base_req.event,
                ..base_req.clone()
            };
            match worker.tracker.announce(req).await {
                Ok(resp) => {
                    worker.interval = resp.interval;
                    worker.min_interval = resp.min_interval;
                    worker.consecutive_failures = 0;
                    worker.retry_delay = self.default_interval;
                    worker.next_announce_at = now + worker.interval;
                    peers.extend(resp.peers);
                }
                Err(e) => {
                    log::warn!("tracker {} announce failed: {}", worker.tracker.url(), e);
                    worker.consecutive_failures += 1;
                    if worker.consecutive_failures >= self.error_threshold {
                        worker.retry_delay =
                            (worker.retry_delay * 2).min(self.max_retry_interval);
                    }
                    worker.next_announce_at = now + worker.retry_delay;
                }
            }
        }
        peers.into_iter().collect()
    }

    /// Announces only to trackers whose schedule is currently due, honoring
    /// each tracker's reported `min_interval`. Used for the regular
    /// `event=none` re-announce cadence.
    pub async fn announce_due(
        &mut self,
        base_req: AnnounceRequest,
        now: Instant,
    ) -> Vec<SocketAddr> {
        let mut peers = HashSet::new();
        for worker in &mut self.workers {
            if !worker.due(now) {
                continue;
            }
            let req = AnnounceRequest {
                event: TrackerEvent::None,
                ..base_req.clone()
            };
            match worker.tracker.announce(req).await {
                Ok(resp) => {
                    let interval = worker
                        .min_interval
                        .map(|min| resp.interval.max(min))
                        .unwrap_or(resp.interval);
                    worker.interval = interval;
                    worker.min_interval = resp.min_interval;
                    worker.consecutive_failures = 0;
                    worker.retry_delay = self.default_interval;
                    worker.next_announce_at = now + interval;
                    peers.extend(resp.peers);
                }
                Err(e) => {
                    log::warn!("tracker {} announce failed: {}", worker.tracker.url(), e);
                    worker.consecutive_failures += 1;
                    if worker.consecutive_failures >= self.error_threshold {
                        worker.retry_delay =
                            (worker.retry_delay * 2).min(self.max_retry_interval);
                    }
                    worker.next_announce_at = now + worker.retry_delay;
                }
            }
        }
        peers.into_iter().collect()
    }
}
