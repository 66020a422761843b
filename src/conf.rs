//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id used by this engine.
pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CLIENT_ID,
                download_rate_limit: None,
                upload_rate_limit: None,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself, shared across every torrent
/// it runs.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// Caps the combined download rate of all torrents, in bytes/s. `None`
    /// means unlimited.
    pub download_rate_limit: Option<u64>,
    /// Caps the combined upload rate of all torrents, in bytes/s. `None`
    /// means unlimited.
    pub upload_rate_limit: Option<u64>,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every hour.
    pub announce_interval: Duration,

    /// After this many consecutive announce failures a tracker's retry delay
    /// is doubled (capped, see [`Self::tracker_max_retry_interval`]).
    pub tracker_error_threshold: usize,

    /// The ceiling a tracker's exponential retry backoff is capped at.
    pub tracker_max_retry_interval: Duration,

    /// Timeout for a single tracker announce round trip.
    pub tracker_timeout: Duration,

    /// Maximum number of blocks a peer connection may keep outstanding
    /// (requested but not yet received) to a single peer.
    pub max_pipeline_len: usize,

    /// Maximum number of queued, not-yet-served upload requests a peer
    /// connection accepts before the connection is dropped.
    pub max_upload_queue_len: usize,

    /// Maximum number of pieces that may be concurrently in progress
    /// (buffered, partially downloaded) at once.
    pub max_active_pieces: usize,

    /// Maximum total bytes buffered in in-progress piece downloads.
    pub max_buffered_bytes: u64,

    /// How often the active piece manager scans for stale, abandoned piece
    /// downloads.
    pub active_piece_cleanup_interval: Duration,

    /// A piece with no activity for this long, and no received blocks, is
    /// considered abandoned and its buffer is freed.
    pub active_piece_stale_timeout: Duration,

    /// A single outstanding block request older than this is considered
    /// lost and becomes eligible for re-request (from any peer).
    pub block_request_timeout: Duration,

    /// How often the unchoke algorithm and download optimizer run.
    pub choke_interval: Duration,

    /// How often the optimistic unchoke slot is rotated.
    pub optimistic_unchoke_interval: Duration,

    /// The number of peers we may have unchoked for upload at once,
    /// including the optimistic slot.
    pub max_upload_slots: usize,

    /// A peer connected for less than this is given extra weight when being
    /// considered for the optimistic unchoke slot.
    pub new_peer_threshold: Duration,

    /// A choking peer from which we've received no data for this long is a
    /// candidate for disconnection.
    pub choked_peer_timeout: Duration,

    /// The minimum connection age before the "too slow" drop rule applies.
    pub min_connection_age: Duration,

    /// The minimum sustained download rate (bytes/s) below which the "too
    /// slow" drop rule applies.
    pub min_peer_speed: u64,

    /// A peer whose download rate is below this fraction of the average
    /// across all peers is a candidate for the "below average" drop rule.
    pub drop_below_average_ratio: f64,

    /// The engine never drops peers while fewer than this many are
    /// connected.
    pub min_peers_before_dropping: usize,

    /// Dial timeout for outbound peer connections.
    pub connect_timeout: Duration,

    /// Number of disk IO worker threads in the bounded disk queue.
    pub disk_worker_count: usize,

    /// Maximum number of whole pieces cached in memory for serving upload
    /// requests.
    pub read_cache_capacity: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            tracker_max_retry_interval: Duration::from_secs(15 * 60),
            tracker_timeout: Duration::from_secs(20),
            max_pipeline_len: 16,
            max_upload_queue_len: 256,
            max_active_pieces: 32,
            max_buffered_bytes: 32 * 1024 * 1024,
            active_piece_cleanup_interval: Duration::from_secs(10),
            active_piece_stale_timeout: Duration::from_secs(60),
            block_request_timeout: Duration::from_secs(30),
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            max_upload_slots: 4,
            new_peer_threshold: Duration::from_secs(60),
            choked_peer_timeout: Duration::from_secs(60),
            min_connection_age: Duration::from_secs(15),
            min_peer_speed: 1024,
            drop_below_average_ratio: 0.2,
            min_peers_before_dropping: 4,
            connect_timeout: Duration::from_secs(15),
            disk_worker_count: 4,
            read_cache_capacity: 32,
        }
    }
}
