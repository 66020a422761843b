//! The top-level handle the host application owns: creates and tears down
//! torrents, holds the resources every torrent shares (the disk actor, the
//! global rate limiters), and routes inbound connections to the torrent
//! they belong to.
//!
//! Unlike `Torrent` or the disk actor, `Engine` isn't itself a spawned task
//! behind a channel -- the host is expected to own exactly one and call its
//! methods directly. The state it guards (the torrent table) is only ever
//! touched synchronously from those calls; the only background work it
//! spawns is the inbound connection listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::conf::{Conf, TorrentConf};
use crate::disk::DiskHandle;
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::rate_limiter::TokenBucket;
use crate::torrent::{Alert, Torrent, TorrentHandle};
use crate::tracker::Tracker;
use crate::{FileIndex, Sha1Hash, TorrentId};

/// How long the inbound connection router waits for a full handshake header
/// to arrive before giving up and dropping the connection.
const HANDSHAKE_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait between unsuccessful peeks at a still-arriving
/// handshake.
const HANDSHAKE_PEEK_RETRY: Duration = Duration::from_millis(20);

/// Byte offset and length of the info hash within the 68 byte handshake
/// (1 pstrlen + 19 pstr + 8 reserved bytes precede it).
const INFO_HASH_OFFSET: usize = 28;
const HANDSHAKE_PEEK_LEN: usize = 48;

struct TorrentEntry {
    handle: TorrentHandle,
    info_hash: Sha1Hash,
}

/// Owns every running torrent, the shared disk actor and the global
/// download/upload rate limiters, and (once [`Engine::listen`] is called)
/// the inbound connection listener that routes accepted sockets to the
/// torrent whose info hash they present.
pub struct Engine {
    conf: Arc<Conf>,
    disk: DiskHandle,
    download_limiter: Arc<StdMutex<TokenBucket>>,
    upload_limiter: Arc<StdMutex<TokenBucket>>,
    torrents: HashMap<TorrentId, TorrentEntry>,
    routes: Arc<StdMutex<HashMap<Sha1Hash, TorrentHandle>>>,
    listen_port: u16,
}

impl Engine {
    /// Creates a new engine and spawns its shared disk actor. Does not
    /// start listening for inbound connections -- call [`Self::listen`]
    /// separately once the host knows which address to bind.
    pub fn new(conf: Conf) -> Self {
        let now = Instant::now();
        let download_limiter = Arc::new(StdMutex::new(rate_limiter_for(
            conf.engine.download_rate_limit,
            now,
        )));
        let upload_limiter = Arc::new(StdMutex::new(rate_limiter_for(
            conf.engine.upload_rate_limit,
            now,
        )));
        let disk = DiskHandle::spawn(conf.torrent.disk_worker_count);

        Self {
            conf: Arc::new(conf),
            disk,
            download_limiter,
            upload_limiter,
            torrents: HashMap::new(),
            routes: Arc::new(StdMutex::new(HashMap::new())),
            listen_port: 0,
        }
    }

    /// Binds a TCP listener on `addr` and spawns the background task that
    /// accepts inbound connections and routes them by the info hash in
    /// their handshake. Returns the address actually bound (useful when
    /// `addr`'s port is 0). Every torrent added after this call announces
    /// the bound port to its trackers.
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        self.listen_port = bound.port();
        tokio::spawn(run_listener(listener, self.routes.clone()));
        Ok(bound)
    }

    /// Adds and starts a new torrent, using the engine's default torrent
    /// configuration unless `conf` overrides it. Returns the torrent's
    /// assigned id and the alert stream it reports progress on.
    pub fn add_torrent(
        &mut self,
        metainfo: Metainfo,
        trackers: Vec<Box<dyn Tracker>>,
        conf: Option<TorrentConf>,
    ) -> (TorrentId, mpsc::UnboundedReceiver<Alert>) {
        let id = self.next_torrent_id();
        let info_hash = metainfo.info_hash;
        let torrent_conf = conf.unwrap_or_else(|| self.conf.torrent.clone());

        let (handle, alerts) = Torrent::spawn(
            id,
            &metainfo,
            self.conf.engine.client_id,
            self.listen_port,
            torrent_conf,
            self.disk.clone(),
            trackers,
            self.download_limiter.clone(),
            self.upload_limiter.clone(),
        );

        self.routes.lock().unwrap().insert(info_hash, handle.clone());
        self.torrents.insert(id, TorrentEntry { handle: handle.clone(), info_hash });
        handle.start();

        (id, alerts)
    }

    /// Stops and removes a torrent, unregistering it from inbound routing.
    /// A no-op, with a warning logged, if `id` isn't a known torrent.
    pub fn remove_torrent(&mut self, id: TorrentId) {
        match self.torrents.remove(&id) {
            Some(entry) => {
                entry.handle.stop();
                entry.handle.shutdown();
                self.routes.lock().unwrap().remove(&entry.info_hash);
            }
            None => log::warn!("remove_torrent: no such torrent {}", id),
        }
    }

    pub fn start_torrent(&self, id: TorrentId) {
        self.with_handle(id, |handle| handle.start());
    }

    pub fn stop_torrent(&self, id: TorrentId) {
        self.with_handle(id, |handle| handle.stop());
    }

    /// Adds a single peer address supplied directly by the host (e.g. a
    /// magnet link's peer hints), as opposed to one learned from a
    /// tracker.
    pub fn add_peer(&self, id: TorrentId, addr: SocketAddr) {
        self.with_handle(id, |handle| handle.manually_add_peer(addr));
    }

    pub fn add_peer_hints(&self, id: TorrentId, addrs: Vec<SocketAddr>) {
        self.with_handle(id, |handle| handle.add_peer_hints(addrs));
    }

    pub fn set_file_priority(&self, id: TorrentId, file_index: FileIndex, priority: u8) {
        self.with_handle(id, |handle| handle.set_file_priority(file_index, priority));
    }

    /// Re-verifies a torrent's on-disk data against its piece hashes,
    /// reporting `Alert::PieceVerified`/`Alert::PieceHashMismatch` for each
    /// piece and `Alert::RecheckComplete` once done.
    pub fn recheck_torrent_data(&self, id: TorrentId) {
        self.with_handle(id, |handle| handle.recheck_data());
    }

    /// The ids of every torrent currently registered with the engine.
    pub fn torrent_ids(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    /// Stops and shuts down every running torrent and the shared disk
    /// actor. The engine is unusable afterwards.
    pub fn shutdown(&mut self) {
        for (_, entry) in self.torrents.drain() {
            entry.handle.stop();
            entry.handle.shutdown();
        }
        self.routes.lock().unwrap().clear();
        self.disk.destroy();
    }

    fn with_handle(&self, id: TorrentId, f: impl FnOnce(&TorrentHandle)) {
        match self.torrents.get(&id) {
            Some(entry) => f(&entry.handle),
            None => log::warn!("no such torrent {}", id),
        }
    }

    fn next_torrent_id(&self) -> TorrentId {
        loop {
            let id = rand::random::<TorrentId>();
            if !self.torrents.contains_key(&id) {
                return id;
            }
        }
    }
}

fn rate_limiter_for(rate: Option<u64>, now: Instant) -> TokenBucket {
    match rate {
        Some(rate) => TokenBucket::new(rate, now),
        None => TokenBucket::unlimited(now),
    }
}

/// Accepts inbound connections and routes each to the torrent whose info
/// hash its handshake names, dropping connections that never complete a
/// handshake or don't match any registered torrent.
async fn run_listener(
    listener: TcpListener,
    routes: Arc<StdMutex<HashMap<Sha1Hash, TorrentHandle>>>,
) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("listener accept error: {}", e);
                continue;
            }
        };

        let routes = routes.clone();
        tokio::spawn(async move {
            let info_hash = match peek_info_hash(&socket).await {
                Some(hash) => hash,
                None => {
                    log::debug!("{} never completed a handshake, dropping", addr);
                    return;
                }
            };
            let handle = routes.lock().unwrap().get(&info_hash).cloned();
            match handle {
                Some(handle) => handle.accept(socket, addr),
                None => log::debug!(
                    "{} requested unknown torrent, dropping connection",
                    addr
                ),
            }
        });
    }
}

/// Peeks the inbound socket's handshake without consuming it, so the
/// session actor that ends up owning the connection still sees the
/// handshake bytes when it performs its own read.
async fn peek_info_hash(socket: &TcpStream) -> Option<Sha1Hash> {
    let mut buf = [0u8; HANDSHAKE_PEEK_LEN];
    let deadline = Instant::now() + HANDSHAKE_PEEK_TIMEOUT;
    loop {
        match socket.peek(&mut buf).await {
            Ok(n) if n >= HANDSHAKE_PEEK_LEN => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&buf[INFO_HASH_OFFSET..HANDSHAKE_PEEK_LEN]);
                return Some(hash);
            }
            Ok(_) => {
                if Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(HANDSHAKE_PEEK_RETRY).await;
            }
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use sha1::{Digest, Sha1};
    use tempfile::tempdir;

    use super::*;
    use crate::tracker::{AnnounceRequest, AnnounceResponse};

    struct NullTracker;

    impl Tracker for NullTracker {
        fn url(&self) -> &str {
            "null://test"
        }

        fn announce(
            &self,
            _req: AnnounceRequest,
        ) -> Pin<Box<dyn Future<Output = crate::error::Result<AnnounceResponse>> + Send>> {
            Box::pin(async move {
                Ok(AnnounceResponse {
                    interval: Duration::from_secs(60 * 60),
                    min_interval: None,
                    peers: Vec::new(),
                })
            })
        }
    }

    #[derive(Serialize)]
    struct TestInfo {
        name: String,
        #[serde(with = "serde_bytes")]
        pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        piece_length: u64,
        length: Option<u64>,
    }

    #[derive(Serialize)]
    struct TestMetainfo {
        info: TestInfo,
        announce: Option<String>,
    }

    fn single_piece_metainfo(data: &[u8]) -> Metainfo {
        let mut hasher = Sha1::new();
        hasher.input(data);
        let digest = hasher.result();

        let raw = TestMetainfo {
            info: TestInfo {
                name: "test.bin".to_owned(),
                pieces: digest.to_vec(),
                piece_length: data.len() as u64,
                length: Some(data.len() as u64),
            },
            announce: Some("http://tracker.example/announce".to_owned()),
        };
        let buf = serde_bencode::to_bytes(&raw).unwrap();
        Metainfo::from_bytes(&buf).unwrap()
    }

    fn test_engine(dir: &std::path::Path) -> Engine {
        Engine::new(Conf::new(dir))
    }

    #[test]
    fn next_torrent_id_avoids_collisions() {
        let dir = tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let metainfo = single_piece_metainfo(&[1u8; 16]);
        let (first, _alerts) =
            engine.add_torrent(metainfo.clone(), vec![Box::new(NullTracker)], None);
        let (second, _alerts) = engine.add_torrent(metainfo, vec![Box::new(NullTracker)], None);
        assert_ne!(first, second);
        assert_eq!(engine.torrent_ids().len(), 2);
    }

    #[tokio::test]
    async fn add_torrent_starts_it_and_emits_started() {
        let dir = tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let metainfo = single_piece_metainfo(&[2u8; 16]);

        let (id, mut alerts) = engine.add_torrent(metainfo, vec![Box::new(NullTracker)], None);
        assert!(matches!(alerts.recv().await.unwrap(), Alert::Started));
        assert_eq!(engine.torrent_ids(), vec![id]);
    }

    #[tokio::test]
    async fn remove_torrent_drops_it_from_inbound_routing() {
        let dir = tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let metainfo = single_piece_metainfo(&[3u8; 16]);
        let info_hash = metainfo.info_hash;

        let (id, _alerts) = engine.add_torrent(metainfo, vec![Box::new(NullTracker)], None);
        assert!(engine.routes.lock().unwrap().contains_key(&info_hash));

        engine.remove_torrent(id);
        assert!(engine.torrent_ids().is_empty());
        assert!(!engine.routes.lock().unwrap().contains_key(&info_hash));
    }

    #[tokio::test]
    async fn listen_binds_the_requested_address() {
        let dir = tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let bound = engine
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(bound.ip().to_string(), "127.0.0.1");
        assert_ne!(bound.port(), 0);
    }
}
