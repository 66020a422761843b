//! The per-torrent coordinator actor.
//!
//! Built around a `Command`/`TorrentHandle` mailbox envelope, one actor per
//! torrent. Block ingestion, hashing and the disk write are entirely
//! delegated to
//! [`crate::peer::session::PeerSession::handle_block`] -- `Torrent` only
//! reacts to the `Event`s a session reports once that work is done. What's
//! left for this actor is connection lifecycle (dialing, accepting, session
//! bookkeeping), the periodic maintenance tick (slot filling,
//! choke/unchoke, tracker announces, stale piece cleanup), and the handful
//! of decisions that genuinely need cross-peer state: rarest-first priority
//! bookkeeping, corrupt-peer banning, and completion detection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::conf::TorrentConf;
use crate::connection::ConnectionManager;
use crate::disk::DiskHandle;
use crate::download::ActivePieceManager;
use crate::error::{BanReason, Error};
use crate::metainfo::Metainfo;
use crate::peer::session::{PeerSession, Shared};
use crate::peer::{Command as PeerCommand, Event as PeerEvent, PeerInfo, Status};
use crate::peer_coordinator::{PeerCoordinator, PeerSnapshot, UnchokeAction};
use crate::piece_manager::{PieceManager, Priority};
use crate::rate_limiter::TokenBucket;
use crate::storage_info::{FsStructure, StorageInfo};
use crate::swarm::{PeerSource, Swarm};
use crate::tracker::{AnnounceRequest, Tracker, TrackerEvent, TrackerManager};
use crate::{FileIndex, PeerId, PieceIndex, Sha1Hash, TorrentId};

/// How often the maintenance tick (slot filling, choke/unchoke, tracker
/// re-announce, stale piece cleanup) runs.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// The number of times a single peer must supply the supermajority of a
/// corrupt piece's blocks before it's banned.
const CORRUPT_DATA_BAN_THRESHOLD: u32 = 2;

/// Commands `TorrentHandle` pushes into a running [`Torrent`] actor.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop,
    AddPeer(SocketAddr, PeerSource),
    AddPeerHints(Vec<SocketAddr>),
    SetFilePriority(FileIndex, u8),
    RecheckData,
    /// An inbound connection routed to this torrent by its info hash,
    /// handed over still unconsumed (the listener only peeked the
    /// handshake to determine the route).
    Accept(TcpStream, SocketAddr),
    Shutdown,
}

/// Notifications `Torrent` reports back up to whoever is holding its
/// [`TorrentHandle`] (normally [`crate::engine::Engine`]).
#[derive(Debug)]
pub enum Alert {
    Started,
    StartFailed(Error),
    Stopped,
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    PeerBanned { addr: SocketAddr, reason: BanReason },
    PieceVerified(PieceIndex),
    PieceHashMismatch(PieceIndex),
    Complete,
    RecheckComplete,
}

/// A cloneable front door to a running [`Torrent`] actor.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    id: TorrentId,
    commands: mpsc::UnboundedSender<Command>,
}

impl TorrentHandle {
    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn add_peer(&self, addr: SocketAddr, source: PeerSource) {
        let _ = self.commands.send(Command::AddPeer(addr, source));
    }

    /// Adds a single peer supplied directly by the user (e.g. a magnet
    /// hint), as distinct from one learned from a tracker/DHT/PEX.
    pub fn manually_add_peer(&self, addr: SocketAddr) {
        let _ = self.commands.send(Command::AddPeer(addr, PeerSource::Manual));
    }

    pub fn add_peer_hints(&self, addrs: Vec<SocketAddr>) {
        let _ = self.commands.send(Command::AddPeerHints(addrs));
    }

    pub fn set_file_priority(&self, file_index: FileIndex, priority: u8) {
        let _ = self.commands.send(Command::SetFilePriority(file_index, priority));
    }

    pub fn recheck_data(&self) {
        let _ = self.commands.send(Command::RecheckData);
    }

    pub fn accept(&self, socket: TcpStream, addr: SocketAddr) {
        let _ = self.commands.send(Command::Accept(socket, addr));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The torrent actor. Exactly one task runs `Torrent::run` for the
/// lifetime of a torrent; every other piece of the engine addresses it
/// only through [`TorrentHandle`]'s mailbox.
pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    own_id: PeerId,
    listen_port: u16,
    conf: Arc<TorrentConf>,
    storage_info: StorageInfo,
    piece_hashes: Vec<u8>,
    file_priorities: Vec<u8>,

    piece_manager: Arc<RwLock<PieceManager>>,
    active_pieces: Arc<RwLock<ActivePieceManager>>,
    disk: DiskHandle,

    swarm: Swarm,
    connection_manager: ConnectionManager,
    tracker_manager: TrackerManager,
    peer_coordinator: PeerCoordinator,

    shared: Arc<Shared>,
    sessions: HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>,
    peer_infos: HashMap<SocketAddr, PeerInfo>,
    peer_ids: HashMap<SocketAddr, PeerId>,
    /// Running per-peer count of hash-mismatch events in which that peer
    /// supplied the supermajority of a corrupt piece's blocks.
    mismatch_counts: HashMap<PeerId, u32>,

    commands_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
    events_rx: mpsc::UnboundedReceiver<(SocketAddr, PeerEvent)>,
    alerts: mpsc::UnboundedSender<Alert>,

    running: bool,
    complete: bool,
    last_choke_tick: Instant,
    last_cleanup_tick: Instant,
}

impl Torrent {
    /// Builds the actor's state from parsed torrent metadata and spawns it
    /// onto the runtime, returning the handle and alert stream the caller
    /// (`Engine`) addresses it through.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: TorrentId,
        metainfo: &Metainfo,
        own_id: PeerId,
        listen_port: u16,
        conf: TorrentConf,
        disk: DiskHandle,
        trackers: Vec<Box<dyn Tracker>>,
        download_limiter: Arc<StdMutex<TokenBucket>>,
        upload_limiter: Arc<StdMutex<TokenBucket>>,
    ) -> (TorrentHandle, mpsc::UnboundedReceiver<Alert>) {
        let now = Instant::now();
        let storage_info = StorageInfo::new(metainfo, conf.download_dir.clone());

        let piece_count = metainfo.piece_count();
        let mut piece_hashes_flat = Vec::with_capacity(piece_count * 20);
        let mut piece_hashes = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            let hash = metainfo
                .piece_hash(index)
                .expect("metainfo piece count is consistent with its pieces buffer");
            piece_hashes_flat.extend_from_slice(&hash);
            piece_hashes.push(hash);
        }

        let piece_manager = Arc::new(RwLock::new(PieceManager::new(
            piece_hashes,
            storage_info.piece_len,
            storage_info.last_piece_len,
        )));
        let active_pieces = Arc::new(RwLock::new(ActivePieceManager::new(
            conf.max_active_pieces,
            conf.max_buffered_bytes,
            conf.active_piece_stale_timeout,
        )));

        let conf = Arc::new(conf);
        let shared = Arc::new(Shared {
            piece_manager: piece_manager.clone(),
            active_pieces: active_pieces.clone(),
            disk: disk.clone(),
            torrent_id: id,
            download_limiter,
            upload_limiter,
            info_buffer: Arc::new(metainfo.info_buffer.clone()),
        });

        let file_count = match &storage_info.structure {
            FsStructure::File(_) => 1,
            FsStructure::Archive { files } => files.len(),
        };

        let connection_manager = ConnectionManager::new(
            conf.max_connected_peer_count,
            conf.min_requested_peer_count,
            conf.connect_timeout,
        );
        let tracker_manager = TrackerManager::new(
            trackers,
            conf.announce_interval,
            conf.tracker_error_threshold as u32,
            conf.tracker_max_retry_interval,
            now,
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();

        let torrent = Torrent {
            id,
            info_hash: metainfo.info_hash,
            own_id,
            listen_port,
            conf,
            storage_info,
            piece_hashes: piece_hashes_flat,
            file_priorities: vec![1; file_count],
            piece_manager,
            active_pieces,
            disk,
            swarm: Swarm::new(),
            connection_manager,
            tracker_manager,
            peer_coordinator: PeerCoordinator::new(),
            shared,
            sessions: HashMap::new(),
            peer_infos: HashMap::new(),
            peer_ids: HashMap::new(),
            mismatch_counts: HashMap::new(),
            commands_rx,
            events_tx,
            events_rx,
            alerts: alerts_tx,
            running: false,
            complete: false,
            last_choke_tick: now,
            last_cleanup_tick: now,
        };

        let handle = TorrentHandle { id, commands: commands_tx };
        tokio::spawn(torrent.run());
        (handle, alerts_rx)
    }

    async fn run(mut self) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some((addr, event)) = event {
                        self.handle_event(addr, event).await;
                    }
                }
                _ = maintenance.tick(), if self.running => {
                    self.run_maintenance().await;
                }
            }
        }
        self.shutdown_sessions();
        self.disk.remove_torrent(self.id);
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::AddPeer(addr, source) => self.swarm.add_peer(addr, source),
            Command::AddPeerHints(addrs) => self.swarm.add_peers(addrs, PeerSource::Manual),
            Command::SetFilePriority(file_index, priority) => {
                self.set_file_priority(file_index, priority).await
            }
            Command::RecheckData => self.recheck_data().await,
            Command::Accept(socket, addr) => self.accept(socket, addr),
            Command::Shutdown => return false,
        }
        true
    }

    fn shutdown_sessions(&mut self) {
        for (_, tx) in self.sessions.drain() {
            let _ = tx.send(PeerCommand::Shutdown);
        }
    }

    async fn start(&mut self) {
        if self.running {
            return;
        }
        let now = Instant::now();
        let req = self.announce_request(TrackerEvent::Started, now).await;
        let peers = self.tracker_manager.announce_all(req, now).await;
        self.swarm.add_peers(peers, PeerSource::Tracker);

        match self
            .disk
            .allocate_torrent(
                self.id,
                self.storage_info.clone(),
                self.piece_hashes.clone(),
                self.conf.read_cache_capacity,
            )
            .await
        {
            Ok(()) => {
                self.running = true;
                self.last_choke_tick = now;
                self.last_cleanup_tick = now;
                let _ = self.alerts.send(Alert::Started);
            }
            Err(e) => {
                log::warn!("torrent {} failed to allocate storage: {}", self.id, e);
                let _ = self.alerts.send(Alert::StartFailed(Error::from(e)));
            }
        }
    }

    async fn stop(&mut self) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        let req = self.announce_request(TrackerEvent::Stopped, now).await;
        self.tracker_manager.announce_all(req, now).await;

        self.shutdown_sessions();
        self.peer_infos.clear();
        self.peer_ids.clear();

        self.disk.drain().await;
        self.disk.remove_torrent(self.id);
        self.disk.resume();

        self.running = false;
        let _ = self.alerts.send(Alert::Stopped);
    }

    async fn recheck_data(&mut self) {
        let piece_count = self.piece_manager.read().await.piece_count();
        for index in 0..piece_count {
            match self.disk.read_piece(self.id, index).await {
                Ok(buffer) => {
                    let matches = self.piece_manager.read().await.verify_piece(index, &buffer);
                    if matches {
                        let first_time = self.piece_manager.write().await.mark_verified(index);
                        if first_time {
                            self.on_piece_verified(index, None).await;
                        }
                    }
                }
                Err(e) => {
                    log::debug!("torrent {} recheck: piece {} unreadable: {}", self.id, index, e);
                }
            }
        }
        let _ = self.alerts.send(Alert::RecheckComplete);
    }

    async fn set_file_priority(&mut self, file_index: FileIndex, priority: u8) {
        if file_index >= self.file_priorities.len() {
            log::warn!(
                "torrent {} set_file_priority: file index {} out of range",
                self.id,
                file_index
            );
            return;
        }
        let was_skipped = self.file_priorities[file_index] == 0;
        let is_skipped = priority == 0;
        self.file_priorities[file_index] = priority;
        self.disk.set_file_skip(self.id, file_index, is_skipped);

        let piece_count = self.piece_manager.read().await.piece_count();
        {
            let mut pm = self.piece_manager.write().await;
            for index in 0..piece_count {
                let files = match self.storage_info.files_intersecting_piece(index) {
                    Ok(files) => files,
                    Err(_) => continue,
                };
                pm.set_piece_priority(index, piece_priority_from_files(&self.file_priorities, files));
            }
        }

        // the file just flipped from skipped to wanted: any piece that lies
        // entirely within it and is already verified may have been buffered
        // in its `.parts` holding file instead of the real one -- move it
        // over now.
        if was_skipped && !is_skipped {
            let pm = self.piece_manager.read().await;
            for index in 0..piece_count {
                let files = match self.storage_info.files_intersecting_piece(index) {
                    Ok(files) => files,
                    Err(_) => continue,
                };
                if files.start == file_index
                    && files.end == file_index + 1
                    && pm.own_bitfield().get(index)
                {
                    if let Err(e) = self.disk.materialize_piece(self.id, index).await {
                        log::warn!(
                            "torrent {} failed to materialize piece {} for file {}: {}",
                            self.id,
                            index,
                            file_index,
                            e
                        );
                    }
                }
            }
            drop(pm);
            self.disk.drop_parts_file(self.id, file_index);
        }

        for tx in self.sessions.values() {
            let _ = tx.send(PeerCommand::PiecesAvailable);
        }
    }

    fn spawn_session(&mut self, socket: Option<TcpStream>, addr: SocketAddr) {
        let (session, tx) = match socket {
            Some(socket) => PeerSession::inbound(
                socket,
                addr,
                self.own_id,
                self.info_hash,
                self.conf.clone(),
                self.shared.clone(),
                self.events_tx.clone(),
            ),
            None => PeerSession::outbound(
                addr,
                self.own_id,
                self.info_hash,
                self.conf.clone(),
                self.shared.clone(),
                self.events_tx.clone(),
            ),
        };
        self.sessions.insert(addr, tx);
        tokio::spawn(session.run());
    }

    fn dial(&mut self, addr: SocketAddr, now: Instant) {
        self.swarm.mark_connecting(&addr);
        self.connection_manager.begin_dial(addr, now);
        self.spawn_session(None, addr);
    }

    /// Hands an already-accepted inbound socket to a fresh session. The
    /// address is deliberately not registered in `Swarm` -- that registry
    /// is the outbound dial-candidate list, and an inbound peer isn't a
    /// dial candidate; it's still tracked in `peer_infos` once its
    /// handshake completes, so it participates in choke/unchoke like any
    /// other connection.
    fn accept(&mut self, socket: TcpStream, addr: SocketAddr) {
        self.spawn_session(Some(socket), addr);
    }

    async fn handle_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer_id } => {
                let now = Instant::now();
                self.swarm.mark_connected(&addr, now);
                self.swarm.set_identity(&addr, peer_id, None);
                self.connection_manager.end_dial(&addr);
                self.peer_ids.insert(addr, peer_id);
                self.peer_infos.insert(
                    addr,
                    PeerInfo {
                        addr,
                        peer_id: Some(peer_id),
                        client_name: None,
                        status: Status::default(),
                        download_rate: 0,
                        upload_rate: 0,
                        downloaded: 0,
                        uploaded: 0,
                        connected_at: now,
                        last_data_received: None,
                    },
                );
                let _ = self.alerts.send(Alert::PeerConnected(addr));
            }
            PeerEvent::PieceVerified { piece_index } => {
                self.on_piece_verified(piece_index, Some(addr)).await;
            }
            PeerEvent::PieceHashMismatch { piece_index, contributors } => {
                let _ = self.alerts.send(Alert::PieceHashMismatch(piece_index));
                self.handle_hash_mismatch(contributors);
            }
            PeerEvent::Disconnected { error } => {
                self.handle_disconnect(addr, error);
            }
            PeerEvent::Stats {
                peer_interested,
                am_choking,
                peer_choking,
                download_rate,
                upload_rate,
                downloaded,
                uploaded,
                connected_at,
                last_data_received,
            } => {
                if let Some(info) = self.peer_infos.get_mut(&addr) {
                    info.status.peer_interested = peer_interested;
                    info.status.am_choking = am_choking;
                    info.status.peer_choking = peer_choking;
                    info.download_rate = download_rate;
                    info.upload_rate = upload_rate;
                    info.downloaded = downloaded;
                    info.uploaded = uploaded;
                    info.connected_at = connected_at;
                    info.last_data_received = last_data_received;
                }
            }
        }
    }

    /// Common handling for a piece just transitioning to verified, whether
    /// that happened via a live peer session's block ingestion or via
    /// `recheck_data`'s disk scan. `exclude` is the address that reported
    /// it (if any), which doesn't need telling about its own piece.
    async fn on_piece_verified(&mut self, index: PieceIndex, exclude: Option<SocketAddr>) {
        for (peer_addr, tx) in &self.sessions {
            if Some(*peer_addr) != exclude {
                let _ = tx.send(PeerCommand::Have(index));
            }
        }
        let _ = self.alerts.send(Alert::PieceVerified(index));
        self.check_completion().await;
    }

    fn handle_hash_mismatch(&mut self, contributors: Vec<(PeerId, u32)>) {
        if let Some(peer_id) = evaluate_hash_mismatch(&contributors, &mut self.mismatch_counts) {
            if let Some(peer_addr) = self.addr_for_peer_id(peer_id) {
                log::warn!(
                    "torrent {} banning peer {} for repeatedly supplying corrupt data",
                    self.id,
                    peer_addr
                );
                self.swarm.ban(&peer_addr, BanReason::CorruptData);
                if let Some(tx) = self.sessions.remove(&peer_addr) {
                    let _ = tx.send(PeerCommand::Shutdown);
                }
                let _ = self.alerts.send(Alert::PeerBanned {
                    addr: peer_addr,
                    reason: BanReason::CorruptData,
                });
            }
        }
    }

    fn addr_for_peer_id(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.peer_ids
            .iter()
            .find(|&(_, &id)| id == peer_id)
            .map(|(&addr, _)| addr)
    }

    fn handle_disconnect(&mut self, addr: SocketAddr, error: Option<Error>) {
        self.sessions.remove(&addr);
        self.connection_manager.end_dial(&addr);
        let now = Instant::now();
        if self.peer_infos.remove(&addr).is_some() {
            self.peer_ids.remove(&addr);
            self.swarm.mark_disconnected(&addr, now);
            let _ = self.alerts.send(Alert::PeerDisconnected(addr));
        } else {
            // Never reached `Connected`: this was a failed dial, not a
            // disconnect of an established session.
            self.swarm.mark_connect_failed(&addr, now);
        }
        if let Some(e) = error {
            log::debug!("torrent {} peer {} session ended: {}", self.id, addr, e);
        }
    }

    async fn check_completion(&mut self) {
        if self.complete {
            return;
        }
        let has_all = self.piece_manager.read().await.own_bitfield().has_all();
        if !has_all {
            return;
        }
        self.complete = true;
        let _ = self.alerts.send(Alert::Complete);

        let now = Instant::now();
        let req = self.announce_request(TrackerEvent::Completed, now).await;
        let peers = self.tracker_manager.announce_all(req, now).await;
        self.swarm.add_peers(peers, PeerSource::Tracker);
    }

    async fn announce_request(&self, event: TrackerEvent, _now: Instant) -> AnnounceRequest {
        let (downloaded, uploaded) = self.peer_totals();
        let verified = self.verified_bytes().await;
        let left = self.storage_info.download_len.saturating_sub(verified);
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.own_id,
            port: self.listen_port,
            uploaded,
            downloaded,
            left,
            event,
            num_want: Some(50),
        }
    }

    fn peer_totals(&self) -> (u64, u64) {
        let downloaded = self.peer_infos.values().map(|p| p.downloaded).sum();
        let uploaded = self.peer_infos.values().map(|p| p.uploaded).sum();
        (downloaded, uploaded)
    }

    async fn verified_bytes(&self) -> u64 {
        let pm = self.piece_manager.read().await;
        (0..pm.piece_count())
            .filter(|&i| pm.own_bitfield().get(i))
            .map(|i| pm.piece_len(i) as u64)
            .sum()
    }

    async fn run_maintenance(&mut self) {
        let now = Instant::now();
        self.fill_connection_slots(now);
        self.handle_dial_timeouts(now);
        self.run_choke_tick(now);
        self.run_active_piece_cleanup(now).await;
        self.run_tracker_announce(now).await;
    }

    fn fill_connection_slots(&mut self, now: Instant) {
        let connected = self.peer_infos.len();
        if !self.connection_manager.wants_more_peers(connected) {
            return;
        }
        let slots = self.connection_manager.slots_to_fill(connected);
        if slots == 0 {
            return;
        }
        for addr in self.swarm.get_connectable_peers(slots, now) {
            self.dial(addr, now);
        }
    }

    /// Times out stalled dials per `ConnectionManager`'s own bookkeeping.
    /// This is a deliberate belt-and-suspenders alongside the session's
    /// own `conf.connect_timeout`-driven connect timeout: it lets
    /// `Swarm`'s backoff apply even if a session task is slow to notice
    /// its own dial has stalled.
    fn handle_dial_timeouts(&mut self, now: Instant) {
        for addr in self.connection_manager.take_timed_out_dials(now) {
            self.swarm.mark_connect_failed(&addr, now);
            if let Some(tx) = self.sessions.remove(&addr) {
                let _ = tx.send(PeerCommand::Shutdown);
            }
        }
    }

    fn run_choke_tick(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_choke_tick) < self.conf.choke_interval {
            return;
        }
        self.last_choke_tick = now;

        let snapshots: Vec<PeerSnapshot> = self
            .peer_infos
            .values()
            .map(|info| PeerSnapshot {
                addr: info.addr,
                peer_interested: info.status.peer_interested,
                am_choking: info.status.am_choking,
                peer_choking: info.status.peer_choking,
                download_rate: info.download_rate,
                connected_at: info.connected_at,
                last_data_received: info.last_data_received,
            })
            .collect();

        let skip_speed_checks = self.shared.download_limiter.lock().unwrap().available(now) == 0;
        let has_replacement_candidates = !self.swarm.get_connectable_peers(1, now).is_empty();
        let rng = rand::random::<f64>();

        let (unchokes, drops) = self.peer_coordinator.tick(
            &snapshots,
            &self.conf,
            now,
            rng,
            skip_speed_checks,
            has_replacement_candidates,
        );

        for decision in unchokes {
            if let Some(tx) = self.sessions.get(&decision.addr) {
                let cmd = match decision.action {
                    UnchokeAction::Choke => PeerCommand::Choke,
                    UnchokeAction::Unchoke => PeerCommand::Unchoke,
                };
                let _ = tx.send(cmd);
            }
            if let Some(info) = self.peer_infos.get_mut(&decision.addr) {
                info.status.am_choking = matches!(decision.action, UnchokeAction::Choke);
            }
        }

        for decision in drops {
            if let Some(tx) = self.sessions.remove(&decision.addr) {
                let _ = tx.send(PeerCommand::Shutdown);
            }
        }
    }

    async fn run_active_piece_cleanup(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cleanup_tick) < self.conf.active_piece_cleanup_interval {
            return;
        }
        self.last_cleanup_tick = now;

        let mut active = self.active_pieces.write().await;
        active.expire_stale_requests(now, self.conf.block_request_timeout);
        let abandoned = active.remove_stale_pieces(now);
        if !abandoned.is_empty() {
            log::debug!(
                "torrent {} abandoned {} stale active piece(s)",
                self.id,
                abandoned.len()
            );
        }
    }

    async fn run_tracker_announce(&mut self, now: Instant) {
        let req = self.announce_request(TrackerEvent::None, now).await;
        let peers = self.tracker_manager.announce_due(req, now).await;
        if !peers.is_empty() {
            self.swarm.add_peers(peers, PeerSource::Tracker);
        }
    }
}

/// Recomputes a piece's priority as the highest priority among the files
/// it overlaps -- a piece spanning a wanted file and a skipped file is
/// still wanted.
fn piece_priority_from_files(file_priorities: &[u8], files: std::ops::Range<FileIndex>) -> Priority {
    let max = files.map(|f| file_priorities[f]).max().unwrap_or(1);
    Priority::from_u8(max)
}

/// Decides whether a hash-mismatch event should result in banning its
/// majority contributor, given the running per-peer mismatch tally.
/// Returns the peer to ban once it crosses [`CORRUPT_DATA_BAN_THRESHOLD`].
fn evaluate_hash_mismatch(
    contributors: &[(PeerId, u32)],
    mismatch_counts: &mut HashMap<PeerId, u32>,
) -> Option<PeerId> {
    let total: u32 = contributors.iter().map(|&(_, n)| n).sum();
    if total == 0 {
        return None;
    }
    let &(peer_id, count) = contributors.iter().max_by_key(|&&(_, n)| n)?;
    if count * 2 <= total {
        return None;
    }
    let entry = mismatch_counts.entry(peer_id).or_insert(0);
    *entry += 1;
    if *entry >= CORRUPT_DATA_BAN_THRESHOLD {
        Some(peer_id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::future::Future;
    use std::pin::Pin;
    use tempfile::tempdir;

    use crate::tracker::AnnounceResponse;

    /// A tracker that always succeeds with an empty peer list, for tests
    /// that only care about the disk/piece-verification path.
    struct NullTracker;

    impl Tracker for NullTracker {
        fn url(&self) -> &str {
            "null://test"
        }

        fn announce(
            &self,
            _req: AnnounceRequest,
        ) -> Pin<Box<dyn Future<Output = crate::error::Result<AnnounceResponse>> + Send>> {
            Box::pin(async {
                Ok(AnnounceResponse {
                    interval: Duration::from_secs(1800),
                    min_interval: None,
                    peers: Vec::new(),
                })
            })
        }
    }

    /// Mirrors `metainfo.rs`'s own bencode test fixtures (that module's raw
    /// types are private), producing a single-file, single-piece torrent.
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

    fn single_piece_metainfo_bytes(data: &[u8]) -> (Vec<u8>, Sha1Hash) {
        let mut hasher = Sha1::new();
        hasher.input(data);
        let digest = hasher.result();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);

        let raw = TestMetainfo {
            info: TestInfo {
                name: "test.bin".to_owned(),
                pieces: hash.to_vec(),
                piece_length: data.len() as u64,
                length: Some(data.len() as u64),
            },
            announce: Some("http://tracker.example/announce".to_owned()),
        };
        (serde_bencode::to_bytes(&raw).unwrap(), hash)
    }

    fn own_id() -> PeerId {
        *b"-TE0001-xxxxxxxxxxxx"
    }

    fn test_conf(dir: &std::path::Path) -> TorrentConf {
        TorrentConf::new(dir)
    }

    fn spawn_test_torrent(
        id: TorrentId,
        metainfo: &Metainfo,
        dir: &std::path::Path,
    ) -> (TorrentHandle, mpsc::UnboundedReceiver<Alert>) {
        let conf = test_conf(dir);
        let disk = DiskHandle::spawn(2);
        let now = Instant::now();
        let download_limiter = Arc::new(StdMutex::new(TokenBucket::unlimited(now)));
        let upload_limiter = Arc::new(StdMutex::new(TokenBucket::unlimited(now)));
        let trackers: Vec<Box<dyn Tracker>> = vec![Box::new(NullTracker)];
        Torrent::spawn(
            id,
            metainfo,
            own_id(),
            6881,
            conf,
            disk,
            trackers,
            download_limiter,
            upload_limiter,
        )
    }

    #[test]
    fn piece_priority_is_the_max_of_its_files() {
        let priorities = vec![1u8, 0, 2];
        assert_eq!(piece_priority_from_files(&priorities, 0..2), Priority::Normal);
        assert_eq!(piece_priority_from_files(&priorities, 1..3), Priority::High);
        assert_eq!(piece_priority_from_files(&priorities, 1..2), Priority::Skip);
    }

    #[test]
    fn hash_mismatch_bans_only_after_repeated_supermajority() {
        let mut counts = HashMap::new();
        let culprit = [1u8; 20];
        let innocent = [2u8; 20];

        // an even split is never a supermajority
        assert_eq!(
            evaluate_hash_mismatch(&[(culprit, 1), (innocent, 1)], &mut counts),
            None
        );

        assert_eq!(
            evaluate_hash_mismatch(&[(culprit, 5), (innocent, 1)], &mut counts),
            None
        );
        assert_eq!(
            evaluate_hash_mismatch(&[(culprit, 5), (innocent, 1)], &mut counts),
            Some(culprit)
        );
    }

    #[test]
    fn hash_mismatch_ignores_an_empty_contributor_list() {
        let mut counts = HashMap::new();
        assert_eq!(evaluate_hash_mismatch(&[], &mut counts), None);
    }

    #[tokio::test]
    async fn start_allocates_storage_and_emits_started() {
        let dir = tempdir().unwrap();
        let data = vec![5u8; 16];
        let (buf, _hash) = single_piece_metainfo_bytes(&data);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        let (handle, mut alerts) = spawn_test_torrent(1, &metainfo, dir.path());
        handle.start();

        assert!(matches!(alerts.recv().await.unwrap(), Alert::Started));
    }

    #[tokio::test]
    async fn recheck_of_matching_data_verifies_the_piece_and_completes() {
        let dir = tempdir().unwrap();
        let data = vec![9u8; 16];
        let (buf, _hash) = single_piece_metainfo_bytes(&data);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        let (handle, mut alerts) = spawn_test_torrent(2, &metainfo, dir.path());
        handle.start();
        assert!(matches!(alerts.recv().await.unwrap(), Alert::Started));

        std::fs::write(dir.path().join("test.bin"), &data).unwrap();
        handle.recheck_data();

        let mut saw_verified = false;
        let mut saw_recheck_complete = false;
        let mut saw_complete = false;
        for _ in 0..3 {
            match alerts.recv().await.unwrap() {
                Alert::PieceVerified(0) => saw_verified = true,
                Alert::RecheckComplete => saw_recheck_complete = true,
                Alert::Complete => saw_complete = true,
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        assert!(saw_verified && saw_recheck_complete && saw_complete);
    }

    #[tokio::test]
    async fn recheck_of_corrupt_data_never_marks_the_piece_verified() {
        let dir = tempdir().unwrap();
        let expected = vec![9u8; 16];
        let (buf, _hash) = single_piece_metainfo_bytes(&expected);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        let (handle, mut alerts) = spawn_test_torrent(3, &metainfo, dir.path());
        handle.start();
        assert!(matches!(alerts.recv().await.unwrap(), Alert::Started));

        std::fs::write(dir.path().join("test.bin"), vec![0u8; 16]).unwrap();
        handle.recheck_data();

        assert!(matches!(alerts.recv().await.unwrap(), Alert::RecheckComplete));
    }
}
