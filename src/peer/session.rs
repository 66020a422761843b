//! A single peer connection's actor: handshake, extension negotiation,
//! download pipelining, upload serving, and `ut_metadata` serving.
//!
//! Reshaped around the split `PieceManager`/`ActivePieceManager` state
//! (shared behind `Arc<RwLock<_>>` rather than owned by the session), with
//! upload serving, the BEP 10 extension handshake, and `ut_metadata` serving
//! all implemented here rather than left as logged stubs.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{Framed, FramedParts};

use crate::bitfield::BitField;
use crate::conf::TorrentConf;
use crate::counter::ThroughputCounter;
use crate::disk::{DiskHandle, WriteOutcome};
use crate::download::ActivePieceManager;
use crate::error::{Error, Result};
use crate::piece_manager::{peer_key, PieceManager, Priority};
use crate::piece_picker::{select_pieces, PickerInput};
use crate::rate_limiter::TokenBucket;
use crate::{BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId};

use super::codec::{
    ExtendedHandshake, ExtendedMessage, Handshake, HandshakeCodec, Message, MetadataMessage,
    PeerCodec,
};
use super::{Command, Event, State, Status};

/// Torrent-wide state and collaborators a session needs access to but does
/// not own: the split piece-state types, the disk handle, and the shared
/// rate limiters.
pub(crate) struct Shared {
    pub piece_manager: Arc<RwLock<PieceManager>>,
    pub active_pieces: Arc<RwLock<ActivePieceManager>>,
    pub disk: DiskHandle,
    pub torrent_id: TorrentId,
    pub download_limiter: Arc<StdMutex<TokenBucket>>,
    pub upload_limiter: Arc<StdMutex<TokenBucket>>,
    /// The torrent's own encoded info dict, served verbatim to peers that
    /// request it over `ut_metadata`. Metadata exchange is serve-only in
    /// this engine: `Metainfo` is always supplied up front, so there is no
    /// bootstrap path that fetches metadata *from* a peer.
    pub info_buffer: Arc<Vec<u8>>,
}

/// A single peer connection. One task runs exactly one of these for its
/// entire lifetime; `Torrent` addresses it only through the
/// `mpsc::UnboundedSender<Command>` returned alongside it.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    is_outbound: bool,
    socket: Option<TcpStream>,
    own_id: PeerId,
    info_hash: Sha1Hash,
    state: State,
    status: Status,
    peer_id: Option<PeerId>,
    peer_bitfield: Option<BitField>,
    conf: Arc<TorrentConf>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<(SocketAddr, Event)>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Blocks we've requested from this peer and not yet received, capped
    /// at `conf.max_pipeline_len`.
    outstanding_requests: usize,
    /// The peer's requests to us, FIFO, capped at `conf.max_upload_queue_len`.
    incoming_requests: VecDeque<BlockInfo>,
    supports_extensions: bool,
    /// The id the peer wants `ut_metadata` messages addressed to, learned
    /// from their extension handshake.
    peer_ut_metadata_id: Option<u8>,
    download_stats: ThroughputCounter,
    upload_stats: ThroughputCounter,
    connected_at: Instant,
    last_data_received: Option<Instant>,
}

impl PeerSession {
    /// Builds a session for a not-yet-connected outbound peer, returning it
    /// alongside the command sender `Torrent` will hold to address it.
    pub fn outbound(
        addr: SocketAddr,
        own_id: PeerId,
        info_hash: Sha1Hash,
        conf: Arc<TorrentConf>,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<(SocketAddr, Event)>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        Self::new(addr, true, None, own_id, info_hash, conf, shared, events)
    }

    /// Builds a session for an already-accepted inbound connection.
    pub fn inbound(
        socket: TcpStream,
        addr: SocketAddr,
        own_id: PeerId,
        info_hash: Sha1Hash,
        conf: Arc<TorrentConf>,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<(SocketAddr, Event)>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        Self::new(
            addr,
            false,
            Some(socket),
            own_id,
            info_hash,
            conf,
            shared,
            events,
        )
    }

    fn new(
        addr: SocketAddr,
        is_outbound: bool,
        socket: Option<TcpStream>,
        own_id: PeerId,
        info_hash: Sha1Hash,
        conf: Arc<TorrentConf>,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<(SocketAddr, Event)>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let session = Self {
            addr,
            is_outbound,
            socket,
            own_id,
            info_hash,
            state: if is_outbound {
                State::Connecting
            } else {
                State::AwaitHandshake
            },
            status: Status::default(),
            peer_id: None,
            peer_bitfield: None,
            conf,
            shared,
            events,
            commands: commands_rx,
            outstanding_requests: 0,
            incoming_requests: VecDeque::new(),
            supports_extensions: false,
            peer_ut_metadata_id: None,
            download_stats: ThroughputCounter::new(now),
            upload_stats: ThroughputCounter::new(now),
            connected_at: now,
            last_data_received: None,
        };
        (session, commands_tx)
    }

    /// Runs the session to completion: connects (if outbound), handshakes,
    /// then services the connection until it ends, always reporting a
    /// [`Event::Disconnected`] and releasing this peer's claim on shared
    /// state before returning.
    pub async fn run(mut self) {
        let result = self.run_inner().await;
        self.release_shared_state().await;
        let error = result.err();
        if let Some(e) = &error {
            log::info!("peer {} session ended: {}", self.addr, e);
        }
        let _ = self.events.send((self.addr, Event::Disconnected { error }));
    }

    async fn run_inner(&mut self) -> Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                self.state = State::Connecting;
                tokio::time::timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
                    .await
                    .map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect timed out",
                        ))
                    })??
            }
        };

        self.state = State::AwaitHandshake;
        let handshake_framed = Framed::new(socket, HandshakeCodec);
        let mut framed = self.handshake(handshake_framed).await?;
        self.state = State::Connected;

        let peer_id = self.peer_id.expect("handshake completed without a peer id");
        let _ = self.events.send((self.addr, Event::Connected { peer_id }));

        self.announce_bitfield(&mut framed).await?;
        if self.supports_extensions {
            let handshake =
                ExtendedHandshake::new(Some(self.shared.info_buffer.len() as u32));
            framed
                .send(Message::Extended(ExtendedMessage::Handshake(handshake)))
                .await?;
        }

        self.message_loop(&mut framed).await
    }

    /// Performs the 68-byte handshake in the direction appropriate for an
    /// outbound/inbound connection, then swaps the transport's codec over
    /// to [`PeerCodec`] for the rest of the connection's life, reusing the
    /// handshake codec's read/write buffers.
    async fn handshake(
        &mut self,
        mut framed: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        let our_handshake = Handshake::new(self.info_hash, self.own_id);

        if self.is_outbound {
            framed.send(our_handshake).await?;
        }

        let peer_handshake = framed
            .next()
            .await
            .ok_or(Error::ChannelClosed)??;
        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.peer_id = Some(peer_handshake.peer_id);
        self.supports_extensions = peer_handshake.supports_extension_protocol();

        if !self.is_outbound {
            framed.send(our_handshake).await?;
        }

        let parts = framed.into_parts();
        let mut new_parts = FramedParts::new(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn announce_bitfield(&self, framed: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        let own = self.shared.piece_manager.read().await.own_bitfield().clone();
        if own.count() > 0 {
            let wire = crate::Bitfield::from_slice(&own.to_bytes());
            framed.send(Message::Bitfield(wire)).await?;
        }
        Ok(())
    }

    async fn message_loop(&mut self, framed: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        let mut cleanup = tokio::time::interval(self.conf.active_piece_cleanup_interval);

        loop {
            tokio::select! {
                msg = framed.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_message(framed, msg).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(framed, cmd).await? {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = cleanup.tick() => {
                    self.make_requests(framed).await?;
                    self.report_stats();
                }
            }
        }
    }

    /// Returns `false` if the command means the session should end.
    async fn handle_command(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Choke => {
                self.status.am_choking = true;
                self.incoming_requests.clear();
                framed.send(Message::Choke).await?;
            }
            Command::Unchoke => {
                self.status.am_choking = false;
                framed.send(Message::Unchoke).await?;
                self.serve_incoming(framed).await?;
            }
            Command::Have(index) => {
                framed.send(Message::Have { piece_index: index }).await?;
            }
            Command::PiecesAvailable => {
                self.update_interest(framed).await?;
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_message(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.peer_choking = true;
                if let Some(peer_id) = self.peer_id {
                    self.shared.active_pieces.write().await.clear_requests_for_peer(peer_id);
                }
                self.outstanding_requests = 0;
            }
            Message::Unchoke => {
                self.status.peer_choking = false;
                self.make_requests(framed).await?;
            }
            Message::Interested => self.status.peer_interested = true,
            Message::NotInterested => self.status.peer_interested = false,
            Message::Have { piece_index } => self.handle_have(framed, piece_index).await?,
            Message::Bitfield(raw) => self.handle_bitfield(framed, raw).await?,
            Message::Request(info) => self.handle_request(framed, info).await?,
            Message::Block { piece_index, offset, data } => {
                self.handle_block(piece_index, offset, data).await?;
                self.make_requests(framed).await?;
            }
            Message::Cancel(info) => self.incoming_requests.retain(|r| *r != info),
            Message::Extended(ext) => self.handle_extended(framed, ext).await?,
        }
        Ok(())
    }

    async fn handle_have(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
    ) -> Result<()> {
        if let Some(bf) = &mut self.peer_bitfield {
            if piece_index < bf.len() {
                bf.set(piece_index, true);
            }
        }
        self.shared
            .piece_manager
            .write()
            .await
            .on_peer_have(peer_key(&self.addr), piece_index);
        self.update_interest(framed).await
    }

    async fn handle_bitfield(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        raw: crate::Bitfield,
    ) -> Result<()> {
        if self.peer_bitfield.is_some() {
            return Err(Error::BitfieldNotAfterHandshake);
        }
        let piece_count = self.shared.piece_manager.read().await.piece_count();
        let bytes = raw.as_slice().to_vec();
        if bytes.len() != (piece_count + 7) / 8 {
            return Err(Error::InvalidBitfieldLength);
        }
        let bitfield = BitField::from_bytes(&bytes, piece_count);
        self.shared
            .piece_manager
            .write()
            .await
            .on_peer_bitfield(peer_key(&self.addr), bitfield.clone());
        self.peer_bitfield = Some(bitfield);
        self.update_interest(framed).await
    }

    async fn handle_request(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        info: BlockInfo,
    ) -> Result<()> {
        if info.len > crate::MAX_REQUEST_LEN {
            return Err(Error::RequestTooLarge);
        }
        if self.status.am_choking {
            return Ok(());
        }
        if self.incoming_requests.len() >= self.conf.max_upload_queue_len {
            return Err(Error::ProtocolViolation(
                "peer exceeded the upload request queue cap".into(),
            ));
        }
        self.incoming_requests.push_back(info);
        self.serve_incoming(framed).await
    }

    /// Drains as much of the incoming request queue as the upload rate
    /// limiter currently allows, stopping (without losing the remaining
    /// requests) the moment it's exhausted.
    async fn serve_incoming(&mut self, framed: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        while let Some(info) = self.incoming_requests.pop_front() {
            let now = Instant::now();
            let allowed = self
                .shared
                .upload_limiter
                .lock()
                .unwrap()
                .try_consume(now, info.len as u64);
            if !allowed {
                self.incoming_requests.push_front(info);
                break;
            }
            match self
                .shared
                .disk
                .read_block(self.shared.torrent_id, info.piece_index, info.offset, info.len)
                .await
            {
                Some(data) => {
                    self.upload_stats.add(now, data.len() as u64);
                    framed
                        .send(Message::Block {
                            piece_index: info.piece_index,
                            offset: info.offset,
                            data,
                        })
                        .await?;
                }
                None => {
                    log::warn!(
                        "peer {} requested unavailable block {}",
                        self.addr,
                        info
                    );
                }
            }
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        ext: ExtendedMessage,
    ) -> Result<()> {
        match ext {
            ExtendedMessage::Handshake(handshake) => {
                self.peer_ut_metadata_id = handshake.ut_metadata_id();
            }
            ExtendedMessage::Metadata(MetadataMessage::Request { piece }) => {
                self.serve_metadata_piece(framed, piece).await?;
            }
            ExtendedMessage::Metadata(_) => {
                // We never request metadata ourselves -- `Metainfo` is
                // always supplied up front (see `Shared::info_buffer`'s
                // doc comment).
            }
            ExtendedMessage::Unknown { .. } => {}
        }
        Ok(())
    }

    async fn serve_metadata_piece(
        &self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        piece: u32,
    ) -> Result<()> {
        const METADATA_PIECE_LEN: u32 = 0x4000;
        let info_buffer = &self.shared.info_buffer;
        let total_size = info_buffer.len() as u32;
        let start = (piece as u64 * METADATA_PIECE_LEN as u64) as usize;

        let msg = if start >= info_buffer.len() {
            MetadataMessage::Reject { piece }
        } else {
            let end = (start + METADATA_PIECE_LEN as usize).min(info_buffer.len());
            MetadataMessage::Data {
                piece,
                total_size,
                data: info_buffer[start..end].to_vec(),
            }
        };
        framed
            .send(Message::Extended(ExtendedMessage::Metadata(msg)))
            .await
    }

    /// Recomputes whether we're interested in this peer (do they have any
    /// piece we want that we don't already have) and sends `interested`/
    /// `not_interested` on change, then tries to fill the request pipeline.
    async fn update_interest(&mut self, framed: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        let wants = match &self.peer_bitfield {
            Some(peer_bf) => {
                let pm = self.shared.piece_manager.read().await;
                let own = pm.own_bitfield();
                (0..pm.piece_count()).any(|i| {
                    peer_bf.get(i) && !own.get(i) && pm.priority(i) != Priority::Skip
                })
            }
            None => false,
        };

        if wants && !self.status.am_interested {
            self.status.am_interested = true;
            framed.send(Message::Interested).await?;
        } else if !wants && self.status.am_interested {
            self.status.am_interested = false;
            framed.send(Message::NotInterested).await?;
        }

        if wants {
            self.make_requests(framed).await?;
        }
        Ok(())
    }

    /// Fills the request pipeline up to `conf.max_pipeline_len`, continuing
    /// already-started pieces this peer has before picking fresh ones via
    /// [`select_pieces`].
    async fn make_requests(&mut self, framed: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        if self.status.peer_choking || !self.status.am_interested {
            return Ok(());
        }
        let peer_id = match self.peer_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let room = self.conf.max_pipeline_len.saturating_sub(self.outstanding_requests);
        if room == 0 {
            return Ok(());
        }
        let peer_bitfield = match &self.peer_bitfield {
            Some(bf) => bf.clone(),
            None => return Ok(()),
        };

        let now = Instant::now();
        let mut requests = Vec::new();

        {
            let mut active = self.shared.active_pieces.write().await;
            let pm = self.shared.piece_manager.read().await;
            let started = active.started_vec(pm.piece_count());

            for (index, &is_started) in started.iter().enumerate() {
                if requests.len() >= room {
                    break;
                }
                if !is_started || !peer_bitfield.get(index) {
                    continue;
                }
                if let Some(piece) = active.get_mut(index) {
                    piece.pick_blocks(index, peer_id, room - requests.len(), now, &mut requests);
                }
            }

            if requests.len() < room {
                let result = select_pieces(PickerInput {
                    peer_bitfield: &peer_bitfield,
                    own_bitfield: pm.own_bitfield(),
                    piece_priority: pm.priority_vec(),
                    piece_availability: pm.availability_vec(),
                    started_pieces: &started,
                    max_pieces: room - requests.len(),
                });
                for index in result.pieces {
                    if requests.len() >= room {
                        break;
                    }
                    let len = pm.piece_len(index);
                    if let Some(piece) = active.get_or_create(index, len, now) {
                        piece.pick_blocks(index, peer_id, room - requests.len(), now, &mut requests);
                    }
                }
            }
        }

        for info in requests {
            if self
                .shared
                .download_limiter
                .lock()
                .unwrap()
                .try_consume(now, info.len as u64)
            {
                framed.send(Message::Request(info)).await?;
                self.outstanding_requests += 1;
            }
        }
        Ok(())
    }

    /// Ingests a received block: buffers it, and if it completes the
    /// piece, hashes, writes and (on success) marks it verified. Routes
    /// through the shared `ActivePieceManager`/`PieceManager` split and the
    /// disk actor.
    async fn handle_block(&mut self, piece_index: PieceIndex, offset: u32, data: Vec<u8>) -> Result<()> {
        self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
        let now = Instant::now();
        self.download_stats.add(now, data.len() as u64);
        self.last_data_received = Some(now);

        let already_have = self.shared.piece_manager.read().await.own_bitfield().get(piece_index);
        if already_have {
            return Ok(());
        }

        let complete = {
            let mut active = self.shared.active_pieces.write().await;
            match active.get_mut(piece_index) {
                Some(piece) => {
                    if !piece.receive_block(offset, &data, now) {
                        return Ok(());
                    }
                    piece.is_complete()
                }
                None => return Ok(()),
            }
        };
        if !complete {
            return Ok(());
        }

        let (buffer, contributors) = {
            let mut active = self.shared.active_pieces.write().await;
            let piece = active
                .remove(piece_index)
                .expect("active piece vanished between completion check and removal");
            let contributors: Vec<(PeerId, u32)> =
                piece.contributors().iter().map(|(&p, &n)| (p, n)).collect();
            (Arc::new(piece.buffer().to_vec()), contributors)
        };

        // When the disk can hash-and-write `piece_index` in one pass, let it:
        // hashing the buffer here too would just repeat the same SHA-1 over
        // the same bytes a moment before the disk actor does it again.
        let verified_write_eligible = self
            .shared
            .disk
            .supports_verified_write(self.shared.torrent_id, piece_index)
            .await;

        if !verified_write_eligible {
            let verified = self
                .shared
                .piece_manager
                .read()
                .await
                .verify_piece(piece_index, &buffer);
            if !verified {
                log::warn!("piece {} failed hash check (peer {})", piece_index, self.addr);
                let _ = self.events.send((
                    self.addr,
                    Event::PieceHashMismatch { piece_index, contributors },
                ));
                return Ok(());
            }
        }

        let outcome = self
            .shared
            .disk
            .write_piece(self.shared.torrent_id, piece_index, buffer, verified_write_eligible)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        if outcome == WriteOutcome::HashMismatch {
            let _ = self.events.send((
                self.addr,
                Event::PieceHashMismatch { piece_index, contributors },
            ));
            return Ok(());
        }

        let first_time = self.shared.piece_manager.write().await.mark_verified(piece_index);
        if first_time {
            let _ = self.events.send((self.addr, Event::PieceVerified { piece_index }));
        }
        Ok(())
    }

    /// Releases this peer's claim on shared piece-availability/request
    /// state, run unconditionally when the session ends, regardless of
    /// whether the handshake ever completed.
    async fn release_shared_state(&mut self) {
        if let Some(peer_id) = self.peer_id {
            self.shared.active_pieces.write().await.clear_requests_for_peer(peer_id);
        }
        self.shared.piece_manager.write().await.on_peer_disconnect(peer_key(&self.addr));
    }

    /// Sends a snapshot of this session's bookkeeping to `Torrent`; see
    /// [`Event::Stats`].
    fn report_stats(&self) {
        let now = Instant::now();
        let _ = self.events.send((
            self.addr,
            Event::Stats {
                peer_interested: self.status.peer_interested,
                am_choking: self.status.am_choking,
                peer_choking: self.status.peer_choking,
                download_rate: self.download_stats.rate(now),
                upload_rate: self.upload_stats.rate(now),
                downloaded: self.download_stats.total(),
                uploaded: self.upload_stats.total(),
                connected_at: self.connected_at,
                last_data_received: self.last_data_received,
            },
        ));
    }
}
