// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::time::Instant;

use tracing::{event, instrument, Level};

use crate::buffer_pool::BufferPool;
use crate::config::{Settings, MAX_CLEANUP_CYCLES, STALE_DIAL_TIMEOUT};
use crate::connection::Connection;
use crate::disk::DiskClient;
use crate::encryption::{EncryptionMethod, EncryptionNegotiator, EncryptionSet};
use crate::error::{ConnectionError, ConnectionFailureReason, HandlerError, WireError};
use crate::peer::{Peer, PeerId};
use crate::session::PeerSession;
use crate::torrent::{TorrentError, TorrentManager};
use crate::wire::{self, Handshake, PeerMessage};

pub type BanPeerHook = Box<dyn Fn(&Peer) -> bool + Send + Sync>;
pub type ConnectionFactory = Box<dyn Fn(&Peer) -> Option<Connection> + Send + Sync>;

pub struct ConnectionManagerParameters {
    pub local_peer_id: PeerId,
    pub settings: Arc<Settings>,
    pub negotiator: Arc<dyn EncryptionNegotiator>,
    pub disk: DiskClient,
    pub buffer_pool: BufferPool,
    /// Single-subscriber ban hook; a `true` verdict consumes the candidate
    /// without counting as a failed attempt.
    pub should_ban_peer: Option<BanPeerHook>,
    /// Overrides URI resolution; defaults to TCP.
    pub connection_factory: Option<ConnectionFactory>,
}

/// Establishes, admits and tears down peer connections across all registered
/// torrents, within the global open and half-open connection budgets.
///
/// All bookkeeping lives behind short-lived synchronous locks; the pipelines,
/// the send pumps and the receive loops are spawned tasks whose terminal
/// failures all funnel through [`ConnectionManager::cleanup`]. Methods assume
/// a tokio runtime context.
pub struct ConnectionManager {
    local_peer_id: PeerId,
    settings: Arc<Settings>,
    negotiator: Arc<dyn EncryptionNegotiator>,
    disk: DiskClient,
    buffer_pool: BufferPool,
    should_ban_peer: Option<BanPeerHook>,
    connection_factory: ConnectionFactory,
    torrents: StdMutex<Vec<Arc<TorrentManager>>>,
    pending_dials: StdMutex<Vec<PendingDial>>,
    open_connections: AtomicUsize,
}

/// One in-flight outbound dial. The record lives from just before the
/// connect until the pipeline terminates, so the half-open budget covers
/// dials that are still negotiating or handshaking.
struct PendingDial {
    torrent: Arc<TorrentManager>,
    connection: Arc<Connection>,
    started_at: Instant,
}

impl ConnectionManager {
    pub fn new(params: ConnectionManagerParameters) -> Arc<Self> {
        Arc::new(ConnectionManager {
            local_peer_id: params.local_peer_id,
            settings: params.settings,
            negotiator: params.negotiator,
            disk: params.disk,
            buffer_pool: params.buffer_pool,
            should_ban_peer: params.should_ban_peer,
            connection_factory: params
                .connection_factory
                .unwrap_or_else(|| Box::new(|peer: &Peer| Connection::outgoing(peer.uri()))),
            torrents: StdMutex::new(Vec::new()),
            pending_dials: StdMutex::new(Vec::new()),
            open_connections: AtomicUsize::new(0),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Snapshot of fully connected peers across all torrents.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn pending_dial_count(&self) -> usize {
        self.pending_dials.lock().unwrap().len()
    }

    pub fn add(&self, torrent: &Arc<TorrentManager>) {
        let mut torrents = self.torrents.lock().unwrap();
        if !torrents.iter().any(|t| Arc::ptr_eq(t, torrent)) {
            torrent.set_attached(true);
            torrents.push(torrent.clone());
        }
    }

    pub fn remove(&self, torrent: &Arc<TorrentManager>) {
        self.torrents.lock().unwrap().retain(|t| !Arc::ptr_eq(t, torrent));
        torrent.set_attached(false);
        self.cancel_pending_connects(Some(torrent));
    }

    #[cfg(test)]
    pub(crate) fn torrents_snapshot(&self) -> Vec<Arc<TorrentManager>> {
        self.torrents.lock().unwrap().clone()
    }

    /// Starts as many new outbound dials as the global budget permits.
    ///
    /// Each iteration stable-sorts the torrent list by connected-peer count
    /// so the least-connected torrent gets priority, walks it head to tail,
    /// and rotates the first torrent that yields a dial to the tail. Gives up
    /// when a cap is reached or a full walk yields nothing.
    pub fn try_connect(self: &Arc<Self>) {
        loop {
            if self.open_connections() >= self.settings.max_open_connections {
                break;
            }
            if self.pending_dial_count() >= self.settings.max_half_open_connections {
                break;
            }
            if !self.try_connect_once() {
                break;
            }
        }
    }

    fn try_connect_once(self: &Arc<Self>) -> bool {
        let ordered = {
            let mut torrents = self.torrents.lock().unwrap();
            torrents.sort_by_key(|t| t.connected_count());
            torrents.clone()
        };
        for torrent in ordered {
            if let Some(peer) = self.pick_dialable_peer(&torrent) {
                self.rotate_to_tail(&torrent);
                self.start_dial(torrent, peer);
                return true;
            }
        }
        false
    }

    fn pick_dialable_peer(&self, torrent: &Arc<TorrentManager>) -> Option<Arc<Peer>> {
        let mode = torrent.mode();
        if !mode.can_accept_connections() {
            return None;
        }
        let peer = {
            let mut lists = torrent.lists.lock().unwrap();
            if lists.connected.len() >= torrent.max_connections() {
                return None;
            }
            let index = lists.available.iter().position(|p| mode.should_connect(p))?;
            lists.available.remove(index)?
        };
        if let Some(ban) = &self.should_ban_peer {
            // A banned candidate is consumed, not reinserted and not counted
            // as a failed attempt.
            if ban(&peer) {
                event!(Level::DEBUG, uri = peer.uri(), "candidate rejected by ban hook");
                return None;
            }
        }
        Some(peer)
    }

    fn rotate_to_tail(&self, torrent: &Arc<TorrentManager>) {
        let mut torrents = self.torrents.lock().unwrap();
        if let Some(index) = torrents.iter().position(|t| Arc::ptr_eq(t, torrent)) {
            let rotated = torrents.remove(index);
            torrents.push(rotated);
        }
    }

    fn start_dial(self: &Arc<Self>, torrent: Arc<TorrentManager>, peer: Arc<Peer>) {
        let connection = match (self.connection_factory)(&peer) {
            Some(connection) => Arc::new(connection),
            None => return,
        };
        self.pending_dials.lock().unwrap().push(PendingDial {
            torrent: torrent.clone(),
            connection: connection.clone(),
            started_at: Instant::now(),
        });
        torrent.lists.lock().unwrap().connecting.push(peer.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.connect_peer(torrent, peer, connection).await;
        });
    }

    fn unregister_pending_dial(&self, connection: &Arc<Connection>) {
        self.pending_dials
            .lock()
            .unwrap()
            .retain(|dial| !Arc::ptr_eq(&dial.connection, connection));
    }

    /// The outbound pipeline: connect, negotiate encryption as initiator,
    /// exchange handshakes, promote to a live session.
    #[instrument(skip_all, fields(uri = %peer.uri()))]
    async fn connect_peer(
        self: Arc<Self>,
        torrent: Arc<TorrentManager>,
        peer: Arc<Peer>,
        connection: Arc<Connection>,
    ) {
        let connect_result = connection.connect().await;
        torrent.lists.lock().unwrap().remove_connecting(&peer);

        if !torrent.is_attached() || !torrent.mode().can_accept_connections() {
            self.unregister_pending_dial(&connection);
            connection.dispose();
            return;
        }

        if let Err(error) = connect_result {
            event!(Level::DEBUG, %error, "outbound connect failed");
            self.unregister_pending_dial(&connection);
            peer.record_failed_attempt();
            connection.dispose();
            torrent.lists.lock().unwrap().busy.push(peer.clone());
            torrent.raise_connection_attempt_failed(peer.uri(), ConnectionFailureReason::Unreachable);
            self.try_connect();
            return;
        }

        let session = PeerSession::outbound(peer.clone(), &torrent, connection.clone());

        if self.open_connections() >= self.settings.max_open_connections {
            self.cleanup(&session);
            return;
        }

        session.set_processing_queue(true);
        {
            let mut lists = torrent.lists.lock().unwrap();
            lists.active.push(peer.clone());
            lists.handshaking.push(session.clone());
        }

        let prepared = Handshake::new(torrent.info_hash(), self.local_peer_id);
        let negotiated = match self
            .negotiator
            .check_outgoing(
                &connection,
                peer.allowed_encryption(),
                &self.settings,
                torrent.info_hash(),
                prepared,
            )
            .await
        {
            Ok(negotiated) => negotiated,
            Err(error) => {
                event!(Level::DEBUG, %error, "encryption negotiation failed");
                peer.narrow_encryption(EncryptionSet::from_methods(&[
                    EncryptionMethod::Rc4Full,
                    EncryptionMethod::Rc4Header,
                ]));
                peer.record_failed_attempt();
                torrent.raise_connection_attempt_failed(
                    peer.uri(),
                    ConnectionFailureReason::EncryptionNegotiationFailed,
                );
                self.cleanup(&session);
                return;
            }
        };
        let negotiated_method = negotiated.method;
        session.install_ciphers(negotiated).await;

        let handshake = {
            let mut guard = session.decryptor.lock().await;
            match guard.as_mut() {
                Some(cipher) => wire::receive_handshake(&connection, cipher.as_mut()).await,
                None => Err(WireError::Connection(ConnectionError::NotConnected)),
            }
        };
        let handshake = handshake.and_then(|handshake| {
            if handshake.info_hash == torrent.info_hash() {
                Ok(handshake)
            } else {
                Err(WireError::BadHandshake)
            }
        });
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(error) => {
                event!(Level::DEBUG, %error, "handshake exchange failed");
                // Only the tier that was actually exercised is narrowed away.
                peer.narrow_encryption(EncryptionSet::from_methods(&[negotiated_method]));
                peer.record_failed_attempt();
                torrent
                    .raise_connection_attempt_failed(peer.uri(), ConnectionFailureReason::HandshakeFailed);
                self.cleanup(&session);
                return;
            }
        };
        peer.set_peer_id(handshake.peer_id);

        if let Err(error) = self.promote(&torrent, &session) {
            event!(Level::DEBUG, %error, "peer promotion failed");
            torrent.raise_connection_attempt_failed(peer.uri(), ConnectionFailureReason::Unknown);
            self.cleanup(&session);
        }
    }

    fn promote(
        self: &Arc<Self>,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
    ) -> Result<(), HandlerError> {
        self.unregister_pending_dial(session.connection_arc());
        {
            let mut lists = torrent.lists.lock().unwrap();
            lists.remove_handshaking(session);
            lists.connected.push(session.clone());
        }
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        torrent.mode().handle_peer_connected(session)?;
        if session.queue_len() > 0 {
            self.spawn_send_pump(session.clone());
        } else {
            session.release_send_pump();
        }
        self.spawn_receive_loop(session.clone());
        session.reset_connected_timestamps();
        Ok(())
    }

    /// Admits a peer whose socket was accepted and handshook by the listener
    /// layer; the session arrives with its cipher pair installed.
    pub fn incoming_connection_accepted(self: &Arc<Self>, session: Arc<PeerSession>) {
        let Some(torrent) = session.torrent() else {
            self.cleanup(&session);
            return;
        };
        let cap = self.settings.max_open_connections.min(torrent.max_connections());
        let remote_is_self = session.peer().peer_id() == Some(self.local_peer_id);
        if self.open_connections() >= cap || remote_is_self {
            self.cleanup(&session);
            return;
        }
        {
            let mut lists = torrent.lists.lock().unwrap();
            if lists.active.iter().any(|p| p.uri() == session.peer().uri()) {
                // The running session for this peer wins; only the new
                // handle is torn down.
                drop(lists);
                session.connection().dispose();
                return;
            }
            lists.available.retain(|p| p.uri() != session.peer().uri());
            lists.active.push(session.peer().clone());
            lists.connected.push(session.clone());
        }
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        session.reset_connected_timestamps();
        if let Err(error) = torrent.mode().handle_peer_connected(&session) {
            event!(Level::DEBUG, uri = session.peer().uri(), %error, "inbound peer rejected");
            self.cleanup(&session);
            return;
        }
        self.spawn_receive_loop(session);
    }

    /// Starts the send pump for a session if one is not already running.
    /// Call after enqueuing messages on the session.
    pub fn process_queue(self: &Arc<Self>, session: &Arc<PeerSession>) {
        if session.try_claim_send_pump() {
            self.spawn_send_pump(session.clone());
        }
    }

    fn spawn_send_pump(self: &Arc<Self>, session: Arc<PeerSession>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.send_queue_pump(session).await;
        });
    }

    /// Drains the session's send queue. Outbound piece payloads are read
    /// from disk into pool buffers just before they go out; the buffer goes
    /// back to the pool when the message is dropped, on every path.
    async fn send_queue_pump(self: Arc<Self>, session: Arc<PeerSession>) {
        let Some(torrent) = session.torrent() else {
            session.release_send_pump();
            return;
        };
        loop {
            let Some(mut message) = session.dequeue_message() else {
                session.release_send_pump();
                // Re-claim if an enqueue slipped in between the last dequeue
                // and the flag clear.
                if session.queue_len() > 0 && session.try_claim_send_pump() {
                    continue;
                }
                return;
            };

            let mut piece_in_flight = false;
            if let PeerMessage::Piece { piece, begin, length, data } = &mut message {
                if data.is_none() {
                    let buffer = self.buffer_pool.get(*length as usize);
                    let offset = u64::from(*piece) * torrent.piece_length() + u64::from(*begin);
                    match self.disk.read(torrent.info_hash(), offset, buffer).await {
                        Ok(filled) => *data = Some(filled),
                        Err(error) => {
                            event!(Level::WARN, %error, "disk read failed while uploading");
                            torrent.try_set_error(TorrentError::ReadFailure);
                            session.release_send_pump();
                            return;
                        }
                    }
                }
                session.record_piece_sent();
                piece_in_flight = true;
            }

            let send_result = {
                let mut guard = session.encryptor.lock().await;
                match guard.as_mut() {
                    Some(cipher) => {
                        wire::send_message(
                            session.connection(),
                            cipher.as_mut(),
                            &message,
                            torrent.upload_limiter(),
                            session.monitor(),
                            torrent.monitor(),
                        )
                        .await
                    }
                    None => Err(WireError::Connection(ConnectionError::NotConnected)),
                }
            };
            drop(message);

            match send_result {
                Ok(()) => {
                    if piece_in_flight {
                        session.complete_piece_request();
                    }
                    session.touch_sent();
                }
                Err(error) => {
                    if !session.is_disposed() {
                        event!(Level::DEBUG, uri = session.peer().uri(), %error, "send failed");
                    }
                    self.cleanup(&session);
                    break;
                }
            }
        }
        session.release_send_pump();
    }

    fn spawn_receive_loop(self: &Arc<Self>, session: Arc<PeerSession>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.receive_loop(session).await;
        });
    }

    /// Pumps framed messages into the torrent mode's handlers until the
    /// connection fails or the session is disposed.
    #[instrument(skip_all, fields(uri = %session.peer().uri()))]
    async fn receive_loop(self: Arc<Self>, session: Arc<PeerSession>) {
        let Some(torrent) = session.torrent() else {
            self.cleanup(&session);
            return;
        };
        loop {
            let received = {
                let mut guard = session.decryptor.lock().await;
                let Some(cipher) = guard.as_mut() else {
                    drop(guard);
                    self.cleanup(&session);
                    return;
                };
                wire::receive_message(
                    session.connection(),
                    cipher.as_mut(),
                    torrent.download_limiter(),
                    session.monitor(),
                    torrent.monitor(),
                    &self.buffer_pool,
                )
                .await
            };
            match received {
                Ok(message) => {
                    if session.is_disposed() {
                        // Dropping the message returns any piece buffer to
                        // the pool.
                        drop(message);
                        continue;
                    }
                    session.touch_received();
                    if message.is_piece() {
                        session.touch_block_received();
                    }
                    if let Err(error) = torrent.mode().handle_message(&session, &message) {
                        event!(Level::DEBUG, %error, "message handler rejected peer");
                        self.cleanup(&session);
                        return;
                    }
                }
                Err(error) => {
                    if !session.is_disposed() {
                        event!(Level::DEBUG, %error, "receive loop terminated");
                    }
                    self.cleanup(&session);
                    return;
                }
            }
        }
    }

    /// The single choke point for ending a peer session: fixes up every
    /// list and counter, decides whether the peer goes back into the
    /// available pool, raises `PeerDisconnected`, disposes the connection,
    /// and kicks the dial scheduler. Idempotent; never fails.
    pub fn cleanup(self: &Arc<Self>, session: &Arc<PeerSession>) {
        if session.mark_disposed() {
            return;
        }
        let peer = session.peer().clone();
        self.unregister_pending_dial(session.connection_arc());

        let Some(torrent) = session.torrent() else {
            session.connection().dispose();
            return;
        };

        let can_reuse = session.connection().can_reconnect()
            && !torrent.lists.lock().unwrap().inactive.contains(peer.uri());

        if let Some(picker) = torrent.picker() {
            picker.cancel_requests(session);
        }

        peer.record_cleanup();

        if let Some(pex_task) = session.take_pex_task() {
            pex_task.abort();
        }

        if !session.am_choking() {
            torrent.decrement_uploading_to();
        }

        {
            let mut lists = torrent.lists.lock().unwrap();
            if lists.remove_connected(session) {
                self.open_connections.fetch_sub(1, Ordering::SeqCst);
            }
            lists.remove_handshaking(session);
            lists.remove_active(&peer);

            let reusable = can_reuse
                && peer.peer_id() != Some(self.local_peer_id)
                && !lists.available.iter().any(|p| p.uri() == peer.uri())
                && peer.cleaned_up_count() < MAX_CLEANUP_CYCLES;
            if reusable {
                lists.available.push_front(peer.clone());
            }
        }

        torrent.raise_peer_disconnected(peer.uri());
        session.connection().dispose();

        // The freed slot may let another candidate through.
        self.try_connect();
    }

    /// Disposes the connection of every pending dial that belongs to the
    /// given torrent, or that has been in flight longer than the stale
    /// threshold. Entries are not removed here; each pipeline drops its own
    /// record on its failure path.
    pub fn cancel_pending_connects(&self, torrent: Option<&Arc<TorrentManager>>) {
        let pending = self.pending_dials.lock().unwrap();
        for dial in pending.iter() {
            let matches_torrent = torrent.is_some_and(|t| Arc::ptr_eq(&dial.torrent, t));
            if matches_torrent || dial.started_at.elapsed() >= STALE_DIAL_TIMEOUT {
                event!(Level::DEBUG, uri = dial.connection.uri(), "cancelling pending dial");
                dial.connection.dispose();
            }
        }
    }
}
