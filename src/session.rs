// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::encryption::{Cipher, EncryptionMethod, Negotiated};
use crate::monitor::ConnectionMonitor;
use crate::peer::Peer;
use crate::torrent::TorrentManager;
use crate::wire::PeerMessage;

/// Per-peer runtime state, created on a successful handshake and destroyed
/// exactly once by cleanup.
///
/// The session holds a non-owning reference to its torrent manager; the
/// torrent owns the session through its peer lists. The send pump and the
/// receive loop run as separate tasks and share this state through atomics
/// and short-lived locks.
pub struct PeerSession {
    peer: Arc<Peer>,
    torrent: Weak<TorrentManager>,
    connection: Arc<Connection>,
    pub(crate) encryptor: Mutex<Option<Box<dyn Cipher>>>,
    pub(crate) decryptor: Mutex<Option<Box<dyn Cipher>>>,
    encryption_method: StdMutex<Option<EncryptionMethod>>,
    monitor: Arc<ConnectionMonitor>,
    send_queue: StdMutex<VecDeque<PeerMessage>>,
    processing_queue: AtomicBool,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    disposed: AtomicBool,
    timestamps: StdMutex<Timestamps>,
    pieces_sent: AtomicU32,
    requesting_pieces_count: AtomicU32,
    pex_task: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone, Copy)]
struct Timestamps {
    when_connected: Instant,
    last_message_sent: Instant,
    last_message_received: Instant,
    last_block_received: Instant,
}

impl PeerSession {
    fn build(
        peer: Arc<Peer>,
        torrent: &Arc<TorrentManager>,
        connection: Arc<Connection>,
        ciphers: Option<Negotiated>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (method, encryptor, decryptor) = match ciphers {
            Some(negotiated) => (
                Some(negotiated.method),
                Some(negotiated.encryptor),
                Some(negotiated.decryptor),
            ),
            None => (None, None, None),
        };
        Arc::new(PeerSession {
            peer,
            torrent: Arc::downgrade(torrent),
            connection,
            encryptor: Mutex::new(encryptor),
            decryptor: Mutex::new(decryptor),
            encryption_method: StdMutex::new(method),
            monitor: Arc::new(ConnectionMonitor::new()),
            send_queue: StdMutex::new(VecDeque::new()),
            processing_queue: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            timestamps: StdMutex::new(Timestamps {
                when_connected: now,
                last_message_sent: now,
                last_message_received: now,
                last_block_received: now,
            }),
            pieces_sent: AtomicU32::new(0),
            requesting_pieces_count: AtomicU32::new(0),
            pex_task: StdMutex::new(None),
        })
    }

    /// Session for the outbound pipeline: ciphers are installed after the
    /// encryption negotiation completes.
    pub(crate) fn outbound(
        peer: Arc<Peer>,
        torrent: &Arc<TorrentManager>,
        connection: Arc<Connection>,
    ) -> Arc<Self> {
        Self::build(peer, torrent, connection, None)
    }

    /// Session for a socket the listener layer already accepted and
    /// handshook; the negotiated cipher pair arrives ready-made.
    pub fn inbound(
        peer: Arc<Peer>,
        torrent: &Arc<TorrentManager>,
        connection: Arc<Connection>,
        negotiated: Negotiated,
    ) -> Arc<Self> {
        Self::build(peer, torrent, connection, Some(negotiated))
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn torrent(&self) -> Option<Arc<TorrentManager>> {
        self.torrent.upgrade()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn connection_arc(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn encryption_method(&self) -> Option<EncryptionMethod> {
        *self.encryption_method.lock().unwrap()
    }

    pub(crate) async fn install_ciphers(&self, negotiated: Negotiated) {
        *self.encryption_method.lock().unwrap() = Some(negotiated.method);
        *self.encryptor.lock().await = Some(negotiated.encryptor);
        *self.decryptor.lock().await = Some(negotiated.decryptor);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Returns whether the session was already disposed; cleanup's
    /// idempotence check.
    pub(crate) fn mark_disposed(&self) -> bool {
        self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::SeqCst)
    }

    pub fn set_am_choking(&self, choking: bool) {
        self.am_choking.store(choking, Ordering::SeqCst);
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::SeqCst)
    }

    pub fn set_am_interested(&self, interested: bool) {
        self.am_interested.store(interested, Ordering::SeqCst);
    }

    /// Appends a message to the send queue. Queued piece messages count
    /// toward `requesting_pieces_count` until the pump sends them.
    pub fn enqueue_message(&self, message: PeerMessage) {
        if message.is_piece() {
            self.requesting_pieces_count.fetch_add(1, Ordering::SeqCst);
        }
        self.send_queue.lock().unwrap().push_back(message);
    }

    pub(crate) fn dequeue_message(&self) -> Option<PeerMessage> {
        self.send_queue.lock().unwrap().pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.send_queue.lock().unwrap().len()
    }

    /// Claims the single-flight pump slot. Only the caller that flips the
    /// flag may run a pump.
    pub(crate) fn try_claim_send_pump(&self) -> bool {
        self.processing_queue
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_send_pump(&self) {
        self.processing_queue.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_processing_queue(&self, processing: bool) {
        self.processing_queue.store(processing, Ordering::SeqCst);
    }

    pub fn is_processing_queue(&self) -> bool {
        self.processing_queue.load(Ordering::SeqCst)
    }

    pub fn pieces_sent(&self) -> u32 {
        self.pieces_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn record_piece_sent(&self) {
        self.pieces_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn requesting_pieces_count(&self) -> u32 {
        self.requesting_pieces_count.load(Ordering::SeqCst)
    }

    pub(crate) fn complete_piece_request(&self) {
        let _ = self
            .requesting_pieces_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }

    pub fn when_connected(&self) -> Instant {
        self.timestamps.lock().unwrap().when_connected
    }

    pub fn last_message_sent(&self) -> Instant {
        self.timestamps.lock().unwrap().last_message_sent
    }

    pub fn last_message_received(&self) -> Instant {
        self.timestamps.lock().unwrap().last_message_received
    }

    pub fn last_block_received(&self) -> Instant {
        self.timestamps.lock().unwrap().last_block_received
    }

    pub(crate) fn touch_sent(&self) {
        self.timestamps.lock().unwrap().last_message_sent = Instant::now();
    }

    pub(crate) fn touch_received(&self) {
        self.timestamps.lock().unwrap().last_message_received = Instant::now();
    }

    pub(crate) fn touch_block_received(&self) {
        self.timestamps.lock().unwrap().last_block_received = Instant::now();
    }

    pub(crate) fn reset_connected_timestamps(&self) {
        let mut timestamps = self.timestamps.lock().unwrap();
        let now = Instant::now();
        timestamps.when_connected = now;
        timestamps.last_block_received = now;
    }

    /// Attaches a peer-exchange task to this session; cleanup aborts it.
    pub fn set_pex_task(&self, task: JoinHandle<()>) {
        let mut slot = self.pex_task.lock().unwrap();
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn take_pex_task(&self) -> Option<JoinHandle<()>> {
        self.pex_task.lock().unwrap().take()
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("uri", &self.peer.uri())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
