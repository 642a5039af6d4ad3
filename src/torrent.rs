// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use tracing::{event, Level};

use crate::error::{ConnectionFailureReason, HandlerError};
use crate::monitor::ConnectionMonitor;
use crate::peer::{InfoHash, Peer};
use crate::rate_limiter::RateLimiter;
use crate::session::PeerSession;
use crate::wire::PeerMessage;

/// Per-torrent policy object. The connection manager consults it before
/// dialing or admitting peers and hands it every promoted session and every
/// received message; it never mutates torrent state behind its back.
pub trait TorrentMode: Send + Sync {
    fn can_accept_connections(&self) -> bool;
    fn should_connect(&self, peer: &Peer) -> bool;
    fn handle_peer_connected(&self, session: &Arc<PeerSession>) -> Result<(), HandlerError>;
    fn handle_message(
        &self,
        session: &Arc<PeerSession>,
        message: &PeerMessage,
    ) -> Result<(), HandlerError>;
}

/// Request-cancellation seam toward the piece picker; invoked by cleanup for
/// every torn-down session.
pub trait PiecePicker: Send + Sync {
    fn cancel_requests(&self, session: &PeerSession);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentEvent {
    ConnectionAttemptFailed { uri: String, reason: ConnectionFailureReason },
    PeerDisconnected { uri: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentError {
    ReadFailure,
}

pub struct TorrentParameters {
    pub info_hash: InfoHash,
    pub piece_length: u64,
    pub max_connections: usize,
    pub mode: Arc<dyn TorrentMode>,
    pub picker: Option<Arc<dyn PiecePicker>>,
    pub download_limiter: Arc<RateLimiter>,
    pub upload_limiter: Arc<RateLimiter>,
    pub event_tx: mpsc::Sender<TorrentEvent>,
}

/// The connection manager's per-torrent bookkeeping: the peer lists, the
/// policy mode, limiters, the byte monitor, and the event emitters.
pub struct TorrentManager {
    info_hash: InfoHash,
    piece_length: u64,
    max_connections: usize,
    mode: StdMutex<Arc<dyn TorrentMode>>,
    picker: Option<Arc<dyn PiecePicker>>,
    download_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    monitor: Arc<ConnectionMonitor>,
    event_tx: mpsc::Sender<TorrentEvent>,
    attached: AtomicBool,
    uploading_to: AtomicUsize,
    error: StdMutex<Option<TorrentError>>,
    pub(crate) lists: StdMutex<PeerLists>,
}

impl TorrentManager {
    pub fn new(params: TorrentParameters) -> Arc<Self> {
        Arc::new(TorrentManager {
            info_hash: params.info_hash,
            piece_length: params.piece_length,
            max_connections: params.max_connections,
            mode: StdMutex::new(params.mode),
            picker: params.picker,
            download_limiter: params.download_limiter,
            upload_limiter: params.upload_limiter,
            monitor: Arc::new(ConnectionMonitor::new()),
            event_tx: params.event_tx,
            attached: AtomicBool::new(false),
            uploading_to: AtomicUsize::new(0),
            error: StdMutex::new(None),
            lists: StdMutex::new(PeerLists::default()),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn mode(&self) -> Arc<dyn TorrentMode> {
        self.mode.lock().unwrap().clone()
    }

    pub fn set_mode(&self, mode: Arc<dyn TorrentMode>) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn picker(&self) -> Option<Arc<dyn PiecePicker>> {
        self.picker.clone()
    }

    pub fn download_limiter(&self) -> &RateLimiter {
        &self.download_limiter
    }

    pub fn upload_limiter(&self) -> &RateLimiter {
        &self.upload_limiter
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    /// Adds a discovered candidate to the available pool unless the peer is
    /// already tracked in any list.
    pub fn add_peer(&self, peer: Arc<Peer>) -> bool {
        let mut lists = self.lists.lock().unwrap();
        if lists.knows_uri(peer.uri()) {
            return false;
        }
        lists.available.push_back(peer);
        true
    }

    /// Marks a peer as not worth reconnecting to; cleanup will drop it
    /// instead of recycling it into the available pool.
    pub fn mark_inactive(&self, uri: &str) {
        self.lists.lock().unwrap().inactive.insert(uri.to_string());
    }

    pub fn connected_count(&self) -> usize {
        self.lists.lock().unwrap().connected.len()
    }

    pub fn available_count(&self) -> usize {
        self.lists.lock().unwrap().available.len()
    }

    pub fn uploading_to(&self) -> usize {
        self.uploading_to.load(Ordering::SeqCst)
    }

    pub fn increment_uploading_to(&self) {
        self.uploading_to.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_uploading_to(&self) {
        let _ = self
            .uploading_to
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
    }

    pub fn error(&self) -> Option<TorrentError> {
        *self.error.lock().unwrap()
    }

    /// Records the first error only; later errors are logged and dropped.
    pub fn try_set_error(&self, error: TorrentError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            event!(Level::WARN, info_hash = ?self.info_hash, ?error, "torrent entered error state");
            *slot = Some(error);
        }
    }

    pub(crate) fn raise_connection_attempt_failed(
        &self,
        uri: &str,
        reason: ConnectionFailureReason,
    ) {
        event!(Level::DEBUG, uri, ?reason, "connection attempt failed");
        let _ = self
            .event_tx
            .try_send(TorrentEvent::ConnectionAttemptFailed { uri: uri.to_string(), reason });
    }

    pub(crate) fn raise_peer_disconnected(&self, uri: &str) {
        event!(Level::DEBUG, uri, "peer disconnected");
        let _ = self.event_tx.try_send(TorrentEvent::PeerDisconnected { uri: uri.to_string() });
    }
}

impl std::fmt::Debug for TorrentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentManager")
            .field("info_hash", &self.info_hash)
            .field("connected", &self.connected_count())
            .finish()
    }
}

/// The mutually-exclusive per-torrent peer lists. `available` is ordered:
/// discovery appends to the back, cleanup reinserts at the front so the dial
/// scheduler prefers recently-dropped peers.
#[derive(Default)]
pub(crate) struct PeerLists {
    pub available: VecDeque<Arc<Peer>>,
    pub connecting: Vec<Arc<Peer>>,
    pub active: Vec<Arc<Peer>>,
    pub handshaking: Vec<Arc<PeerSession>>,
    pub connected: Vec<Arc<PeerSession>>,
    pub busy: Vec<Arc<Peer>>,
    pub inactive: HashSet<String>,
}

impl PeerLists {
    pub fn knows_uri(&self, uri: &str) -> bool {
        self.available.iter().any(|p| p.uri() == uri)
            || self.connecting.iter().any(|p| p.uri() == uri)
            || self.active.iter().any(|p| p.uri() == uri)
            || self.busy.iter().any(|p| p.uri() == uri)
    }

    pub fn remove_connecting(&mut self, peer: &Peer) {
        self.connecting.retain(|p| p.uri() != peer.uri());
    }

    pub fn remove_active(&mut self, peer: &Peer) {
        self.active.retain(|p| p.uri() != peer.uri());
    }

    pub fn remove_handshaking(&mut self, session: &Arc<PeerSession>) -> bool {
        let before = self.handshaking.len();
        self.handshaking.retain(|s| !Arc::ptr_eq(s, session));
        self.handshaking.len() != before
    }

    pub fn remove_connected(&mut self, session: &Arc<PeerSession>) -> bool {
        let before = self.connected.len();
        self.connected.retain(|s| !Arc::ptr_eq(s, session));
        self.connected.len() != before
    }
}
