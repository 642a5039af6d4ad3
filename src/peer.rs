// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::encryption::EncryptionSet;

/// The 20-byte identifier a peer reports in its handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(raw: [u8; 20]) -> Self {
        PeerId(raw)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// SHA-1 of a torrent's info dictionary, treated as opaque here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl From<[u8; 20]> for InfoHash {
    fn from(raw: [u8; 20]) -> Self {
        InfoHash(raw)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// A dialable candidate: the network identity of a remote endpoint.
///
/// Candidates are shared (`Arc<Peer>`) between the per-torrent peer lists and
/// in-flight pipelines, so the mutable bookkeeping is interior: attempt and
/// cleanup counters, the remote id once the handshake reveals it, and the set
/// of encryption methods still worth offering (narrowed as negotiations
/// fail).
#[derive(Debug)]
pub struct Peer {
    uri: String,
    peer_id: Mutex<Option<PeerId>>,
    failed_connection_attempts: AtomicU32,
    cleaned_up_count: AtomicU32,
    allowed_encryption: AtomicU8,
}

impl Peer {
    pub fn new(uri: impl Into<String>, allowed_encryption: EncryptionSet) -> Self {
        Peer {
            uri: uri.into(),
            peer_id: Mutex::new(None),
            failed_connection_attempts: AtomicU32::new(0),
            cleaned_up_count: AtomicU32::new(0),
            allowed_encryption: AtomicU8::new(allowed_encryption.bits()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock().unwrap()
    }

    pub fn set_peer_id(&self, id: PeerId) {
        *self.peer_id.lock().unwrap() = Some(id);
    }

    pub fn failed_connection_attempts(&self) -> u32 {
        self.failed_connection_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn record_failed_attempt(&self) {
        self.failed_connection_attempts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn cleaned_up_count(&self) -> u32 {
        self.cleaned_up_count.load(Ordering::SeqCst)
    }

    pub(crate) fn record_cleanup(&self) {
        self.cleaned_up_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn allowed_encryption(&self) -> EncryptionSet {
        EncryptionSet::from_bits(self.allowed_encryption.load(Ordering::SeqCst))
    }

    /// Removes the given methods from the peer's allowed set. Narrowing only
    /// ever shrinks the set, so repeated failures walk the peer down the
    /// encryption tiers monotonically.
    pub(crate) fn narrow_encryption(&self, removed: EncryptionSet) {
        self.allowed_encryption.fetch_and(!removed.bits(), Ordering::SeqCst);
    }
}
