// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Peer connection management for a BitTorrent-like client.
//!
//! The crate centers on [`ConnectionManager`]: a dial scheduler that keeps
//! outbound connections flowing within global open and half-open budgets, an
//! outbound pipeline (connect, encryption negotiation, handshake exchange,
//! promotion), an inbound admission path for sockets the listener layer has
//! already handshaken, per-peer sessions with a send-queue pump and a receive
//! loop, and a single idempotent cleanup choke point that decides whether a
//! peer is recycled into the candidate pool.
//!
//! Policy stays outside: each torrent carries a [`TorrentMode`] that answers
//! whether to connect and handles promoted peers and their messages, a piece
//! picker seam for request cancellation, and rate limiters shared by
//! reference. Disk access goes through the [`disk::DiskClient`] actor channel
//! and piece payloads ride pooled buffers that are returned exactly once.

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod disk;
pub mod encryption;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod peer;
pub mod rate_limiter;
pub mod session;
pub mod torrent;
pub mod wire;

pub use buffer_pool::BufferPool;
pub use config::{load_settings, Settings};
pub use connection::Connection;
pub use encryption::{Cipher, EncryptionMethod, EncryptionNegotiator, EncryptionSet};
pub use error::ConnectionFailureReason;
pub use manager::{ConnectionManager, ConnectionManagerParameters};
pub use peer::{InfoHash, Peer, PeerId};
pub use rate_limiter::RateLimiter;
pub use session::PeerSession;
pub use torrent::{
    PiecePicker, TorrentEvent, TorrentManager, TorrentMode, TorrentParameters,
};
pub use wire::{Handshake, PeerMessage};
