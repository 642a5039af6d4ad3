// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format, Toml};
use figment::Figment;

use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

use crate::encryption::EncryptionMethod;

/// Pending dials older than this are swept by `cancel_pending_connects`.
pub const STALE_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer is dropped from the available pool after this many cleanup cycles.
pub const MAX_CLEANUP_CYCLES: u32 = 5;

/// The receive path reads message payloads in slices of this size so the
/// rate limiter can meter transfers at a sub-message granularity.
pub const RECEIVE_CHUNK_SIZE: usize = 2096 + 64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Global cap on fully connected peers, across all torrents.
    pub max_open_connections: usize,
    /// Global cap on in-flight outbound dials that have not completed their
    /// handshake yet.
    pub max_half_open_connections: usize,
    /// Default per-torrent connection cap.
    pub max_connections_per_torrent: usize,
    /// Encryption methods this client is willing to use, in preference order.
    pub allowed_encryption: Vec<EncryptionMethod>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_open_connections: 150,
            max_half_open_connections: 8,
            max_connections_per_torrent: 60,
            allowed_encryption: vec![
                EncryptionMethod::Rc4Full,
                EncryptionMethod::Rc4Header,
                EncryptionMethod::PlainText,
            ],
        }
    }
}

/// Loads settings from a TOML file, with `SWARMLINK_`-prefixed environment
/// variables taking precedence. Missing values fall back to the defaults.
pub fn load_settings(config_path: &Path) -> Result<Settings, figment::Error> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SWARMLINK_"))
        .extract()
}
