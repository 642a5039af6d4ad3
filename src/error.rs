// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use strum_macros::EnumIter;
use thiserror::Error;

/// Errors surfaced by a [`crate::connection::Connection`] handle.
///
/// `Disposed` is the cancellation-class error: disposing a handle makes every
/// pending and future operation on it resolve with this variant.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection disposed")]
    Disposed,
    #[error("connection not established")]
    NotConnected,
    #[error("connection already established")]
    AlreadyConnected,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("no allowed encryption method could be negotiated")]
    NoMutualMethod,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the message size limit")]
    MessageTooLarge(usize),
    #[error("unknown message id {0}")]
    UnknownMessage(u8),
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("invalid handshake")]
    BadHandshake,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error, Clone)]
pub enum DiskError {
    #[error("disk manager unavailable")]
    Unavailable,
    #[error("read failed at offset {offset}: {message}")]
    ReadFailed { offset: u64, message: String },
}

/// Returned by policy handlers to reject a peer; tears the session down
/// through the regular cleanup path.
#[derive(Debug, Error)]
#[error("peer rejected: {0}")]
pub struct HandlerError(pub String);

/// Reason carried by the `ConnectionAttemptFailed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ConnectionFailureReason {
    Unreachable,
    EncryptionNegotiationFailed,
    HandshakeFailed,
    Unknown,
}
