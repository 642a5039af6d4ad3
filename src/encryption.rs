// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::config::Settings;
use crate::connection::Connection;
use crate::error::EncryptionError;
use crate::peer::InfoHash;
use crate::wire::Handshake;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum EncryptionMethod {
    PlainText,
    Rc4Header,
    Rc4Full,
}

impl EncryptionMethod {
    fn bit(self) -> u8 {
        match self {
            EncryptionMethod::PlainText => 0b001,
            EncryptionMethod::Rc4Header => 0b010,
            EncryptionMethod::Rc4Full => 0b100,
        }
    }
}

/// A small set of [`EncryptionMethod`]s, stored as bits so a peer's allowed
/// set can live in an atomic.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncryptionSet(u8);

const ALL_METHOD_BITS: u8 = 0b111;

impl EncryptionSet {
    pub const NONE: EncryptionSet = EncryptionSet(0);

    pub fn all() -> Self {
        EncryptionSet(ALL_METHOD_BITS)
    }

    pub fn from_methods(methods: &[EncryptionMethod]) -> Self {
        EncryptionSet(methods.iter().fold(0, |bits, m| bits | m.bit()))
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        EncryptionSet(bits & ALL_METHOD_BITS)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, method: EncryptionMethod) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn without(self, removed: EncryptionSet) -> Self {
        EncryptionSet(self.0 & !removed.0)
    }

    pub fn intersection(self, other: EncryptionSet) -> Self {
        EncryptionSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_strict_subset_of(self, other: EncryptionSet) -> bool {
        self.0 != other.0 && self.0 & other.0 == self.0
    }

    pub fn methods(self) -> impl Iterator<Item = EncryptionMethod> {
        EncryptionMethod::iter().filter(move |m| self.contains(*m))
    }
}

impl fmt::Debug for EncryptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods()).finish()
    }
}

/// A negotiated stream transform. Plaintext connections use the no-op
/// implementation; RC4 connections apply the keystream in place.
pub trait Cipher: Send {
    fn apply(&mut self, data: &mut [u8]);
}

pub struct PlainTextCipher;

impl Cipher for PlainTextCipher {
    fn apply(&mut self, _data: &mut [u8]) {}
}

/// RC4 keystream cipher. Both ends discard the first 1024 keystream bytes,
/// as the obfuscation handshake requires.
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (index, slot) in state.iter_mut().enumerate() {
            *slot = index as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        let mut cipher = Rc4 { state, i: 0, j: 0 };
        cipher.skip(1024);
        cipher
    }

    fn next_key_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let index = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[index as usize]
    }

    fn skip(&mut self, count: usize) {
        for _ in 0..count {
            self.next_key_byte();
        }
    }
}

impl Cipher for Rc4 {
    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_key_byte();
        }
    }
}

/// The outcome of a successful negotiation: which tier was agreed on, and
/// the transforms for each direction.
pub struct Negotiated {
    pub method: EncryptionMethod,
    pub encryptor: Box<dyn Cipher>,
    pub decryptor: Box<dyn Cipher>,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated").field("method", &self.method).finish()
    }
}

/// Negotiates encryption as the connection initiator and sends the prepared
/// handshake through whatever transform was agreed on. Fails if no method in
/// `allowed` (intersected with the client policy) can complete.
pub trait EncryptionNegotiator: Send + Sync {
    fn check_outgoing<'a>(
        &'a self,
        connection: &'a Connection,
        allowed: EncryptionSet,
        settings: &'a Settings,
        info_hash: InfoHash,
        handshake: Handshake,
    ) -> BoxFuture<'a, Result<Negotiated, EncryptionError>>;
}

/// Negotiator for clients that only speak unencrypted connections: succeeds
/// iff plaintext is permitted by both the peer's set and the client policy,
/// and sends the handshake in the clear.
pub struct PlainTextNegotiator;

impl EncryptionNegotiator for PlainTextNegotiator {
    fn check_outgoing<'a>(
        &'a self,
        connection: &'a Connection,
        allowed: EncryptionSet,
        settings: &'a Settings,
        _info_hash: InfoHash,
        handshake: Handshake,
    ) -> BoxFuture<'a, Result<Negotiated, EncryptionError>> {
        Box::pin(async move {
            let policy = EncryptionSet::from_methods(&settings.allowed_encryption);
            if !allowed.intersection(policy).contains(EncryptionMethod::PlainText) {
                return Err(EncryptionError::NoMutualMethod);
            }
            connection.send(&handshake.encode()).await?;
            Ok(Negotiated {
                method: EncryptionMethod::PlainText,
                encryptor: Box::new(PlainTextCipher),
                decryptor: Box::new(PlainTextCipher),
            })
        })
    }
}
