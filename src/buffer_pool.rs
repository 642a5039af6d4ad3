// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MIN_CLASS_BYTES: usize = 64;

/// Process-wide pool for piece-data buffers.
///
/// Storage is recycled through power-of-two size classes. Every borrow is
/// returned exactly once: [`PoolBuffer`] gives the bytes back on drop, on
/// every exit path. The pool tracks outstanding borrows so tests can assert
/// conservation.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    shelves: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    outstanding: AtomicUsize,
    total_borrows: AtomicU64,
    total_returns: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a zeroed buffer of exactly `len` bytes.
    pub fn get(&self, len: usize) -> PoolBuffer {
        let class = len.next_power_of_two().max(MIN_CLASS_BYTES);
        let mut storage = {
            let mut shelves = self.inner.shelves.lock().unwrap();
            shelves.get_mut(&class).and_then(Vec::pop).unwrap_or_else(|| Vec::with_capacity(class))
        };
        storage.clear();
        storage.resize(len, 0);
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.total_borrows.fetch_add(1, Ordering::SeqCst);
        PoolBuffer {
            storage: Some(storage),
            class,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Borrows currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn total_borrows(&self) -> u64 {
        self.inner.total_borrows.load(Ordering::SeqCst)
    }

    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::SeqCst)
    }
}

/// A borrowed buffer; dereferences to its byte slice and returns the storage
/// to the pool when dropped.
pub struct PoolBuffer {
    storage: Option<Vec<u8>>,
    class: usize,
    pool: Arc<PoolInner>,
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.storage.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            let mut shelves = self.pool.shelves.lock().unwrap();
            shelves.entry(self.class).or_default().push(storage);
            drop(shelves);
            self.pool.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.pool.total_returns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer").field("len", &self.len()).finish()
    }
}
