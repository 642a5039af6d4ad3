// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token-bucket limiter for one transfer direction.
///
/// Limiters are shared by `Arc` between a torrent and its peer sessions; the
/// connection manager only ever debits them. A rate of zero disables the
/// limit entirely.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    fill_rate: f64,
    capacity: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.fill_rate > 0.0 {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.fill_rate).min(self.capacity);
        }
    }
}

impl RateLimiter {
    /// `bytes_per_second == 0` means unlimited.
    pub fn new(bytes_per_second: u64) -> Self {
        let fill_rate = bytes_per_second as f64;
        RateLimiter {
            bucket: Mutex::new(Bucket {
                tokens: fill_rate,
                fill_rate,
                capacity: fill_rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub async fn rate(&self) -> u64 {
        self.bucket.lock().await.fill_rate as u64
    }

    /// Waits until `bytes` tokens are available, then debits them. Requests
    /// larger than the bucket capacity are charged by sleeping out their
    /// transfer time instead of waiting for an impossible balance.
    pub async fn throttle(&self, bytes: usize) {
        let debit = bytes as f64;
        let (fill_rate, capacity) = {
            let bucket = self.bucket.lock().await;
            (bucket.fill_rate, bucket.capacity)
        };
        if fill_rate <= 0.0 {
            return;
        }
        if debit > capacity {
            tokio::time::sleep(Duration::from_secs_f64(debit / fill_rate)).await;
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();
                if bucket.tokens >= debit {
                    bucket.tokens -= debit;
                    return;
                }
                let deficit = debit - bucket.tokens;
                Duration::from_secs_f64((deficit / fill_rate).max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }
}
