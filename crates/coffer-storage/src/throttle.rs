// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transfer admission: a FIFO slot semaphore per direction in front of a
//! token-bucket byte limiter shared by all directions.
//!
//! Every transfer first takes a slot, then pays for each chunk it reads
//! through [`GovernorTicket::consume`]. Both gates observe cooperative
//! cancellation; dropping the ticket releases the slot.

use std::{num::NonZeroU32, sync::Arc};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ThrottleError {
    #[error("transfer cancelled")]
    Cancelled,
}

/// Shared token bucket over bytes per second.
#[derive(Clone)]
pub struct ByteBucket {
    limiter: Arc<DirectRateLimiter>,
    burst: u32,
}

impl ByteBucket {
    /// `None` when the configured rate is 0 (unlimited).
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let rate = NonZeroU32::new(bytes_per_sec.min(u32::MAX as u64) as u32)?;
        // one second's worth of burst
        let quota = Quota::per_second(rate).allow_burst(rate);
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            burst: rate.get(),
        })
    }

    /// Parks until `bytes` tokens are granted. Requests larger than the
    /// burst are paid in burst-sized installments.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.burst as u64) as u32;
            let chunk = NonZeroU32::new(chunk).expect("chunk is non-zero while remaining > 0");
            self.limiter
                .until_n_ready(chunk)
                .await
                .expect("chunk never exceeds the burst capacity");
            remaining -= chunk.get() as u64;
        }
    }
}

/// Admission gate for one transfer direction.
pub struct TransferGovernor {
    slots: Arc<Semaphore>,
    capacity: usize,
    bucket: Option<ByteBucket>,
}

impl TransferGovernor {
    pub fn new(max_concurrent: usize, bucket: Option<ByteBucket>) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            capacity: max_concurrent,
            bucket,
        }
    }

    /// Waits for a slot. Acquisition order is FIFO.
    pub async fn admit(&self, token: CancellationToken) -> Result<GovernorTicket, ThrottleError> {
        let permit = tokio::select! {
            _ = token.cancelled() => return Err(ThrottleError::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.expect("governor semaphore is never closed")
            }
        };
        Ok(GovernorTicket {
            _permit: permit,
            bucket: self.bucket.clone(),
            token,
        })
    }

    /// Transfers currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Held for the lifetime of one transfer.
pub struct GovernorTicket {
    _permit: OwnedSemaphorePermit,
    bucket: Option<ByteBucket>,
    token: CancellationToken,
}

impl GovernorTicket {
    /// Pays for one chunk at the read boundary. Returns
    /// [`ThrottleError::Cancelled`] as soon as cancellation is observed,
    /// including while parked on the bucket.
    pub async fn consume(&self, bytes: u64) -> Result<(), ThrottleError> {
        if self.token.is_cancelled() {
            return Err(ThrottleError::Cancelled);
        }
        if let Some(bucket) = &self.bucket {
            tokio::select! {
                _ = self.token.cancelled() => return Err(ThrottleError::Cancelled),
                _ = bucket.acquire(bytes) => {}
            }
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn zero_rate_means_unlimited() {
        assert!(ByteBucket::new(0).is_none());
    }

    #[tokio::test]
    async fn slots_bound_concurrency() {
        let governor = Arc::new(TransferGovernor::new(3, None));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..20 {
            let governor = governor.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _ticket = governor.admit(CancellationToken::new()).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(governor.in_flight(), 0);
    }

    #[tokio::test]
    async fn admit_observes_cancellation_while_parked() {
        let governor = Arc::new(TransferGovernor::new(1, None));
        let held = governor.admit(CancellationToken::new()).await.unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let governor = governor.clone();
            let token = token.clone();
            tokio::spawn(async move { governor.admit(token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ThrottleError::Cancelled)));
        drop(held);
        // the released slot is available again
        governor.admit(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn consume_fails_after_cancellation() {
        let governor = TransferGovernor::new(1, ByteBucket::new(1024));
        let token = CancellationToken::new();
        let ticket = governor.admit(token.clone()).await.unwrap();
        ticket.consume(100).await.unwrap();
        token.cancel();
        assert!(matches!(
            ticket.consume(100).await,
            Err(ThrottleError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn bucket_paces_consumption_beyond_burst() {
        // 10 KiB/s with a 10 KiB burst: 2x burst needs about a second of
        // refill beyond the initial allowance.
        let bucket = ByteBucket::new(10 * 1024).unwrap();
        let start = Instant::now();
        bucket.acquire(10 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(500));
        bucket.acquire(5 * 1024).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn oversized_request_is_paid_in_installments() {
        let bucket = ByteBucket::new(u32::MAX as u64 + 1).unwrap();
        // larger than the clamped burst; must not error
        bucket.acquire(u32::MAX as u64 + 10).await;
    }
}
