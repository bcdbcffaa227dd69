// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Retry-classifying helpers over [`object_store`].
//!
//! Every operation classifies failures into [`StoreError::NotFound`],
//! [`StoreError::Transient`] or [`StoreError::Permanent`]; only transient
//! failures are retried, with exponential backoff and full jitter.

use std::{sync::Arc, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff};
use bytes::Bytes;
use futures::{Future, TryStreamExt};
use object_store::{DynObjectStore, ObjectMeta, path::Path};
use tracing::debug;

pub type StoreResult<T, E = StoreError> = core::result::Result<T, E>;

/// Largest number of parts a multipart upload may be split into; part
/// sizes grow once a file would need more.
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("transient object store error: `{0}`")]
    Transient(String),

    #[error("permanent object store error: `{0}`")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound,
            object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::UnknownConfigurationKey { .. } => {
                StoreError::Permanent(err.to_string())
            }
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Attempt bound plus backoff seed for transient failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.base_delay,
            current_interval: self.base_delay,
            // factor 1.0 spreads each delay over (0, 2 * interval)
            randomization_factor: 1.0,
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or exhausts the
/// attempt budget.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(policy.base_delay);
                debug!(
                    "transient store error on attempt {attempt}, retrying in {} ms: {err}",
                    delay.as_millis()
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn get_bytes(
    store: &Arc<DynObjectStore>,
    path: &Path,
    policy: &RetryPolicy,
) -> StoreResult<Bytes> {
    with_retry(policy, || async {
        let result = store.get(path).await?;
        Ok(result.bytes().await?)
    })
    .await
}

pub async fn put_bytes(
    store: &Arc<DynObjectStore>,
    path: &Path,
    bytes: Bytes,
    policy: &RetryPolicy,
) -> StoreResult<()> {
    with_retry(policy, || {
        let bytes = bytes.clone();
        async move {
            store.put(path, bytes.into()).await?;
            Ok(())
        }
    })
    .await
}

/// Size of the remote object, or `None` if it does not exist.
pub async fn head_size(
    store: &Arc<DynObjectStore>,
    path: &Path,
    policy: &RetryPolicy,
) -> StoreResult<Option<u64>> {
    let result = with_retry(policy, || async { Ok(store.head(path).await?) }).await;
    match result {
        Ok(meta) => Ok(Some(meta.size as u64)),
        Err(StoreError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn exists(
    store: &Arc<DynObjectStore>,
    path: &Path,
    policy: &RetryPolicy,
) -> StoreResult<bool> {
    Ok(head_size(store, path, policy).await?.is_some())
}

/// Idempotent: deleting a missing key succeeds.
pub async fn delete(
    store: &Arc<DynObjectStore>,
    path: &Path,
    policy: &RetryPolicy,
) -> StoreResult<()> {
    let result = with_retry(policy, || async {
        store.delete(path).await?;
        Ok(())
    })
    .await;
    match result {
        Err(StoreError::NotFound) => Ok(()),
        other => other,
    }
}

/// Collects every object under `prefix`. Listings are finite and
/// paginated by the driver; the whole pass is retried on transient
/// failure.
pub async fn list_all(
    store: &Arc<DynObjectStore>,
    prefix: &Path,
    policy: &RetryPolicy,
) -> StoreResult<Vec<ObjectMeta>> {
    with_retry(policy, || async {
        let entries: Vec<ObjectMeta> = store.list(Some(prefix)).try_collect().await?;
        Ok(entries)
    })
    .await
}

/// Part size for a multipart upload: the configured minimum, grown so the
/// object fits within [`MAX_MULTIPART_PARTS`].
pub fn multipart_part_size(object_size: u64, min_part_size: u64) -> u64 {
    min_part_size.max(object_size.div_ceil(MAX_MULTIPART_PARTS))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use object_store::memory::InMemory;

    use super::*;

    fn memory_store() -> Arc<DynObjectStore> {
        Arc::new(InMemory::new())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = memory_store();
        let path = Path::from("a/b/c");
        put_bytes(&store, &path, Bytes::from_static(b"payload"), &fast_policy())
            .await
            .unwrap();
        let bytes = get_bytes(&store, &path, &fast_policy()).await.unwrap();
        assert_eq!(bytes.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = memory_store();
        let err = get_bytes(&store, &Path::from("missing"), &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(!exists(&store, &Path::from("missing"), &fast_policy())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = memory_store();
        delete(&store, &Path::from("missing"), &fast_policy())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let result: StoreResult<()> = with_retry(&fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Permanent("nope".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StoreError::Transient("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn part_size_respects_part_count_limit() {
        assert_eq!(multipart_part_size(1024, 512), 512);
        // 100 GiB at a 5 MiB floor would exceed 10k parts
        let size = 100 * 1024 * 1024 * 1024u64;
        let part = multipart_part_size(size, 5 * 1024 * 1024);
        assert!(size.div_ceil(part) <= MAX_MULTIPART_PARTS);
    }
}
