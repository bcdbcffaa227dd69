// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Expiry of old backups: every object under the token's prefix whose
//! embedded instant is older than the retention window is deleted, data
//! and manifests alike.

use std::sync::Arc;

use chrono::Duration;
use coffer_storage::{RetryPolicy, object_store as store_util};
use object_store::{DynObjectStore, path::Path as StorePath};
use tracing::{info, warn};

use crate::{
    clock::Clock,
    error::BackupResult,
    remote_path::{self, KeyLayout},
};

pub struct RetentionSweeper {
    store: Arc<DynObjectStore>,
    layout: KeyLayout,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<DynObjectStore>,
        layout: KeyLayout,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            layout,
            clock,
            retry,
            retention_days,
        }
    }

    /// Deletes expired objects; returns how many were removed. A
    /// retention of 0 days keeps everything.
    pub async fn sweep(&self) -> BackupResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }
        let cutoff = self.clock.now() - Duration::days(self.retention_days as i64);
        let prefix = StorePath::from(self.layout.root());
        let listing = store_util::list_all(&self.store, &prefix, &self.retry).await?;
        let mut deleted = 0;
        for meta in listing {
            let key = meta.location.to_string();
            let Ok(path) = remote_path::decode(&key) else {
                warn!("unrecognized key under the backup prefix: {key}");
                continue;
            };
            if path.time() >= cutoff {
                continue;
            }
            store_util::delete(&self.store, &meta.location, &self.retry).await?;
            deleted += 1;
        }
        if deleted > 0 {
            info!(
                "retention sweep removed {deleted} objects older than {} days",
                self.retention_days
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use coffer_storage::object_store::{exists, put_bytes};
    use object_store::memory::InMemory;

    use super::*;
    use crate::clock::FixedClock;

    #[tokio::test]
    async fn sweep_removes_only_expired_objects() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let retry = RetryPolicy::default();
        let old_key = "b/p/tseT/100/201806051234/ks1/cf1/SST/old-1-x.db";
        let new_key = "b/p/tseT/100/201807051234/ks1/cf1/SST/new-1-x.db";
        let old_meta = "b/p/tseT/100/META/201806051234/manifest.json";
        for key in [old_key, new_key, old_meta] {
            put_bytes(&store, &StorePath::from(key), Bytes::from_static(b"x"), &retry)
                .await
                .unwrap();
        }

        let sweeper = RetentionSweeper::new(
            store.clone(),
            KeyLayout::new("b", "p", "Test", "100"),
            Arc::new(FixedClock(
                Utc.with_ymd_and_hms(2018, 7, 10, 0, 0, 0).unwrap(),
            )),
            retry,
            7,
        );
        assert_eq!(sweeper.sweep().await.unwrap(), 2);
        assert!(!exists(&store, &StorePath::from(old_key), &retry).await.unwrap());
        assert!(!exists(&store, &StorePath::from(old_meta), &retry).await.unwrap());
        assert!(exists(&store, &StorePath::from(new_key), &retry).await.unwrap());
    }

    #[tokio::test]
    async fn zero_retention_keeps_everything() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let sweeper = RetentionSweeper::new(
            store,
            KeyLayout::new("b", "p", "Test", "100"),
            Arc::new(FixedClock(Utc::now())),
            RetryPolicy::default(),
            0,
        );
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }
}
