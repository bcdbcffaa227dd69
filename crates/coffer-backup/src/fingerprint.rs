// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Cache of already-uploaded remote keys.
//!
//! SSTables are immutable, so `(remote key, size)` identifies an upload.
//! Entries recorded by the upload pipeline carry both the uncompressed
//! source size and the compressed remote size and are trusted for the
//! skip decision. Entries warmed from a startup listing only know the
//! remote (compressed) size; those are never skipped on key alone — the
//! uploader stages the candidate and compares compressed sizes before
//! deciding, so a short object left behind by an interrupted round is
//! re-uploaded rather than silently kept.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use coffer_storage::{RetryPolicy, object_store as store_util};
use object_store::{DynObjectStore, path::Path};
use parking_lot::RwLock;
use tracing::info;

use crate::{
    error::BackupResult,
    remote_path::{self, KeyLayout},
};

#[derive(Debug, Clone, Copy)]
pub struct Fingerprint {
    /// Uncompressed source size; 0 when the upload was only observed in
    /// a listing and the source size is unknown.
    pub size: u64,
    /// Size of the compressed remote object.
    pub compressed_size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct UploadFingerprintCache {
    inner: RwLock<HashMap<String, Fingerprint>>,
}

impl UploadFingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates the cache by listing every data key under the token's
    /// prefix. Meta objects and foreign keys are ignored.
    pub async fn warm_up(
        &self,
        store: &Arc<DynObjectStore>,
        layout: &KeyLayout,
        retry: &RetryPolicy,
    ) -> BackupResult<usize> {
        let prefix = Path::from(layout.root());
        let listing = store_util::list_all(store, &prefix, retry).await?;
        let mut cached = 0;
        let mut inner = self.inner.write();
        for meta in listing {
            let key = meta.location.to_string();
            let Ok(path) = remote_path::decode(&key) else {
                continue;
            };
            if !path.kind().is_data() {
                continue;
            }
            // the listing only reveals the compressed size; the source
            // size stays unknown until the uploader verifies the key
            inner.insert(
                key,
                Fingerprint {
                    size: 0,
                    compressed_size: meta.size as u64,
                    uploaded_at: meta.last_modified,
                },
            );
            cached += 1;
        }
        drop(inner);
        info!("fingerprint cache warmed with {cached} uploaded keys");
        Ok(cached)
    }

    /// True when the key is known with a matching, verified uncompressed
    /// size. Entries warmed from a listing never match here; the
    /// uploader settles those by compressed-size comparison.
    pub fn contains(&self, remote_key: &str, size: u64) -> bool {
        self.inner
            .read()
            .get(remote_key)
            .is_some_and(|fingerprint| fingerprint.size != 0 && fingerprint.size == size)
    }

    pub fn get(&self, remote_key: &str) -> Option<Fingerprint> {
        self.inner.read().get(remote_key).copied()
    }

    pub fn insert(
        &self,
        remote_key: String,
        size: u64,
        compressed_size: u64,
        uploaded_at: DateTime<Utc>,
    ) {
        self.inner.write().insert(
            remote_key,
            Fingerprint {
                size,
                compressed_size,
                uploaded_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use coffer_storage::object_store::put_bytes;
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn warm_up_indexes_data_keys_only() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let retry = RetryPolicy::default();
        let layout = KeyLayout::new("b", "p", "Test", "100");
        for key in [
            "b/p/tseT/100/201806051234/ks1/cf1/SST/a-1-x.db",
            "b/p/tseT/100/201806051234/ks1/cf1/SNAP/b-1-x.db",
            "b/p/tseT/100/META/201806051234/manifest.json",
            "b/p/tseT/200/201806051234/ks1/cf1/SST/other-token.db",
        ] {
            put_bytes(&store, &Path::from(key), Bytes::from_static(b"abc"), &retry)
                .await
                .unwrap();
        }

        let cache = UploadFingerprintCache::new();
        let cached = cache.warm_up(&store, &layout, &retry).await.unwrap();
        assert_eq!(cached, 2);
        let warmed = cache
            .get("b/p/tseT/100/201806051234/ks1/cf1/SST/a-1-x.db")
            .unwrap();
        assert_eq!(warmed.size, 0);
        assert_eq!(warmed.compressed_size, 3);
        assert!(cache
            .get("b/p/tseT/100/META/201806051234/manifest.json")
            .is_none());
    }

    #[test]
    fn warmed_entries_never_match_on_size() {
        let cache = UploadFingerprintCache::new();
        cache.insert("k".into(), 0, 3, Utc::now());
        // unknown source size is not a match, whatever the caller claims
        assert!(!cache.contains("k", 0));
        assert!(!cache.contains("k", 3));
        assert!(!cache.contains("k", 12345));
    }

    #[test]
    fn verified_entries_require_an_exact_size_match() {
        let cache = UploadFingerprintCache::new();
        cache.insert("k".into(), 10, 7, Utc::now());
        assert!(cache.contains("k", 10));
        assert!(!cache.contains("k", 11));
        assert!(!cache.contains("other", 10));
    }
}
