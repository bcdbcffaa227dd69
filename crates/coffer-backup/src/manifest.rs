// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-round manifests: the self-describing file list that doubles as the
//! round's commit marker.
//!
//! Two dialects exist in the wild. The legacy v1 manifest is a flat JSON
//! array of remote keys under `<root>/META/<instant>-meta.json`; v2 is a
//! structured document under `<root>/META/<instant>/manifest.json`. The
//! reader accepts both and normalizes to the v2 shape.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use coffer_storage::{RetryPolicy, object_store as store_util};
use object_store::{DynObjectStore, path::Path};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{BackupError, BackupResult},
    remote_path::{self, FileKind, KeyLayout, format_instant},
};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const MANIFEST_VERSION: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub keyspace: String,
    pub column_family: String,
    pub file_name: String,
    pub remote_key: String,
    pub size: u64,
    pub compressed_size: u64,
    /// Hex sha256 of the uncompressed content; empty for entries
    /// normalized out of a v1 manifest.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestV2 {
    pub version: u8,
    pub cluster: String,
    pub token: String,
    pub instant: String,
    pub schema_hash: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// Flat list of remote keys.
    V1(Vec<String>),
    V2(ManifestV2),
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> BackupResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
        if value.is_array() {
            let keys: Vec<String> = serde_json::from_value(value)
                .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
            return Ok(Manifest::V1(keys));
        }
        let manifest: ManifestV2 = serde_json::from_value(value)
            .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(BackupError::ManifestBroken(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(Manifest::V2(manifest))
    }

    /// Normalizes either dialect to the v2 shape. v1 entries recover
    /// keyspace, column family and file name from their keys; sizes and
    /// checksums are unknown and left zeroed, which disables the
    /// same-size restore skip for them.
    pub fn into_v2(self, instant: DateTime<Utc>) -> BackupResult<ManifestV2> {
        match self {
            Manifest::V2(manifest) => Ok(manifest),
            Manifest::V1(keys) => {
                let mut cluster = String::new();
                let mut token = String::new();
                let mut files = Vec::with_capacity(keys.len());
                for key in keys {
                    let path = remote_path::decode(&key)
                        .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
                    if cluster.is_empty() {
                        cluster = path.cluster().to_owned();
                        token = path.token().to_owned();
                    }
                    files.push(ManifestEntry {
                        keyspace: path.keyspace().to_owned(),
                        column_family: path.column_family().to_owned(),
                        file_name: path.file_name().to_owned(),
                        remote_key: key,
                        size: 0,
                        compressed_size: 0,
                        sha256: String::new(),
                    });
                }
                files.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
                Ok(ManifestV2 {
                    version: MANIFEST_VERSION,
                    cluster,
                    token,
                    instant: format_instant(instant),
                    schema_hash: schema_hash(&files),
                    files,
                })
            }
        }
    }
}

/// Hex sha256 over the sorted distinct `(keyspace, column_family)` pairs
/// of the file set. Stands in for the database schema version, which the
/// control channel deliberately does not expose.
pub fn schema_hash(files: &[ManifestEntry]) -> String {
    let mut pairs: Vec<(&str, &str)> = files
        .iter()
        .map(|entry| (entry.keyspace.as_str(), entry.column_family.as_str()))
        .collect();
    pairs.sort_unstable();
    pairs.dedup();
    let mut hasher = Sha256::new();
    for (keyspace, column_family) in pairs {
        hasher.update(keyspace.as_bytes());
        hasher.update([0u8]);
        hasher.update(column_family.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Accumulates manifest entries while a round's uploads complete, in any
/// order; `build` produces the canonical sorted document.
pub struct RoundManifest {
    layout: KeyLayout,
    instant: DateTime<Utc>,
    entries: Mutex<Vec<ManifestEntry>>,
}

impl RoundManifest {
    pub fn new(layout: KeyLayout, instant: DateTime<Utc>) -> Self {
        Self {
            layout,
            instant,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, entry: ManifestEntry) {
        self.entries.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn meta_key(&self) -> String {
        format!(
            "{}/{}/{MANIFEST_FILE_NAME}",
            self.layout.meta_root(),
            format_instant(self.instant)
        )
    }

    pub fn build(&self) -> ManifestV2 {
        let mut files = self.entries.lock().clone();
        files.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
        ManifestV2 {
            version: MANIFEST_VERSION,
            cluster: self.layout.cluster.clone(),
            token: self.layout.token.clone(),
            instant: format_instant(self.instant),
            schema_hash: schema_hash(&files),
            files,
        }
    }

    /// Serializes and puts the manifest. Callers invoke this strictly
    /// after every data file of the round has been put; its presence is
    /// the round's commit marker.
    pub async fn publish(
        &self,
        store: &Arc<DynObjectStore>,
        retry: &RetryPolicy,
    ) -> BackupResult<String> {
        let manifest = self.build();
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
        let key = self.meta_key();
        store_util::put_bytes(store, &Path::from(key.as_str()), Bytes::from(bytes), retry).await?;
        Ok(key)
    }
}

/// Finds the newest manifest for the layout's token with an instant at or
/// before `time`, along with that instant. Prefers v2 when both dialects
/// exist at the same instant.
pub async fn find_at_or_before(
    store: &Arc<DynObjectStore>,
    layout: &KeyLayout,
    time: DateTime<Utc>,
    retry: &RetryPolicy,
) -> BackupResult<Option<(ManifestV2, DateTime<Utc>)>> {
    let prefix = Path::from(layout.meta_root());
    let listing = store_util::list_all(store, &prefix, retry).await?;
    let mut candidates: Vec<(DateTime<Utc>, bool, String)> = Vec::new();
    for meta in listing {
        let key = meta.location.to_string();
        let Ok(path) = remote_path::decode(&key) else {
            // unrelated object under META/, not ours to interpret
            continue;
        };
        match path.kind() {
            FileKind::MetaV2 if path.time() <= time => {
                candidates.push((path.time(), true, key));
            }
            FileKind::Meta if path.time() <= time => {
                candidates.push((path.time(), false, key));
            }
            _ => {}
        }
    }
    let Some((instant, _, key)) = candidates.into_iter().max() else {
        return Ok(None);
    };
    let bytes = store_util::get_bytes(store, &Path::from(key.as_str()), retry).await?;
    let manifest = Manifest::parse(&bytes)?.into_v2(instant)?;
    Ok(Some((manifest, instant)))
}
