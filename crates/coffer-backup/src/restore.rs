// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time restore: resolve the object set for a target instant,
//! fetch it, and hand the files to the database.
//!
//! The plan starts from the newest manifest at or before the target
//! time. When that manifest carries snapshot entries, incremental
//! SSTables shipped after the snapshot (up to the target) are merged in
//! from a prefix listing, so snapshot and incrementals compose into one
//! point-in-time view. Files are fetched concurrently, decompressed into
//! a sibling temp file and atomically renamed into place; a permanent
//! failure aborts the restore but already-placed files survive.

use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use coffer_storage::{
    CompressionCodec, GovernorTicket, RetryPolicy, StoreError, TransferGovernor,
    compress::decompress_to_file,
    object_store::list_all,
};
use futures::StreamExt;
use object_store::{DynObjectStore, path::Path as StorePath};
use tokio::{io::AsyncWriteExt, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ActivityGuard,
    db_control::{DbControl, SerializedDbControl},
    discovery::DataLayout,
    error::{BackupError, BackupResult},
    manifest::{ManifestEntry, find_at_or_before},
    metrics::BackupMetrics,
    registry::TransferRegistry,
    remote_path::{self, FileKind, KeyLayout, encode_partial, format_instant},
};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Target point in time; the newest manifest at or before it anchors
    /// the plan.
    pub time: DateTime<Utc>,
    pub keyspace: Option<String>,
    pub column_family: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Success,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub outcome: RestoreOutcome,
    /// Transfer-record ids (remote keys) touched by the restore.
    pub records: Vec<String>,
    pub restored: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
    /// True when a failure was a permanent object-store error (as
    /// opposed to files missing or corrupt).
    pub permanent_store_failure: bool,
}

#[derive(Debug, Clone)]
struct PlannedFile {
    entry: ManifestEntry,
    kind: FileKind,
    /// v2 manifest entries carry size and checksum; v1 entries and
    /// listed incrementals do not, which disables the same-size skip and
    /// post-fetch verification for them.
    verified: bool,
}

enum Placement {
    Placed,
    SkippedExisting,
}

pub struct Restorer {
    store: Arc<DynObjectStore>,
    layout: KeyLayout,
    data: DataLayout,
    codec: CompressionCodec,
    governor: Arc<TransferGovernor>,
    registry: Arc<TransferRegistry>,
    metrics: BackupMetrics,
    db: Arc<SerializedDbControl>,
    retry: RetryPolicy,
    guard: ActivityGuard,
}

impl Restorer {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DynObjectStore>,
        layout: KeyLayout,
        data: DataLayout,
        codec: CompressionCodec,
        governor: Arc<TransferGovernor>,
        registry: Arc<TransferRegistry>,
        metrics: BackupMetrics,
        db: Arc<SerializedDbControl>,
        retry: RetryPolicy,
        guard: ActivityGuard,
    ) -> Self {
        Self {
            store,
            layout,
            data,
            codec,
            governor,
            registry,
            metrics,
            db,
            retry,
            guard,
        }
    }

    pub async fn restore(
        &self,
        request: &RestoreRequest,
        token: &CancellationToken,
    ) -> BackupResult<RestoreReport> {
        // waits for an in-flight round to drain; rounds fired while the
        // restore runs are skipped by the coordinator
        let _guard = self.guard.lock().await;

        let plan = self.plan(request).await?;
        info!(
            "restoring {} files for token {} at {}",
            plan.len(),
            self.layout.token,
            format_instant(request.time)
        );
        let records: Vec<String> = plan.iter().map(|f| f.entry.remote_key.clone()).collect();

        // a permanent failure anywhere aborts the rest of the restore
        let abort = token.child_token();
        let results: Vec<(PlannedFile, BackupResult<Placement>)> =
            futures::stream::iter(plan.into_iter().map(|file| {
                let abort = abort.clone();
                async move {
                    let result = self.fetch_one(&file, &abort).await;
                    if result.as_ref().is_err_and(|err| is_fatal(err)) {
                        abort.cancel();
                    }
                    (file, result)
                }
            }))
            .buffer_unordered(self.governor.capacity())
            .collect()
            .await;

        let mut restored = 0;
        let mut skipped = 0;
        let mut failed: Vec<(String, String)> = vec![];
        let mut permanent_store_failure = false;
        let mut refresh_targets: BTreeSet<(String, String)> = BTreeSet::new();
        for (file, result) in results {
            match result {
                Ok(Placement::Placed) => {
                    restored += 1;
                    if file.kind != FileKind::CommitLog {
                        refresh_targets
                            .insert((file.entry.keyspace.clone(), file.entry.column_family.clone()));
                    }
                }
                Ok(Placement::SkippedExisting) => skipped += 1,
                Err(err) => {
                    permanent_store_failure |= matches!(err, BackupError::RemotePermanent(_));
                    failed.push((file.entry.remote_key.clone(), err.to_string()));
                }
            }
        }

        let outcome = if failed.is_empty() {
            // refresh failures are logged, not fatal: the files are in
            // place and the database picks them up on its next start
            for (keyspace, column_family) in refresh_targets {
                if let Err(err) = self.db.refresh(&keyspace, &column_family).await {
                    warn!("refresh of {keyspace}/{column_family} failed: {err}");
                }
            }
            RestoreOutcome::Success
        } else {
            RestoreOutcome::Failed(failed[0].1.clone())
        };
        Ok(RestoreReport {
            outcome,
            records,
            restored,
            skipped,
            failed,
            permanent_store_failure,
        })
    }

    async fn plan(&self, request: &RestoreRequest) -> BackupResult<Vec<PlannedFile>> {
        let Some((manifest, _)) =
            find_at_or_before(&self.store, &self.layout, request.time, &self.retry).await?
        else {
            return Err(BackupError::ManifestNotFound {
                token: self.layout.token.clone(),
                time: format_instant(request.time),
            });
        };

        let mut planned: Vec<PlannedFile> = vec![];
        let mut seen: HashSet<String> = HashSet::new();
        let mut snapshot_time: Option<DateTime<Utc>> = None;
        for entry in manifest.files {
            let path = remote_path::decode(&entry.remote_key)
                .map_err(|err| BackupError::ManifestBroken(err.to_string()))?;
            if !matches_filter(request, path.keyspace(), path.column_family()) {
                continue;
            }
            if path.kind() == FileKind::Snapshot {
                snapshot_time = Some(match snapshot_time {
                    Some(existing) => existing.min(path.time()),
                    None => path.time(),
                });
            }
            seen.insert(entry.remote_key.clone());
            planned.push(PlannedFile {
                verified: !entry.sha256.is_empty(),
                kind: path.kind(),
                entry,
            });
        }

        if let Some(snapshot_time) = snapshot_time {
            if snapshot_time < request.time {
                self.merge_incrementals(request, snapshot_time, &mut planned, &mut seen)
                    .await?;
            }
        }
        planned.sort_by(|a, b| a.entry.remote_key.cmp(&b.entry.remote_key));
        Ok(planned)
    }

    /// Lists SSTables shipped in `(snapshot_time, request.time]` and
    /// merges them into the plan.
    async fn merge_incrementals(
        &self,
        request: &RestoreRequest,
        snapshot_time: DateTime<Utc>,
        planned: &mut Vec<PlannedFile>,
        seen: &mut HashSet<String>,
    ) -> BackupResult<()> {
        let prefix = encode_partial(&self.layout, snapshot_time, request.time);
        let listing = list_all(&self.store, &StorePath::from(prefix.as_str()), &self.retry).await?;
        for meta in listing {
            let key = meta.location.to_string();
            let Ok(path) = remote_path::decode(&key) else {
                continue;
            };
            if path.kind() != FileKind::SsTable
                || path.time() <= snapshot_time
                || path.time() > request.time
                || !matches_filter(request, path.keyspace(), path.column_family())
                || !seen.insert(key.clone())
            {
                continue;
            }
            debug!("including incremental {key}");
            planned.push(PlannedFile {
                entry: ManifestEntry {
                    keyspace: path.keyspace().to_owned(),
                    column_family: path.column_family().to_owned(),
                    file_name: path.file_name().to_owned(),
                    remote_key: key,
                    size: 0,
                    compressed_size: meta.size as u64,
                    sha256: String::new(),
                },
                kind: FileKind::SsTable,
                verified: false,
            });
        }
        Ok(())
    }

    async fn fetch_one(
        &self,
        file: &PlannedFile,
        token: &CancellationToken,
    ) -> BackupResult<Placement> {
        let key = file.entry.remote_key.as_str();
        self.registry.enqueue(key);
        if token.is_cancelled() {
            self.registry.fail(key, "cancelled");
            return Err(BackupError::Cancelled);
        }

        let target = self.local_target(file);
        if file.verified {
            if let Ok(meta) = std::fs::metadata(&target) {
                if meta.len() == file.entry.size {
                    debug!("destination already has {key}, skipping");
                    self.registry.complete(key);
                    return Ok(Placement::SkippedExisting);
                }
            }
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(BackupError::LocalWrite)?;
        }

        let result = self.fetch_into_place(file, &target, token.clone()).await;
        match result {
            Ok(()) => {
                self.registry.complete(key);
                self.metrics.files_restored.inc();
                Ok(Placement::Placed)
            }
            Err(err) => {
                self.registry.fail(key, &err.to_string());
                Err(err)
            }
        }
    }

    async fn fetch_into_place(
        &self,
        file: &PlannedFile,
        target: &Path,
        token: CancellationToken,
    ) -> BackupResult<()> {
        let key = file.entry.remote_key.as_str();
        let ticket = self.governor.admit(token.clone()).await?;
        let part = sibling(target, "part");
        let tmp = sibling(target, "tmp");

        let mut backoff = self.retry.backoff();
        let mut attempt = 1;
        let downloaded = loop {
            self.registry.mark_running(key);
            match self.download(key, &part, &ticket).await {
                Ok(()) => break Ok(()),
                Err(err)
                    if err.is_retryable()
                        && attempt < self.retry.max_attempts
                        && !token.is_cancelled() =>
                {
                    let delay = backoff.next_backoff().unwrap_or(self.retry.base_delay);
                    warn!(
                        "attempt {attempt} fetching {key} failed, retrying in {} ms: {err}",
                        delay.as_millis()
                    );
                    attempt += 1;
                    if timeout(delay, token.cancelled()).await.is_ok() {
                        break Err(BackupError::Cancelled);
                    }
                }
                Err(err) => break Err(err),
            }
        };
        if let Err(err) = downloaded {
            let _ = std::fs::remove_file(&part);
            return Err(err);
        }

        let codec = self.codec;
        let decompressed = {
            let part = part.clone();
            let tmp = tmp.clone();
            tokio::task::spawn_blocking(move || {
                let reader = std::fs::File::open(&part)?;
                decompress_to_file(codec, reader, &tmp)
            })
            .await
            .map_err(|err| {
                BackupError::LocalWrite(std::io::Error::other(format!(
                    "decompress task failed: {err}"
                )))
            })?
        };
        let _ = std::fs::remove_file(&part);
        let decompressed = match decompressed {
            Ok(info) => info,
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(BackupError::compress_write(err));
            }
        };

        if file.verified {
            if file.entry.size != decompressed.size {
                let _ = std::fs::remove_file(&tmp);
                return Err(BackupError::CorruptCompressed(format!(
                    "{key}: expected {} bytes, decompressed {}",
                    file.entry.size, decompressed.size
                )));
            }
            if file.entry.sha256 != decompressed.sha256 {
                let _ = std::fs::remove_file(&tmp);
                return Err(BackupError::CorruptCompressed(format!(
                    "{key}: content checksum mismatch"
                )));
            }
        }
        std::fs::rename(&tmp, target).map_err(BackupError::LocalWrite)?;
        debug!("placed {key} at {}", target.display());
        Ok(())
    }

    async fn download(
        &self,
        key: &str,
        part: &Path,
        ticket: &GovernorTicket,
    ) -> BackupResult<()> {
        let result = match self.store.get(&StorePath::from(key)).await {
            Ok(result) => result,
            Err(err) => return Err(classify_fetch_error(key, err)),
        };
        let mut stream = result.into_stream();
        let mut out = tokio::fs::File::create(part)
            .await
            .map_err(BackupError::LocalWrite)?;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return Err(classify_fetch_error(key, err)),
            };
            ticket.consume(chunk.len() as u64).await?;
            self.registry.add_bytes(key, chunk.len() as u64);
            out.write_all(&chunk).await.map_err(BackupError::LocalWrite)?;
        }
        out.flush().await.map_err(BackupError::LocalWrite)?;
        Ok(())
    }

    fn local_target(&self, file: &PlannedFile) -> PathBuf {
        match file.kind {
            FileKind::CommitLog => self.data.commit_log_dir.join(&file.entry.file_name),
            _ => self
                .data
                .live_dir(&file.entry.keyspace, &file.entry.column_family)
                .join(&file.entry.file_name),
        }
    }
}

/// A key referenced by the plan but absent from the store breaks the
/// manifest completeness invariant.
fn classify_fetch_error(key: &str, err: object_store::Error) -> BackupError {
    match StoreError::from(err) {
        StoreError::NotFound => {
            BackupError::ManifestBroken(format!("manifest references missing object {key}"))
        }
        other => other.into(),
    }
}

// local write failures (disk full, bad permissions) will hit every
// remaining file too
fn is_fatal(err: &BackupError) -> bool {
    matches!(
        err,
        BackupError::RemotePermanent(_)
            | BackupError::ManifestBroken(_)
            | BackupError::CorruptCompressed(_)
            | BackupError::LocalWrite(_)
    )
}

fn matches_filter(request: &RestoreRequest, keyspace: &str, column_family: &str) -> bool {
    if let Some(wanted) = &request.keyspace {
        if wanted != keyspace {
            return false;
        }
    }
    if let Some(wanted) = &request.column_family {
        if wanted != column_family {
            return false;
        }
    }
    true
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("restore");
    target.with_file_name(format!("{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_on_both_axes() {
        let request = RestoreRequest {
            time: Utc::now(),
            keyspace: Some("ks1".into()),
            column_family: None,
        };
        assert!(matches_filter(&request, "ks1", "cf1"));
        assert!(matches_filter(&request, "ks1", "cf2"));
        assert!(!matches_filter(&request, "ks2", "cf1"));

        let narrow = RestoreRequest {
            time: Utc::now(),
            keyspace: Some("ks1".into()),
            column_family: Some("cf1".into()),
        };
        assert!(matches_filter(&narrow, "ks1", "cf1"));
        assert!(!matches_filter(&narrow, "ks1", "cf2"));
    }

    #[test]
    fn sibling_names_keep_the_target_visible() {
        let target = PathBuf::from("/data/ks/cf/mc-1-big-Data.db");
        assert_eq!(
            sibling(&target, "tmp"),
            PathBuf::from("/data/ks/cf/mc-1-big-Data.db.tmp")
        );
    }
}
