// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The upload pipeline: stage, admit, transmit, finalize.
//!
//! Each file is compressed into the staging directory first (restarting
//! if the source mtime moves mid-read), then shipped under a governor
//! ticket. Below the multipart threshold a file goes up as one put;
//! above it, as a bounded-parallelism multipart upload. Transient
//! failures retry with exponential backoff and full jitter; a permanent
//! failure marks the transfer FAILED without aborting its round.
//!
//! A file is skipped instead of shipped when the fingerprint cache holds
//! a verified entry with the same uncompressed size, or, for keys only
//! known from a startup listing, when the freshly staged compressed
//! bytes match the listed remote size. A mismatch on either comparison
//! re-uploads, overwriting whatever a prior interrupted round left under
//! the key.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use backoff::backoff::Backoff;
use bytes::Bytes;
use coffer_storage::{
    COPY_BUFFER_SIZE, CompressedFile, CompressionCodec, GovernorTicket, RetryPolicy, StoreError,
    TransferGovernor,
    compress::{compress_file, sha256_file},
    object_store::multipart_part_size,
};
use futures::StreamExt;
use object_store::{DynObjectStore, PutPayload, WriteMultipart, path::Path as StorePath};
use tokio::{io::AsyncReadExt, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::{BackupError, BackupResult},
    fingerprint::{Fingerprint, UploadFingerprintCache},
    manifest::{ManifestEntry, RoundManifest},
    metrics::BackupMetrics,
    registry::TransferRegistry,
    remote_path::BackupPath,
};

/// Parts of one multipart upload allowed in flight at once.
const MULTIPART_IN_FLIGHT_PARTS: usize = 8;

const STAGE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug)]
pub struct UploaderOptions {
    pub codec: CompressionCodec,
    pub staging_dir: PathBuf,
    pub retry: RetryPolicy,
    pub multipart_threshold: u64,
    pub multipart_part_size: u64,
    /// Upper bound on one transfer including its retries.
    pub per_file_timeout: Option<Duration>,
}

#[derive(Default)]
pub struct UploadOutcome {
    /// Manifest entries for every file of the round, uploaded or skipped.
    pub entries: Vec<ManifestEntry>,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: Vec<(String, BackupError)>,
}

enum FileDisposition {
    Uploaded(ManifestEntry),
    Skipped(ManifestEntry),
}

pub struct Uploader {
    store: Arc<DynObjectStore>,
    governor: Arc<TransferGovernor>,
    cache: Arc<UploadFingerprintCache>,
    registry: Arc<TransferRegistry>,
    metrics: BackupMetrics,
    clock: Arc<dyn Clock>,
    options: UploaderOptions,
}

impl Uploader {
    pub fn new(
        store: Arc<DynObjectStore>,
        governor: Arc<TransferGovernor>,
        cache: Arc<UploadFingerprintCache>,
        registry: Arc<TransferRegistry>,
        metrics: BackupMetrics,
        clock: Arc<dyn Clock>,
        options: UploaderOptions,
    ) -> BackupResult<Self> {
        std::fs::create_dir_all(&options.staging_dir).map_err(BackupError::LocalWrite)?;
        Ok(Self {
            store,
            governor,
            cache,
            registry,
            metrics,
            clock,
            options,
        })
    }

    /// Uploads a batch, recording every completed file in the round
    /// manifest when one is provided. Failures are collected, not
    /// propagated; the caller decides the round outcome.
    pub async fn upload_batch(
        &self,
        files: Vec<BackupPath>,
        manifest: Option<&RoundManifest>,
        token: &CancellationToken,
    ) -> UploadOutcome {
        let results: Vec<(String, BackupResult<FileDisposition>)> =
            futures::stream::iter(files.into_iter().map(|file| {
                let token = token.clone();
                async move {
                    let key = file.remote_key().to_owned();
                    let result = self.upload_one(&file, token).await;
                    (key, result)
                }
            }))
            .buffer_unordered(self.governor.capacity())
            .collect()
            .await;

        let mut outcome = UploadOutcome::default();
        for (key, result) in results {
            match result {
                Ok(FileDisposition::Uploaded(entry)) => {
                    outcome.uploaded += 1;
                    if let Some(manifest) = manifest {
                        manifest.add(entry.clone());
                    }
                    outcome.entries.push(entry);
                }
                Ok(FileDisposition::Skipped(entry)) => {
                    outcome.skipped += 1;
                    if let Some(manifest) = manifest {
                        manifest.add(entry.clone());
                    }
                    outcome.entries.push(entry);
                }
                Err(err) => outcome.failed.push((key, err)),
            }
        }
        outcome
    }

    async fn upload_one(
        &self,
        file: &BackupPath,
        token: CancellationToken,
    ) -> BackupResult<FileDisposition> {
        let key = file.remote_key();
        self.registry.enqueue(key);
        if token.is_cancelled() {
            self.registry.fail(key, "cancelled");
            return Err(BackupError::Cancelled);
        }

        if let Some(fingerprint) = self.cache.get(key) {
            if fingerprint.size != 0 && fingerprint.size == file.size {
                let entry = self.already_uploaded_entry(file, &fingerprint).await?;
                self.registry.complete(key);
                self.metrics.files_skipped.inc();
                debug!("already uploaded, skipping {key}");
                return Ok(FileDisposition::Skipped(entry));
            }
        }

        let transfer = self.transfer(file, &token);
        let result = match self.options.per_file_timeout {
            Some(limit) => match timeout(limit, transfer).await {
                Ok(result) => result,
                Err(_) => Err(BackupError::Timeout(format!(
                    "transfer of {key} exceeded {}s",
                    limit.as_secs()
                ))),
            },
            None => transfer.await,
        };
        match result {
            Ok(disposition) => {
                self.registry.complete(key);
                Ok(disposition)
            }
            Err(err) => {
                self.registry.fail(key, &err.to_string());
                self.metrics.files_failed.inc();
                Err(err)
            }
        }
    }

    async fn transfer(
        &self,
        file: &BackupPath,
        token: &CancellationToken,
    ) -> BackupResult<FileDisposition> {
        let key = file.remote_key();
        let local = file.local_path.clone().ok_or_else(|| {
            BackupError::Config(format!("no local file handle for {key}"))
        })?;

        let staged = self.staging_path(file);
        let codec = self.options.codec;
        let info = {
            let staged = staged.clone();
            tokio::task::spawn_blocking(move || stage_with_restart(codec, &local, &staged))
                .await
                .map_err(|err| {
                    BackupError::LocalWrite(std::io::Error::other(format!(
                        "staging task failed: {err}"
                    )))
                })??
        };

        // a key only known from the startup listing carries no source
        // size; the staged compressed size settles whether the remote
        // object really is this file
        if let Some(fingerprint) = self.cache.get(key) {
            if fingerprint.size == 0 && fingerprint.compressed_size == info.compressed_size {
                if let Err(err) = std::fs::remove_file(&staged) {
                    debug!("failed to remove staged file {}: {err}", staged.display());
                }
                self.cache.insert(
                    key.to_owned(),
                    info.uncompressed_size,
                    info.compressed_size,
                    self.clock.now(),
                );
                self.metrics.files_skipped.inc();
                debug!("remote object matches staged bytes, skipping {key}");
                return Ok(FileDisposition::Skipped(self.entry_for(file, &info)));
            }
        }

        let ticket = self.governor.admit(token.clone()).await?;

        let mut backoff = self.options.retry.backoff();
        let mut attempt = 1;
        let sent = loop {
            self.registry.mark_running(key);
            match self.transmit(&staged, info.compressed_size, file, &ticket).await {
                Ok(()) => break Ok(()),
                Err(err)
                    if err.is_retryable()
                        && attempt < self.options.retry.max_attempts
                        && !token.is_cancelled() =>
                {
                    let delay = backoff.next_backoff().unwrap_or(self.options.retry.base_delay);
                    warn!(
                        "attempt {attempt} for {key} failed, retrying in {} ms: {err}",
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
        if let Err(err) = std::fs::remove_file(&staged) {
            debug!("failed to remove staged file {}: {err}", staged.display());
        }
        sent?;

        self.cache.insert(
            key.to_owned(),
            info.uncompressed_size,
            info.compressed_size,
            self.clock.now(),
        );
        self.metrics
            .files_uploaded
            .with_label_values(&[&file.kind().to_string()])
            .inc();
        self.metrics.bytes_uploaded.inc_by(info.compressed_size);
        debug!(
            "uploaded {key} ({} -> {} bytes)",
            info.uncompressed_size, info.compressed_size
        );
        Ok(FileDisposition::Uploaded(self.entry_for(file, &info)))
    }

    async fn transmit(
        &self,
        staged: &Path,
        compressed_size: u64,
        file: &BackupPath,
        ticket: &GovernorTicket,
    ) -> BackupResult<()> {
        let key = file.remote_key();
        let path = StorePath::from(key);
        let mut reader = tokio::fs::File::open(staged)
            .await
            .map_err(BackupError::LocalRead)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        if compressed_size <= self.options.multipart_threshold {
            let mut chunks: Vec<Bytes> = Vec::new();
            loop {
                let n = reader.read(&mut buf).await.map_err(BackupError::LocalRead)?;
                if n == 0 {
                    break;
                }
                ticket.consume(n as u64).await?;
                self.registry.add_bytes(key, n as u64);
                chunks.push(Bytes::copy_from_slice(&buf[..n]));
            }
            self.store
                .put(&path, PutPayload::from_iter(chunks))
                .await
                .map_err(store_err)?;
        } else {
            let part_size =
                multipart_part_size(compressed_size, self.options.multipart_part_size);
            let upload = self.store.put_multipart(&path).await.map_err(store_err)?;
            let mut write = WriteMultipart::new_with_chunk_size(upload, part_size as usize);
            loop {
                let n = reader.read(&mut buf).await.map_err(BackupError::LocalRead)?;
                if n == 0 {
                    break;
                }
                ticket.consume(n as u64).await?;
                write
                    .wait_for_capacity(MULTIPART_IN_FLIGHT_PARTS)
                    .await
                    .map_err(store_err)?;
                write.write(&buf[..n]);
                self.registry.add_bytes(key, n as u64);
            }
            write.finish().await.map_err(store_err)?;
        }
        Ok(())
    }

    /// Builds the manifest entry for a verified fingerprint-cache hit:
    /// the content hash comes from the local file, both sizes from the
    /// cache entry the pipeline recorded.
    async fn already_uploaded_entry(
        &self,
        file: &BackupPath,
        fingerprint: &Fingerprint,
    ) -> BackupResult<ManifestEntry> {
        let key = file.remote_key();
        let sha256 = match file.local_path.clone() {
            Some(local) => tokio::task::spawn_blocking(move || sha256_file(&local))
                .await
                .map_err(|err| {
                    BackupError::LocalRead(std::io::Error::other(format!(
                        "hashing task failed: {err}"
                    )))
                })?
                .map_err(BackupError::compress_read)?,
            None => String::new(),
        };
        Ok(ManifestEntry {
            keyspace: file.keyspace().to_owned(),
            column_family: file.column_family().to_owned(),
            file_name: file.file_name().to_owned(),
            remote_key: key.to_owned(),
            size: fingerprint.size,
            compressed_size: fingerprint.compressed_size,
            sha256,
        })
    }

    fn entry_for(&self, file: &BackupPath, info: &CompressedFile) -> ManifestEntry {
        ManifestEntry {
            keyspace: file.keyspace().to_owned(),
            column_family: file.column_family().to_owned(),
            file_name: file.file_name().to_owned(),
            remote_key: file.remote_key().to_owned(),
            size: info.uncompressed_size,
            compressed_size: info.compressed_size,
            sha256: info.sha256.clone(),
        }
    }

    fn staging_path(&self, file: &BackupPath) -> PathBuf {
        let flat = file.remote_key().replace('/', "__");
        self.options.staging_dir.join(format!("{flat}.staged"))
    }
}

fn store_err(err: object_store::Error) -> BackupError {
    BackupError::from(StoreError::from(err))
}

/// Compresses `src` into `dst`, restarting when the source mtime moves
/// mid-read: the database may still be finishing a file we picked up, and
/// a half-written SSTable must never be shipped.
fn stage_with_restart(
    codec: CompressionCodec,
    src: &Path,
    dst: &Path,
) -> BackupResult<CompressedFile> {
    for _ in 0..STAGE_ATTEMPTS {
        let before = modified_time(src)?;
        let info = compress_file(codec, src, dst).map_err(BackupError::compress_write)?;
        let after = modified_time(src)?;
        if before == after {
            return Ok(info);
        }
        debug!("{} changed while staging, restarting", src.display());
    }
    Err(BackupError::LocalRead(std::io::Error::other(format!(
        "{} kept changing while staging",
        src.display()
    ))))
}

fn modified_time(path: &Path) -> BackupResult<std::time::SystemTime> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(BackupError::LocalRead)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use coffer_storage::object_store::get_bytes;
    use object_store::{ObjectStore, memory::InMemory};

    use super::*;
    use crate::{
        clock::FixedClock,
        remote_path::{FileKind, KeyLayout, parse_instant},
    };

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2018, 6, 5, 12, 34, 0).unwrap(),
        ))
    }

    fn uploader_with_cache(
        store: Arc<DynObjectStore>,
        staging: PathBuf,
        cache: Arc<UploadFingerprintCache>,
    ) -> Uploader {
        let clock = fixed_clock();
        Uploader::new(
            store,
            Arc::new(TransferGovernor::new(2, None)),
            cache,
            Arc::new(TransferRegistry::new(64, clock.clone())),
            BackupMetrics::unregistered(),
            clock,
            UploaderOptions {
                codec: CompressionCodec::Snappy,
                staging_dir: staging,
                retry: RetryPolicy::new(2, Duration::from_millis(1)),
                multipart_threshold: 1024 * 1024,
                multipart_part_size: 64 * 1024,
                per_file_timeout: None,
            },
        )
        .unwrap()
    }

    fn uploader(store: Arc<DynObjectStore>, staging: PathBuf) -> Uploader {
        uploader_with_cache(store, staging, Arc::new(UploadFingerprintCache::new()))
    }

    fn backup_path(dir: &Path, bytes: &[u8]) -> BackupPath {
        let local = dir.join("mc-1-big-Data.db");
        std::fs::write(&local, bytes).unwrap();
        let time = parse_instant("201806051234").unwrap();
        BackupPath::new(
            &KeyLayout::new("b", "p", "Test", "100"),
            FileKind::SsTable,
            "ks1",
            "cf1",
            time,
            "mc-1-big-Data.db",
            bytes.len() as u64,
            time,
            Some(local),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uploads_and_records_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store.clone(), dir.path().join("staging"));
        let file = backup_path(dir.path(), b"sstable contents");

        let token = CancellationToken::new();
        let outcome = uploader.upload_batch(vec![file.clone()], None, &token).await;
        assert_eq!(outcome.uploaded, 1);
        assert!(outcome.failed.is_empty());
        let entry = &outcome.entries[0];
        assert_eq!(entry.remote_key, file.remote_key());
        assert_eq!(entry.size, 16);
        assert!(entry.compressed_size > 0);
        assert_eq!(entry.sha256.len(), 64);

        // the object landed and the cache knows it now
        get_bytes(
            &store,
            &StorePath::from(file.remote_key()),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert!(uploader.cache.contains(file.remote_key(), 16));
        // staged file was cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_upload_is_skipped_with_identical_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store.clone(), dir.path().join("staging"));
        let file = backup_path(dir.path(), b"sstable contents");

        let token = CancellationToken::new();
        let first = uploader.upload_batch(vec![file.clone()], None, &token).await;
        let second = uploader.upload_batch(vec![file], None, &token).await;
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(first.entries, second.entries);
    }

    #[tokio::test]
    async fn warmed_key_is_settled_by_staged_compressed_size() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let file = backup_path(dir.path(), b"sstable contents");
        let token = CancellationToken::new();

        let first = uploader(store.clone(), dir.path().join("staging-a"));
        let outcome = first.upload_batch(vec![file.clone()], None, &token).await;
        assert_eq!(outcome.uploaded, 1);

        // a fresh process only sees the key in the startup listing; the
        // staged bytes match the remote object, so nothing re-uploads
        let cache = Arc::new(UploadFingerprintCache::new());
        cache
            .warm_up(
                &store,
                &KeyLayout::new("b", "p", "Test", "100"),
                &RetryPolicy::default(),
            )
            .await
            .unwrap();
        let second = uploader_with_cache(store.clone(), dir.path().join("staging-b"), cache.clone());
        let outcome = second.upload_batch(vec![file.clone()], None, &token).await;
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.skipped, 1);
        // the settled entry is verified from here on
        assert!(cache.contains(file.remote_key(), file.size));
    }

    #[tokio::test]
    async fn mismatched_remote_size_forces_a_reupload() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let file = backup_path(dir.path(), b"sstable contents");
        let token = CancellationToken::new();

        // an interrupted prior round left a short object under the key
        store
            .put(&StorePath::from(file.remote_key()), Bytes::from_static(b"x").into())
            .await
            .unwrap();
        let cache = Arc::new(UploadFingerprintCache::new());
        cache.insert(file.remote_key().to_owned(), 0, 1, Utc::now());

        let uploader = uploader_with_cache(store.clone(), dir.path().join("staging"), cache.clone());
        let outcome = uploader.upload_batch(vec![file.clone()], None, &token).await;
        assert_eq!(outcome.uploaded, 1);
        assert_eq!(outcome.skipped, 0);

        let stored = get_bytes(
            &store,
            &StorePath::from(file.remote_key()),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert!(stored.len() > 1);
        assert!(cache.contains(file.remote_key(), file.size));
    }

    #[tokio::test]
    async fn cancelled_token_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store, dir.path().join("staging"));
        let file = backup_path(dir.path(), b"bytes");

        let token = CancellationToken::new();
        token.cancel();
        let outcome = uploader.upload_batch(vec![file], None, &token).await;
        assert_eq!(outcome.uploaded, 0);
        assert!(matches!(outcome.failed[0].1, BackupError::Cancelled));
    }

    #[tokio::test]
    async fn large_files_take_the_multipart_route() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let mut uploader = uploader(store.clone(), dir.path().join("staging"));
        // force multipart for everything
        uploader.options.multipart_threshold = 1;
        uploader.options.codec = CompressionCodec::None;

        let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 255) as u8).collect();
        let file = backup_path(dir.path(), &payload);
        let token = CancellationToken::new();
        let outcome = uploader.upload_batch(vec![file.clone()], None, &token).await;
        assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);

        let stored = get_bytes(
            &store,
            &StorePath::from(file.remote_key()),
            &RetryPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(stored.len(), payload.len());
    }
}
