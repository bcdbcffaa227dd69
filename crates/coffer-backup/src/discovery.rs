// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Discovery of files eligible for upload.
//!
//! The database data directory is laid out
//! `<dataDir>/<ks>/<cf>/{snapshots/<tag>,backups}/...`; commit logs live
//! in their own flat directory. Discovery walks these trees, builds
//! [`BackupPath`] values and drops everything the fingerprint cache
//! already knows.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{BackupError, BackupResult},
    fingerprint::UploadFingerprintCache,
    remote_path::{BackupPath, COMMIT_LOG_KEYSPACE, FileKind, KeyLayout},
};

const SNAPSHOTS_DIR: &str = "snapshots";
const BACKUPS_DIR: &str = "backups";

/// Local filesystem layout of the database node.
#[derive(Clone, Debug)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub commit_log_dir: PathBuf,
}

impl DataLayout {
    pub fn snapshots_dir(&self, keyspace: &str, column_family: &str, tag: &str) -> PathBuf {
        self.data_dir
            .join(keyspace)
            .join(column_family)
            .join(SNAPSHOTS_DIR)
            .join(tag)
    }

    pub fn backups_dir(&self, keyspace: &str, column_family: &str) -> PathBuf {
        self.data_dir
            .join(keyspace)
            .join(column_family)
            .join(BACKUPS_DIR)
    }

    /// Where restored files for a column family are placed.
    pub fn live_dir(&self, keyspace: &str, column_family: &str) -> PathBuf {
        self.data_dir.join(keyspace).join(column_family)
    }
}

struct LocalFile {
    name: String,
    path: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

pub struct Discovery {
    data: DataLayout,
    layout: KeyLayout,
    cache: Arc<UploadFingerprintCache>,
}

impl Discovery {
    pub fn new(data: DataLayout, layout: KeyLayout, cache: Arc<UploadFingerprintCache>) -> Self {
        Self {
            data,
            layout,
            cache,
        }
    }

    pub fn data_layout(&self) -> &DataLayout {
        &self.data
    }

    /// Files of the named snapshot across all column families. The
    /// emitted instant is the snapshot's, not each file's mtime.
    pub fn snapshot_files(
        &self,
        tag: &str,
        instant: DateTime<Utc>,
    ) -> BackupResult<Vec<BackupPath>> {
        let mut paths = vec![];
        for (keyspace, column_family) in self.column_families()? {
            let dir = self.data.snapshots_dir(&keyspace, &column_family, tag);
            if !dir.is_dir() {
                continue;
            }
            for file in files_in(&dir).map_err(BackupError::LocalRead)? {
                let path = BackupPath::new(
                    &self.layout,
                    FileKind::Snapshot,
                    &keyspace,
                    &column_family,
                    instant,
                    &file.name,
                    file.size,
                    file.modified,
                    Some(file.path),
                )?;
                paths.push(path);
            }
        }
        Ok(self.deduplicate(paths))
    }

    /// Incremental SSTables accumulated under every `backups/` directory.
    /// Each file's instant is its last-modified minute.
    pub fn incremental_files(&self) -> BackupResult<Vec<BackupPath>> {
        let mut paths = vec![];
        for (keyspace, column_family) in self.column_families()? {
            let dir = self.data.backups_dir(&keyspace, &column_family);
            if !dir.is_dir() {
                continue;
            }
            for file in files_in(&dir).map_err(BackupError::LocalRead)? {
                let path = BackupPath::new(
                    &self.layout,
                    FileKind::SsTable,
                    &keyspace,
                    &column_family,
                    file.modified,
                    &file.name,
                    file.size,
                    file.modified,
                    Some(file.path),
                )?;
                paths.push(path);
            }
        }
        Ok(self.deduplicate(paths))
    }

    /// Commit-log segments, filed under the `commitlog` pseudo-keyspace.
    pub fn commit_log_files(&self) -> BackupResult<Vec<BackupPath>> {
        if !self.data.commit_log_dir.is_dir() {
            return Ok(vec![]);
        }
        let mut paths = vec![];
        for file in files_in(&self.data.commit_log_dir).map_err(BackupError::LocalRead)? {
            let path = BackupPath::new(
                &self.layout,
                FileKind::CommitLog,
                COMMIT_LOG_KEYSPACE,
                "",
                file.modified,
                &file.name,
                file.size,
                file.modified,
                Some(file.path),
            )?;
            paths.push(path);
        }
        Ok(self.deduplicate(paths))
    }

    // drops files whose upload this process has verified; keys only seen
    // in a startup listing re-emit once and the uploader settles them
    fn deduplicate(&self, paths: Vec<BackupPath>) -> Vec<BackupPath> {
        let mut fresh: Vec<BackupPath> = paths
            .into_iter()
            .filter(|path| {
                let known = self.cache.contains(path.remote_key(), path.size);
                if known {
                    debug!("skipping already-uploaded {}", path.remote_key());
                }
                !known
            })
            .collect();
        fresh.sort();
        fresh
    }

    fn column_families(&self) -> BackupResult<Vec<(String, String)>> {
        let mut pairs = vec![];
        for keyspace in dir_names(&self.data.data_dir).map_err(BackupError::LocalRead)? {
            for column_family in
                dir_names(&self.data.data_dir.join(&keyspace)).map_err(BackupError::LocalRead)?
            {
                pairs.push((keyspace.clone(), column_family));
            }
        }
        Ok(pairs)
    }
}

fn dir_names(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn files_in(dir: &Path) -> std::io::Result<Vec<LocalFile>> {
    let mut files = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let metadata = entry.metadata()?;
        files.push(LocalFile {
            name,
            path: entry.path(),
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        });
    }
    Ok(files)
}

/// Push-based incremental discovery: watches the data directory and
/// emits batches of newly appeared SSTables.
pub struct IncrementalWatcher {
    discovery: Arc<Discovery>,
    tick_interval: Duration,
}

impl IncrementalWatcher {
    pub fn new(discovery: Arc<Discovery>, tick_interval: Duration) -> Self {
        Self {
            discovery,
            tick_interval,
        }
    }

    /// Runs until cancelled or the batch receiver goes away. Filesystem
    /// events only wake the scan early; a quiet period still rescans
    /// every tick interval.
    pub fn spawn(
        self,
        batches: mpsc::Sender<Vec<BackupPath>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (fs_event_sender, mut fs_events) = mpsc::channel(1);
            let mut watcher = match notify::recommended_watcher(move |result| {
                if let Err(err) = result {
                    warn!("filesystem watch error: {err:?}");
                }
                // coalesce bursts; a pending tick is enough
                let _ = fs_event_sender.try_send(());
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    error!("failed to initialize the filesystem watcher: {err}");
                    return;
                }
            };
            let data_dir = self.discovery.data_layout().data_dir.clone();
            if let Err(err) = watcher.watch(&data_dir, RecursiveMode::Recursive) {
                error!("failed to watch {}: {err}", data_dir.display());
                return;
            }
            info!("watching {} for incremental SSTables", data_dir.display());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Ok(Some(_)) | Err(_) = timeout(self.tick_interval, fs_events.recv()) => {
                        match self.discovery.incremental_files() {
                            Ok(batch) if batch.is_empty() => {}
                            Ok(batch) => {
                                if batches.send(batch).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("incremental scan failed: {err}"),
                        }
                    }
                }
            }
            info!("incremental watcher terminated");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_path::parse_instant;

    fn write(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn discovery(root: &Path) -> Discovery {
        Discovery::new(
            DataLayout {
                data_dir: root.join("data"),
                commit_log_dir: root.join("commitlog"),
            },
            KeyLayout::new("b", "p", "Test", "100"),
            Arc::new(UploadFingerprintCache::new()),
        )
    }

    #[test]
    fn snapshot_walk_emits_tagged_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("data/ks1/cf1/snapshots/201806051234/mc-1-big-Data.db"),
            b"data",
        );
        write(
            &root.join("data/ks1/cf2/snapshots/201806051234/mc-2-big-Data.db"),
            b"more data",
        );
        // a snapshot with a different tag is not part of this round
        write(
            &root.join("data/ks1/cf1/snapshots/201806051300/mc-3-big-Data.db"),
            b"x",
        );

        let instant = parse_instant("201806051234").unwrap();
        let paths = discovery(root).snapshot_files("201806051234", instant).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(
            paths[0].remote_key(),
            "b/p/tseT/100/201806051234/ks1/cf1/SNAP/mc-1-big-Data.db"
        );
        assert_eq!(paths[0].size, 4);
        assert_eq!(paths[0].time(), instant);
    }

    #[test]
    fn incremental_walk_uses_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("data/ks1/cf1/backups/mc-5-big-Data.db"), b"12345");
        // live SSTables outside backups/ are not incremental
        write(&root.join("data/ks1/cf1/mc-1-big-Data.db"), b"live");

        let paths = discovery(root).incremental_files().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].kind(), FileKind::SsTable);
        assert_eq!(paths[0].file_name(), "mc-5-big-Data.db");
        assert_eq!(paths[0].time(), paths[0].last_modified);
    }

    #[test]
    fn commit_logs_use_the_pseudo_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("commitlog/CommitLog-6-1.log"), b"log");

        let paths = discovery(root).commit_log_files().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].kind(), FileKind::CommitLog);
        assert_eq!(paths[0].keyspace(), COMMIT_LOG_KEYSPACE);
    }

    #[test]
    fn known_fingerprints_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("data/ks1/cf1/backups/mc-5-big-Data.db"), b"12345");

        let discovery = discovery(root);
        let first = discovery.incremental_files().unwrap();
        assert_eq!(first.len(), 1);

        discovery.cache.insert(
            first[0].remote_key().to_owned(),
            first[0].size,
            first[0].size,
            Utc::now(),
        );
        assert!(discovery.incremental_files().unwrap().is_empty());
    }
}
