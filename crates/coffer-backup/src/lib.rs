// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Core of the backup/restore sidecar for a token-ring columnar
//! database node.
//!
//! The pipeline maps local SSTables, commit logs and snapshots onto
//! object-store keys ([`remote_path`]), discovers and uploads them in
//! bounded-concurrency rounds ([`discovery`], [`uploader`], [`round`]),
//! records every round in a manifest that doubles as its commit marker
//! ([`manifest`]), and reverses the whole thing for point-in-time
//! restores ([`restore`]). Transfer state is observable through
//! [`registry`]; [`scheduler`] drives periodic rounds.

use std::sync::Arc;

pub mod clock;
pub mod db_control;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod metrics;
pub mod registry;
pub mod remote_path;
pub mod restore;
pub mod retention;
pub mod round;
pub mod scheduler;
pub mod uploader;

pub use clock::{Clock, FixedClock, SystemClock};
pub use db_control::{DbControl, DbControlError, SerializedDbControl};
pub use discovery::{DataLayout, Discovery, IncrementalWatcher};
pub use error::{BackupError, BackupResult};
pub use fingerprint::UploadFingerprintCache;
pub use manifest::{Manifest, ManifestEntry, ManifestV2, RoundManifest};
pub use metrics::BackupMetrics;
pub use registry::{TransferRecord, TransferRegistry, TransferState};
pub use remote_path::{BackupPath, FileKind, KeyLayout};
pub use restore::{RestoreOutcome, RestoreReport, RestoreRequest, Restorer};
pub use retention::RetentionSweeper;
pub use round::{BackupCoordinator, RoundOutcome, RoundReport};
pub use scheduler::{CronExpr, Schedule, run_schedule};
pub use uploader::{Uploader, UploaderOptions};

/// Mutual-exclusion handle shared by the backup coordinator and the
/// restorer: a round fired while the other side holds it is skipped.
pub type ActivityGuard = Arc<tokio::sync::Mutex<()>>;

pub fn new_activity_guard() -> ActivityGuard {
    Arc::new(tokio::sync::Mutex::new(()))
}
