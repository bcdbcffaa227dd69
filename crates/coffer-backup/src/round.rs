// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Backup rounds: one triggered invocation of the pipeline.
//!
//! A round discovers its file set, uploads it, and publishes the round
//! manifest strictly after every data file landed; the manifest is the
//! round's commit marker. Partial failure keeps the data files that made
//! it but withholds the manifest, so a later round can resume. Rounds
//! never overlap each other or a running restore: the busy one wins and
//! the newcomer is skipped.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use coffer_storage::RetryPolicy;
use object_store::DynObjectStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ActivityGuard,
    clock::Clock,
    db_control::{DbControl, SerializedDbControl},
    discovery::Discovery,
    error::BackupError,
    manifest::RoundManifest,
    metrics::BackupMetrics,
    remote_path::{BackupPath, KeyLayout, format_instant, truncate_to_minute},
    uploader::{UploadOutcome, Uploader},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Success,
    PartialFailure(usize),
    Failed(String),
    /// Overlap policy: a round fired while another round or a restore
    /// was still running.
    Skipped,
}

impl RoundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RoundOutcome::Success => "success",
            RoundOutcome::PartialFailure(_) => "partial_failure",
            RoundOutcome::Failed(_) => "failed",
            RoundOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub outcome: RoundOutcome,
    /// Transfer-record ids (remote keys) touched by the round.
    pub records: Vec<String>,
    pub manifest_key: Option<String>,
    pub uploaded: usize,
    pub skipped: usize,
}

impl RoundReport {
    fn skipped() -> Self {
        Self {
            outcome: RoundOutcome::Skipped,
            records: vec![],
            manifest_key: None,
            uploaded: 0,
            skipped: 0,
        }
    }

    fn failed(cause: &BackupError) -> Self {
        Self {
            outcome: RoundOutcome::Failed(cause.to_string()),
            records: vec![],
            manifest_key: None,
            uploaded: 0,
            skipped: 0,
        }
    }
}

pub struct BackupCoordinator {
    store: Arc<DynObjectStore>,
    discovery: Arc<Discovery>,
    uploader: Arc<Uploader>,
    db: Arc<SerializedDbControl>,
    layout: KeyLayout,
    clock: Arc<dyn Clock>,
    metrics: BackupMetrics,
    retry: RetryPolicy,
    round_timeout: Option<Duration>,
    guard: ActivityGuard,
}

impl BackupCoordinator {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DynObjectStore>,
        discovery: Arc<Discovery>,
        uploader: Arc<Uploader>,
        db: Arc<SerializedDbControl>,
        layout: KeyLayout,
        clock: Arc<dyn Clock>,
        metrics: BackupMetrics,
        retry: RetryPolicy,
        round_timeout: Option<Duration>,
        guard: ActivityGuard,
    ) -> Self {
        Self {
            store,
            discovery,
            uploader,
            db,
            layout,
            clock,
            metrics,
            retry,
            round_timeout,
            guard,
        }
    }

    /// Snapshot round: trigger a snapshot tagged with the round instant,
    /// ship it, publish the manifest, then drop the snapshot.
    pub async fn run_snapshot_round(&self, token: &CancellationToken) -> RoundReport {
        let Ok(_guard) = self.guard.try_lock() else {
            return self.round_skipped();
        };
        let instant = truncate_to_minute(self.clock.now());
        let tag = format_instant(instant);
        info!("starting snapshot round {tag}");

        if let Err(err) = self.db.snapshot(&tag).await {
            let cause = BackupError::DbControl(err.to_string());
            warn!("snapshot round {tag} failed: {cause}");
            return self.finish(RoundReport::failed(&cause));
        }
        let files = match self.discovery.snapshot_files(&tag, instant) {
            Ok(files) => files,
            Err(err) => {
                warn!("snapshot round {tag} failed to enumerate files: {err}");
                return self.finish(RoundReport::failed(&err));
            }
        };
        let report = self.upload_round(files, instant, token).await;
        if report.outcome == RoundOutcome::Success {
            if let Err(err) = self.db.clear_snapshot(&tag).await {
                warn!("failed to clear snapshot {tag}: {err}");
            }
        }
        self.finish(report)
    }

    /// One-shot round over everything discovery currently sees:
    /// accumulated incremental SSTables plus commit logs.
    pub async fn run_adhoc_round(&self, token: &CancellationToken) -> RoundReport {
        let Ok(_guard) = self.guard.try_lock() else {
            return self.round_skipped();
        };
        let instant = truncate_to_minute(self.clock.now());
        let files = match self.collect_adhoc_files() {
            Ok(files) => files,
            Err(err) => return self.finish(RoundReport::failed(&err)),
        };
        let report = self.upload_round(files, instant, token).await;
        self.finish(report)
    }

    /// Round over an explicit file set.
    pub async fn run_files_round(
        &self,
        files: Vec<BackupPath>,
        token: &CancellationToken,
    ) -> RoundReport {
        let Ok(_guard) = self.guard.try_lock() else {
            return self.round_skipped();
        };
        let instant = truncate_to_minute(self.clock.now());
        let report = self.upload_round(files, instant, token).await;
        self.finish(report)
    }

    /// Watcher-driven shipping: uploads the batch without publishing a
    /// manifest. Restores reach these files through the
    /// snapshot-plus-incrementals composition.
    pub async fn ship_incrementals(
        &self,
        files: Vec<BackupPath>,
        token: &CancellationToken,
    ) -> RoundReport {
        let Ok(_guard) = self.guard.try_lock() else {
            return self.round_skipped();
        };
        let records: Vec<String> = files.iter().map(|f| f.remote_key().to_owned()).collect();
        let outcome = self.uploader.upload_batch(files, None, token).await;
        self.finish(report_from(outcome, records, None))
    }

    fn collect_adhoc_files(&self) -> crate::error::BackupResult<Vec<BackupPath>> {
        let mut files = self.discovery.incremental_files()?;
        files.extend(self.discovery.commit_log_files()?);
        files.sort();
        Ok(files)
    }

    async fn upload_round(
        &self,
        files: Vec<BackupPath>,
        instant: DateTime<Utc>,
        token: &CancellationToken,
    ) -> RoundReport {
        if files.is_empty() {
            info!("round {}: nothing to upload", format_instant(instant));
            return RoundReport {
                outcome: RoundOutcome::Success,
                records: vec![],
                manifest_key: None,
                uploaded: 0,
                skipped: 0,
            };
        }
        let records: Vec<String> = files.iter().map(|f| f.remote_key().to_owned()).collect();
        let manifest = RoundManifest::new(self.layout.clone(), instant);

        // a round timeout is cancellation of the round's scope: workers
        // observe it at their next suspension point and wind down
        let round_token = token.child_token();
        let work = self.uploader.upload_batch(files, Some(&manifest), &round_token);
        tokio::pin!(work);
        let outcome = match self.round_timeout {
            Some(limit) => {
                tokio::select! {
                    outcome = &mut work => outcome,
                    _ = sleep(limit) => {
                        warn!("round {} exceeded {}s, cancelling", format_instant(instant), limit.as_secs());
                        round_token.cancel();
                        work.await
                    }
                }
            }
            None => work.await,
        };

        if outcome.failed.is_empty() {
            match manifest.publish(&self.store, &self.retry).await {
                Ok(key) => {
                    info!(
                        "round {} committed: {} uploaded, {} skipped, manifest {key}",
                        format_instant(instant),
                        outcome.uploaded,
                        outcome.skipped
                    );
                    report_from(outcome, records, Some(key))
                }
                Err(err) => {
                    warn!("round {} failed to publish its manifest: {err}", format_instant(instant));
                    RoundReport {
                        outcome: RoundOutcome::Failed(err.to_string()),
                        records,
                        manifest_key: None,
                        uploaded: outcome.uploaded,
                        skipped: outcome.skipped,
                    }
                }
            }
        } else {
            report_from(outcome, records, None)
        }
    }

    fn round_skipped(&self) -> RoundReport {
        warn!("RoundSkipped: a round or restore is still running");
        let report = RoundReport::skipped();
        self.metrics.rounds.with_label_values(&[report.outcome.label()]).inc();
        report
    }

    fn finish(&self, report: RoundReport) -> RoundReport {
        self.metrics
            .rounds
            .with_label_values(&[report.outcome.label()])
            .inc();
        report
    }
}

fn report_from(
    outcome: UploadOutcome,
    records: Vec<String>,
    manifest_key: Option<String>,
) -> RoundReport {
    let round_outcome = if outcome.failed.is_empty() {
        RoundOutcome::Success
    } else if outcome
        .failed
        .iter()
        .any(|(_, err)| matches!(err, BackupError::Cancelled))
    {
        RoundOutcome::Failed("cancelled".to_owned())
    } else {
        RoundOutcome::PartialFailure(outcome.failed.len())
    };
    RoundReport {
        outcome: round_outcome,
        records,
        manifest_key,
        uploaded: outcome.uploaded,
        skipped: outcome.skipped,
    }
}
