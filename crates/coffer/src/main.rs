// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Sidecar entry point: daemon mode (scheduled snapshot rounds plus
//! incremental shipping), one-shot backup, one-shot restore and a
//! retention sweep.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use coffer_backup::{
    ActivityGuard, BackupCoordinator, BackupError, BackupMetrics, Clock, DataLayout, DbControl,
    DbControlError, Discovery, IncrementalWatcher, KeyLayout, RestoreOutcome, RestoreRequest,
    Restorer, RetentionSweeper, RoundOutcome, Schedule, SerializedDbControl, SystemClock,
    TransferRegistry, UploadFingerprintCache, Uploader, UploaderOptions, new_activity_guard,
    remote_path::parse_instant, run_schedule,
};
use coffer_config::SidecarConfig;
use coffer_storage::{ByteBucket, CompressionCodec, RetryPolicy, TransferGovernor};
use object_store::DynObjectStore;
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_CONFIG: u8 = 2;
const EXIT_MANIFEST_NOT_FOUND: u8 = 3;
const EXIT_STORE_PERMANENT: u8 = 4;
const EXIT_PARTIAL: u8 = 5;

#[derive(Parser)]
#[command(name = "coffer", about = "Backup/restore sidecar for a ring database node")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run continuously: scheduled snapshot rounds plus incremental
    /// shipping.
    Daemon {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a single backup round over accumulated incrementals and
    /// commit logs, then exit.
    Backup {
        #[arg(long)]
        config: PathBuf,
    },
    /// Restore this node to a point in time.
    Restore {
        #[arg(long)]
        config: PathBuf,
        /// RFC 3339 or yyyyMMddHHmm.
        #[arg(long)]
        time: String,
        #[arg(long)]
        keyspace: Option<String>,
        #[arg(long)]
        column_family: Option<String>,
    },
    /// Delete backups older than the retention window, then exit.
    Retention {
        #[arg(long)]
        config: PathBuf,
    },
}

/// Control-channel adapter shelling out to the node's admin command.
struct ExecDbControl {
    command: String,
}

impl ExecDbControl {
    async fn run(&self, args: &[&str]) -> Result<(), DbControlError> {
        let output = tokio::process::Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|err| DbControlError(format!("{} failed to spawn: {err}", self.command)))?;
        if !output.status.success() {
            return Err(DbControlError(format!(
                "{} {} exited with {}: {}",
                self.command,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DbControl for ExecDbControl {
    async fn snapshot(&self, tag: &str) -> Result<(), DbControlError> {
        self.run(&["snapshot", "-t", tag]).await
    }

    async fn refresh(&self, keyspace: &str, column_family: &str) -> Result<(), DbControlError> {
        self.run(&["refresh", keyspace, column_family]).await
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<(), DbControlError> {
        self.run(&["clearsnapshot", "-t", tag]).await
    }
}

/// Everything wired and ready to run; components only know the
/// interfaces they are constructed with.
struct Sidecar {
    config: SidecarConfig,
    coordinator: Arc<BackupCoordinator>,
    restorer: Arc<Restorer>,
    sweeper: Arc<RetentionSweeper>,
    discovery: Arc<Discovery>,
    cache: Arc<UploadFingerprintCache>,
    layout: KeyLayout,
    retry: RetryPolicy,
    store: Arc<DynObjectStore>,
}

fn build(config: SidecarConfig) -> anyhow::Result<Sidecar> {
    let store: Arc<DynObjectStore> = config.remote_store.make()?;
    let layout = KeyLayout::new(
        &config.backup_location,
        &config.backup_prefix,
        &config.app_name,
        &config.token,
    );
    let data = DataLayout {
        data_dir: config.data_file_location.clone(),
        commit_log_dir: config.commit_log_location.clone(),
    };
    let codec: CompressionCodec = config
        .compression_codec
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown compression codec {}", config.compression_codec))?;
    let retry = RetryPolicy::new(config.retry_attempts, config.retry_base_delay());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(TransferRegistry::new(1024, clock.clone()));
    let cache = Arc::new(UploadFingerprintCache::new());
    let metrics = BackupMetrics::new(&Registry::new());
    let bucket = ByteBucket::new(config.upload_rate_bytes_per_sec);
    let upload_governor = Arc::new(TransferGovernor::new(
        config.max_concurrent_files,
        bucket.clone(),
    ));
    let restore_governor = Arc::new(TransferGovernor::new(config.max_concurrent_restores, bucket));
    let guard: ActivityGuard = new_activity_guard();

    let discovery = Arc::new(Discovery::new(data.clone(), layout.clone(), cache.clone()));
    let db = Arc::new(SerializedDbControl::new(Arc::new(ExecDbControl {
        command: config.db_control_command.clone(),
    })));
    let uploader = Arc::new(Uploader::new(
        store.clone(),
        upload_governor,
        cache.clone(),
        registry.clone(),
        metrics.clone(),
        clock.clone(),
        UploaderOptions {
            codec,
            staging_dir: config.staging_dir().join("coffer-staging"),
            retry,
            multipart_threshold: config.multipart_threshold,
            multipart_part_size: config.multipart_part_size,
            per_file_timeout: duration_or_unlimited(config.per_file_timeout_secs),
        },
    )?);
    let coordinator = Arc::new(BackupCoordinator::new(
        store.clone(),
        discovery.clone(),
        uploader,
        db.clone(),
        layout.clone(),
        clock.clone(),
        metrics.clone(),
        retry,
        duration_or_unlimited(config.round_timeout_secs),
        guard.clone(),
    ));
    let restorer = Arc::new(Restorer::new(
        store.clone(),
        layout.clone(),
        data,
        codec,
        restore_governor,
        registry,
        metrics,
        db,
        retry,
        guard,
    ));
    let sweeper = Arc::new(RetentionSweeper::new(
        store.clone(),
        layout.clone(),
        clock,
        retry,
        config.retention_days,
    ));
    Ok(Sidecar {
        config,
        coordinator,
        restorer,
        sweeper,
        discovery,
        cache,
        layout,
        retry,
        store,
    })
}

fn duration_or_unlimited(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn setup_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot listen to SIGTERM")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("CTRL+C received, shutting down"),
            _ = terminate => info!("SIGTERM received, shutting down"),
        };
        token.cancel();
    });
}

async fn run_daemon(sidecar: Sidecar, token: CancellationToken) -> anyhow::Result<()> {
    sidecar
        .cache
        .warm_up(&sidecar.store, &sidecar.layout, &sidecar.retry)
        .await?;

    if sidecar.config.incremental_enabled {
        let (batch_sender, mut batches) = mpsc::channel(16);
        let watcher = IncrementalWatcher::new(
            sidecar.discovery.clone(),
            Duration::from_millis(sidecar.config.incremental_tick_interval_ms),
        );
        watcher.spawn(batch_sender, token.child_token());
        let coordinator = sidecar.coordinator.clone();
        let ship_token = token.child_token();
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                let report = coordinator.ship_incrementals(batch, &ship_token).await;
                if report.outcome != RoundOutcome::Success {
                    warn!("incremental shipping ended as {:?}", report.outcome);
                }
            }
        });
    }

    if let Some(expr) = &sidecar.config.snapshot_schedule {
        let schedule = Schedule::cron(expr)?;
        let coordinator = sidecar.coordinator.clone();
        let round_token = token.child_token();
        tokio::spawn(run_schedule(schedule, token.child_token(), move || {
            let coordinator = coordinator.clone();
            let round_token = round_token.clone();
            async move {
                let report = coordinator.run_snapshot_round(&round_token).await;
                info!("snapshot round finished: {:?}", report.outcome);
            }
        }));
    }

    if sidecar.config.retention_days > 0 {
        let sweeper = sidecar.sweeper.clone();
        tokio::spawn(run_schedule(
            Schedule::Interval(Duration::from_secs(24 * 60 * 60)),
            token.child_token(),
            move || {
                let sweeper = sweeper.clone();
                async move {
                    if let Err(err) = sweeper.sweep().await {
                        warn!("retention sweep failed: {err}");
                    }
                }
            },
        ));
    }

    token.cancelled().await;
    Ok(())
}

fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Ok(time.with_timezone(&Utc));
    }
    parse_instant(raw).map_err(|_| {
        anyhow::anyhow!("cannot parse {raw:?} as RFC 3339 or yyyyMMddHHmm")
    })
}

async fn run_restore(
    sidecar: &Sidecar,
    time: DateTime<Utc>,
    keyspace: Option<String>,
    column_family: Option<String>,
    token: CancellationToken,
) -> u8 {
    let request = RestoreRequest {
        time,
        keyspace,
        column_family,
    };
    match sidecar.restorer.restore(&request, &token).await {
        Ok(report) => match report.outcome {
            RestoreOutcome::Success => {
                info!(
                    "restore complete: {} placed, {} already present",
                    report.restored, report.skipped
                );
                0
            }
            RestoreOutcome::Failed(cause) => {
                error!(
                    "restore failed ({} of {} files): {cause}",
                    report.failed.len(),
                    report.records.len()
                );
                if report.permanent_store_failure {
                    EXIT_STORE_PERMANENT
                } else {
                    EXIT_PARTIAL
                }
            }
        },
        Err(err) => {
            error!("restore failed: {err}");
            match err {
                BackupError::ManifestNotFound { .. } => EXIT_MANIFEST_NOT_FOUND,
                BackupError::Config(_) => EXIT_CONFIG,
                BackupError::ManifestBroken(_) => EXIT_PARTIAL,
                _ => EXIT_STORE_PERMANENT,
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let token = CancellationToken::new();
    setup_shutdown(token.clone());

    let config_path = match &args.command {
        Command::Daemon { config }
        | Command::Backup { config }
        | Command::Restore { config, .. }
        | Command::Retention { config } => config.clone(),
    };
    let config = match SidecarConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("bad configuration {}: {err}", config_path.display());
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let sidecar = match build(config) {
        Ok(sidecar) => sidecar,
        Err(err) => {
            error!("failed to assemble the pipeline: {err}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let code = match args.command {
        Command::Daemon { .. } => {
            run_daemon(sidecar, token).await?;
            0
        }
        Command::Backup { .. } => {
            sidecar
                .cache
                .warm_up(&sidecar.store, &sidecar.layout, &sidecar.retry)
                .await?;
            let report = sidecar.coordinator.run_adhoc_round(&token).await;
            info!("backup round finished: {:?}", report.outcome);
            match report.outcome {
                RoundOutcome::Success => 0,
                _ => 1,
            }
        }
        Command::Restore {
            time,
            keyspace,
            column_family,
            ..
        } => {
            let time = match parse_time(&time) {
                Ok(time) => time,
                Err(err) => {
                    error!("{err}");
                    return Ok(ExitCode::from(EXIT_CONFIG));
                }
            };
            run_restore(&sidecar, time, keyspace, column_family, token).await
        }
        Command::Retention { .. } => {
            let deleted = sidecar.sweeper.sweep().await?;
            info!("retention sweep removed {deleted} objects");
            0
        }
    };
    Ok(ExitCode::from(code))
}
