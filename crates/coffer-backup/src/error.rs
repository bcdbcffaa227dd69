// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use coffer_storage::{CompressError, StoreError, ThrottleError};

pub type BackupResult<T, E = BackupError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackupError {
    #[error("configuration error: `{0}`")]
    Config(String),

    #[error("malformed remote key `{key}`: {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("local read error: `{0}`")]
    LocalRead(std::io::Error),

    #[error("local write error: `{0}`")]
    LocalWrite(std::io::Error),

    #[error("transient remote error: `{0}`")]
    RemoteTransient(String),

    #[error("permanent remote error: `{0}`")]
    RemotePermanent(String),

    #[error("corrupt compressed stream: `{0}`")]
    CorruptCompressed(String),

    #[error("no manifest found for token `{token}` at or before {time}")]
    ManifestNotFound { token: String, time: String },

    #[error("manifest broken: `{0}`")]
    ManifestBroken(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timeout: `{0}`")]
    Timeout(String),

    #[error("db control channel error: `{0}`")]
    DbControl(String),
}

impl BackupError {
    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        BackupError::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Transient remote failures, local read failures and timeouts are
    /// worth another attempt; everything else, local write failures
    /// included, surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::RemoteTransient(_) | BackupError::LocalRead(_) | BackupError::Timeout(_)
        )
    }

    /// Classifies a compression-layer failure whose I/O side is reading
    /// local data.
    pub fn compress_read(err: CompressError) -> Self {
        match err {
            CompressError::Io(err) => BackupError::LocalRead(err),
            CompressError::Corrupt(msg) => BackupError::CorruptCompressed(msg),
            _ => unreachable!("CompressError has no other variants"),
        }
    }

    /// Classifies a compression-layer failure whose I/O side is writing
    /// local data.
    pub fn compress_write(err: CompressError) -> Self {
        match err {
            CompressError::Io(err) => BackupError::LocalWrite(err),
            CompressError::Corrupt(msg) => BackupError::CorruptCompressed(msg),
            _ => unreachable!("CompressError has no other variants"),
        }
    }
}

impl From<StoreError> for BackupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => BackupError::RemotePermanent("object not found".into()),
            StoreError::Transient(msg) => BackupError::RemoteTransient(msg),
            StoreError::Permanent(msg) => BackupError::RemotePermanent(msg),
            _ => unreachable!("StoreError has no other variants"),
        }
    }
}

impl From<ThrottleError> for BackupError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Cancelled => BackupError::Cancelled,
            _ => unreachable!("ThrottleError has no other variants"),
        }
    }
}
