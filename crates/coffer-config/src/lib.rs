// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Configuration surface of the backup sidecar.
//!
//! A [`SidecarConfig`] is loaded once at startup from a YAML file; every
//! other component receives the pieces it needs by construction. Invalid
//! values are fatal at startup via [`ConfigError::Invalid`].

use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use object_store::{
    ClientOptions, DynObjectStore, RetryConfig, aws::AmazonS3ConfigKey, azure::AzureConfigKey,
    gcp::GoogleConfigKey,
};
use serde::{Deserialize, Serialize};
use url::Url;

pub type ConfigResult<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid configuration: `{0}`")]
    Invalid(String),
}

/// Remote object store endpoint plus provider-specific options.
///
/// The URL scheme selects the driver: `s3://` (or any S3-compatible URL),
/// `gs://`, `az://`, `http(s)://`, `file://` for a local directory and
/// `memory://` for an in-process store used in tests.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectStoreConfig {
    pub url: String,
    /// Provider-specific options, e.g. `AmazonS3ConfigKey` names for S3.
    #[serde(default)]
    pub options: Vec<(String, String)>,
    /// Per-request timeout applied to every object store call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ObjectStoreConfig {
    /// Builds the store client. Request-level retries are disabled here;
    /// retry orchestration lives with the callers, which classify errors
    /// and apply backoff per transfer.
    pub fn make(&self) -> ConfigResult<Arc<DynObjectStore>> {
        let retry_config = RetryConfig {
            max_retries: 0,
            retry_timeout: Duration::from_secs(self.request_timeout_secs + 1),
            ..Default::default()
        };
        let client_options = ClientOptions::new()
            .with_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_allow_http(true);
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "memory" => Ok(Arc::new(object_store::memory::InMemory::new())),
            "file" => {
                let store = object_store::local::LocalFileSystem::new_with_prefix(url.path())?;
                Ok(Arc::new(store))
            }
            "gs" => {
                let mut builder = object_store::gcp::GoogleCloudStorageBuilder::new()
                    .with_url(url.as_str())
                    .with_retry(retry_config)
                    .with_client_options(client_options);
                for (key, value) in &self.options {
                    builder = builder.with_config(GoogleConfigKey::from_str(key)?, value);
                }
                Ok(Arc::new(builder.build()?))
            }
            "az" | "azure" => {
                let mut builder = object_store::azure::MicrosoftAzureBuilder::new()
                    .with_url(url.as_str())
                    .with_retry(retry_config)
                    .with_client_options(client_options);
                for (key, value) in &self.options {
                    builder = builder.with_config(AzureConfigKey::from_str(key)?, value);
                }
                Ok(Arc::new(builder.build()?))
            }
            "http" | "https" => {
                let store = object_store::http::HttpBuilder::new()
                    .with_url(url.as_str())
                    .with_retry(retry_config)
                    .with_client_options(client_options)
                    .build()?;
                Ok(Arc::new(store))
            }
            _ => {
                let mut builder = object_store::aws::AmazonS3Builder::new()
                    .with_url(url.as_str())
                    .with_retry(retry_config)
                    .with_client_options(client_options);
                for (key, value) in &self.options {
                    builder = builder.with_config(AmazonS3ConfigKey::from_str(key)?, value);
                }
                Ok(Arc::new(builder.build()?))
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct SidecarConfig {
    /// Top key segment inside the store (bucket-relative root).
    pub backup_location: String,
    /// Second key segment, shared by every node of the cluster.
    pub backup_prefix: String,
    /// Cluster name; reversed into the remote key to spread hash partitions.
    pub app_name: String,
    /// This node's position on the ring. Assigned by the identity
    /// subsystem; opaque to the sidecar.
    pub token: String,
    /// Deployment region, kept for operator introspection only.
    #[serde(default)]
    pub region: String,

    pub remote_store: ObjectStoreConfig,

    pub data_file_location: PathBuf,
    pub commit_log_location: PathBuf,
    /// Scratch directory for staged (compressed) files awaiting upload.
    /// Defaults to the system temp dir.
    #[serde(default)]
    pub staging_location: Option<PathBuf>,

    /// Cron expression for scheduled snapshot rounds; absent disables them.
    #[serde(default)]
    pub snapshot_schedule: Option<String>,
    #[serde(default = "default_true")]
    pub incremental_enabled: bool,
    /// How often the incremental watcher rescans after a quiet period.
    #[serde(default = "default_incremental_tick_ms")]
    pub incremental_tick_interval_ms: u64,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_restores: usize,
    /// 0 = unlimited.
    #[serde(default)]
    pub upload_rate_bytes_per_sec: u64,

    /// `snappy` | `zstd` | `none`.
    #[serde(default = "default_codec")]
    pub compression_codec: String,

    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// 0 = keep forever.
    #[serde(default)]
    pub retention_days: u32,

    /// Upper bound on a single transfer including retries. 0 = unlimited.
    #[serde(default = "default_per_file_timeout_secs")]
    pub per_file_timeout_secs: u64,
    /// Upper bound on a whole backup round. 0 = unlimited.
    #[serde(default)]
    pub round_timeout_secs: u64,

    /// Command the control-channel adapter shells out to
    /// (`<cmd> snapshot -t <tag>` and friends).
    #[serde(default = "default_db_control_command")]
    pub db_control_command: String,
}

fn default_true() -> bool {
    true
}

fn default_incremental_tick_ms() -> u64 {
    5000
}

fn default_concurrency() -> usize {
    5
}

fn default_codec() -> String {
    "snappy".to_owned()
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_multipart_part_size() -> u64 {
    16 * 1024 * 1024
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_per_file_timeout_secs() -> u64 {
    3600
}

fn default_db_control_command() -> String {
    "nodetool".to_owned()
}

impl SidecarConfig {
    pub fn load(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path.into())?;
        let config: SidecarConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot operate with. Called by `load`;
    /// exposed for configs assembled in code.
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("backup-location", &self.backup_location),
            ("backup-prefix", &self.backup_prefix),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a single non-empty key segment, got {value:?}"
                )));
            }
        }
        if self.app_name.is_empty() {
            return Err(ConfigError::Invalid("app-name must not be empty".into()));
        }
        if self.token.is_empty() || self.token.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "token must be a single non-empty key segment, got {:?}",
                self.token
            )));
        }
        if self.max_concurrent_files == 0 || self.max_concurrent_restores == 0 {
            return Err(ConfigError::Invalid(
                "max-concurrent-files and max-concurrent-restores must be >= 1".into(),
            ));
        }
        if !matches!(self.compression_codec.as_str(), "snappy" | "zstd" | "none") {
            return Err(ConfigError::Invalid(format!(
                "unknown compression-codec {:?}",
                self.compression_codec
            )));
        }
        if self.multipart_part_size == 0 || self.multipart_threshold == 0 {
            return Err(ConfigError::Invalid(
                "multipart-threshold and multipart-part-size must be > 0".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry-attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_location
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
backup-location: "b"
backup-prefix: "p"
app-name: "Test"
token: "100"
remote-store:
  url: "memory:///"
data-file-location: "/var/lib/db/data"
commit-log-location: "/var/lib/db/commitlog"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: SidecarConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_concurrent_files, 5);
        assert_eq!(config.compression_codec, "snappy");
        assert_eq!(config.upload_rate_bytes_per_sec, 0);
        assert!(config.incremental_enabled);
        assert!(config.snapshot_schedule.is_none());
    }

    #[test]
    fn slash_in_key_segment_is_rejected() {
        let mut config: SidecarConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.backup_prefix = "a/b".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("backup-prefix")
        ));
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut config: SidecarConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.compression_codec = "lz4".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config: SidecarConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.max_concurrent_files = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn memory_store_builds() {
        let config: SidecarConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.remote_store.make().unwrap();
    }
}
