// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    IntCounter, IntCounterVec, Registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
};

#[derive(Clone)]
pub struct BackupMetrics {
    pub files_uploaded: IntCounterVec,
    pub files_skipped: IntCounter,
    pub files_failed: IntCounter,
    pub bytes_uploaded: IntCounter,
    pub files_restored: IntCounter,
    pub rounds: IntCounterVec,
}

impl BackupMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            files_uploaded: register_int_counter_vec_with_registry!(
                "coffer_files_uploaded",
                "Number of files uploaded, by file kind.",
                &["kind"],
                registry,
            )
            .unwrap(),
            files_skipped: register_int_counter_with_registry!(
                "coffer_files_skipped",
                "Number of uploads skipped via the fingerprint cache.",
                registry,
            )
            .unwrap(),
            files_failed: register_int_counter_with_registry!(
                "coffer_files_failed",
                "Number of transfers that reached a terminal failure.",
                registry,
            )
            .unwrap(),
            bytes_uploaded: register_int_counter_with_registry!(
                "coffer_bytes_uploaded",
                "Compressed bytes shipped to the object store.",
                registry,
            )
            .unwrap(),
            files_restored: register_int_counter_with_registry!(
                "coffer_files_restored",
                "Number of files placed by restores.",
                registry,
            )
            .unwrap(),
            rounds: register_int_counter_vec_with_registry!(
                "coffer_rounds",
                "Backup rounds, by outcome.",
                &["outcome"],
                registry,
            )
            .unwrap(),
        }
    }

    /// Metrics wired to a throwaway registry, for tests and tools that do
    /// not scrape.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new())
    }
}
