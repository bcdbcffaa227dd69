// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Minimal adapter over the local database control channel.
//!
//! The pipeline depends on exactly three operations and nothing of the
//! database wire protocol. Calls are serialized process-wide: the control
//! channel tolerates only one outstanding request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("db control call failed: `{0}`")]
pub struct DbControlError(pub String);

#[async_trait]
pub trait DbControl: Send + Sync {
    /// Takes a named snapshot (a hardlink set) of every keyspace.
    async fn snapshot(&self, tag: &str) -> Result<(), DbControlError>;

    /// Makes the database pick up files placed under a column family's
    /// data directory.
    async fn refresh(&self, keyspace: &str, column_family: &str) -> Result<(), DbControlError>;

    /// Drops a named snapshot.
    async fn clear_snapshot(&self, tag: &str) -> Result<(), DbControlError>;
}

/// Wraps a [`DbControl`] so at most one call is in flight.
pub struct SerializedDbControl {
    inner: Arc<dyn DbControl>,
    lock: Mutex<()>,
}

impl SerializedDbControl {
    pub fn new(inner: Arc<dyn DbControl>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl DbControl for SerializedDbControl {
    async fn snapshot(&self, tag: &str) -> Result<(), DbControlError> {
        let _guard = self.lock.lock().await;
        self.inner.snapshot(tag).await
    }

    async fn refresh(&self, keyspace: &str, column_family: &str) -> Result<(), DbControlError> {
        let _guard = self.lock.lock().await;
        self.inner.refresh(keyspace, column_family).await
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<(), DbControlError> {
        let _guard = self.lock.lock().await;
        self.inner.clear_snapshot(tag).await
    }
}
