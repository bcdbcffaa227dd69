// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! In-memory record of in-flight and completed transfers.
//!
//! Readers snapshot without blocking writers; state transitions take a
//! per-record lock. An append-only ring buffer of transition events backs
//! the status surface.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use strum::Display;

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TransferState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct TransferRecord {
    pub remote_key: String,
    pub state: TransferState,
    pub attempts: u32,
    pub bytes_transferred: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferRecord {
    fn new(remote_key: String) -> Self {
        Self {
            remote_key,
            state: TransferState::Pending,
            attempts: 0,
            bytes_transferred: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferEvent {
    pub remote_key: String,
    pub from: TransferState,
    pub to: TransferState,
    pub at: DateTime<Utc>,
}

pub struct TransferRegistry {
    records: RwLock<HashMap<String, Arc<Mutex<TransferRecord>>>>,
    events: Mutex<VecDeque<TransferEvent>>,
    event_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl TransferRegistry {
    pub fn new(event_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(event_capacity)),
            event_capacity,
            clock,
        }
    }

    /// Registers a transfer in `Pending` state. Re-enqueueing a known key
    /// resets its record (a fresh round retries the transfer).
    pub fn enqueue(&self, remote_key: &str) {
        let record = Arc::new(Mutex::new(TransferRecord::new(remote_key.to_owned())));
        self.records
            .write()
            .insert(remote_key.to_owned(), record);
    }

    fn with_record(&self, remote_key: &str, apply: impl FnOnce(&mut TransferRecord)) {
        let record = self.records.read().get(remote_key).cloned();
        if let Some(record) = record {
            apply(&mut record.lock());
        }
    }

    fn transition(&self, remote_key: &str, to: TransferState) {
        let mut from = None;
        self.with_record(remote_key, |record| {
            from = Some(record.state);
            record.state = to;
        });
        let Some(from) = from else { return };
        let mut events = self.events.lock();
        if events.len() == self.event_capacity {
            events.pop_front();
        }
        events.push_back(TransferEvent {
            remote_key: remote_key.to_owned(),
            from,
            to,
            at: self.clock.now(),
        });
    }

    /// Marks one attempt as started.
    pub fn mark_running(&self, remote_key: &str) {
        let now = self.clock.now();
        self.with_record(remote_key, |record| {
            record.attempts += 1;
            record.started_at.get_or_insert(now);
        });
        self.transition(remote_key, TransferState::Running);
    }

    pub fn add_bytes(&self, remote_key: &str, bytes: u64) {
        self.with_record(remote_key, |record| record.bytes_transferred += bytes);
    }

    pub fn complete(&self, remote_key: &str) {
        let now = self.clock.now();
        self.with_record(remote_key, |record| {
            record.ended_at = Some(now);
            record.error = None;
        });
        self.transition(remote_key, TransferState::Done);
    }

    pub fn fail(&self, remote_key: &str, error: &str) {
        let now = self.clock.now();
        self.with_record(remote_key, |record| {
            record.ended_at = Some(now);
            record.error = Some(error.to_owned());
        });
        self.transition(remote_key, TransferState::Failed);
    }

    pub fn get(&self, remote_key: &str) -> Option<TransferRecord> {
        self.records
            .read()
            .get(remote_key)
            .map(|record| record.lock().clone())
    }

    /// Point-in-time copy of every record, ordered by remote key.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .records
            .read()
            .values()
            .map(|record| record.lock().clone())
            .collect();
        records.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
        records
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Drops terminal records beyond the `keep` most recently ended.
    pub fn prune_finished(&self, keep: usize) {
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .records
            .read()
            .values()
            .filter_map(|record| {
                let record = record.lock();
                record
                    .state
                    .is_terminal()
                    .then(|| (record.ended_at.unwrap_or_default(), record.remote_key.clone()))
            })
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        let mut records = self.records.write();
        for (_, key) in finished.into_iter().skip(keep) {
            records.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn registry() -> TransferRegistry {
        TransferRegistry::new(4, Arc::new(SystemClock))
    }

    #[test]
    fn lifecycle_transitions_are_recorded() {
        let registry = registry();
        registry.enqueue("k1");
        assert_eq!(registry.get("k1").unwrap().state, TransferState::Pending);

        registry.mark_running("k1");
        registry.add_bytes("k1", 100);
        registry.mark_running("k1");
        registry.complete("k1");

        let record = registry.get("k1").unwrap();
        assert_eq!(record.state, TransferState::Done);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.bytes_transferred, 100);
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn failure_keeps_the_cause() {
        let registry = registry();
        registry.enqueue("k1");
        registry.mark_running("k1");
        registry.fail("k1", "permanent remote error");
        let record = registry.get("k1").unwrap();
        assert_eq!(record.state, TransferState::Failed);
        assert_eq!(record.error.as_deref(), Some("permanent remote error"));
    }

    #[test]
    fn event_ring_is_bounded() {
        let registry = registry();
        for i in 0..10 {
            let key = format!("k{i}");
            registry.enqueue(&key);
            registry.mark_running(&key);
        }
        assert_eq!(registry.events().len(), 4);
    }

    #[test]
    fn snapshot_is_ordered_by_key() {
        let registry = registry();
        registry.enqueue("b");
        registry.enqueue("a");
        let keys: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|record| record.remote_key)
            .collect();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn prune_keeps_the_most_recent_terminal_records() {
        let registry = registry();
        for i in 0..5 {
            let key = format!("k{i}");
            registry.enqueue(&key);
            registry.mark_running(&key);
            registry.complete(&key);
        }
        registry.enqueue("running");
        registry.mark_running("running");

        registry.prune_finished(2);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().any(|r| r.remote_key == "running"));
    }
}
