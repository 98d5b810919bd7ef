//! In-flight execution records
//!
//! One record per (event, binding) execution. The dispatcher creates and
//! advances records; everyone else reads snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

impl InFlightStatus {
    pub fn can_transition_to(self, next: InFlightStatus) -> bool {
        use InFlightStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, DeadLettered)
                | (Failed, Pending)
                | (Failed, DeadLettered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InFlightStatus::Succeeded | InFlightStatus::DeadLettered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("no in-flight record for event {event_id} binding {binding}")]
    UnknownRecord { event_id: Uuid, binding: String },

    #[error("illegal transition {from:?} -> {to:?}")]
    Illegal {
        from: InFlightStatus,
        to: InFlightStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightRecord {
    pub event_id: Uuid,
    pub binding: String,
    pub subject: String,
    pub generation: u64,
    /// Executions started so far
    pub attempt: u32,
    pub status: InFlightStatus,
    pub started_at: DateTime<Utc>,
}

type Key = (Uuid, String);

#[derive(Default)]
pub struct InFlightRegistry {
    records: Mutex<HashMap<Key, InFlightRecord>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, InFlightRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim an (event, binding) execution with a `Pending` record.
    ///
    /// Returns false, leaving the existing record untouched, when another
    /// copy of the delivery already holds the claim.
    pub fn begin(&self, event_id: Uuid, binding: &str, subject: &str, generation: u64) -> bool {
        match self.lock().entry((event_id, binding.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(InFlightRecord {
                    event_id,
                    binding: binding.to_string(),
                    subject: subject.to_string(),
                    generation,
                    attempt: 0,
                    status: InFlightStatus::Pending,
                    started_at: Utc::now(),
                });
                true
            }
        }
    }

    pub fn contains(&self, event_id: Uuid, binding: &str) -> bool {
        self.lock().contains_key(&(event_id, binding.to_string()))
    }

    /// Advance a record. Entering `Running` counts an attempt; terminal
    /// statuses remove the record.
    pub fn transition(
        &self,
        event_id: Uuid,
        binding: &str,
        next: InFlightStatus,
    ) -> Result<u32, TransitionError> {
        let mut records = self.lock();
        let key = (event_id, binding.to_string());
        let record = records
            .get_mut(&key)
            .ok_or_else(|| TransitionError::UnknownRecord {
                event_id,
                binding: binding.to_string(),
            })?;

        if !record.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        if next == InFlightStatus::Running {
            record.attempt += 1;
        }
        let attempt = record.attempt;

        if next.is_terminal() {
            records.remove(&key);
        }
        Ok(attempt)
    }

    /// Drop a record without a terminal transition (execution abandoned)
    pub fn forget(&self, event_id: Uuid, binding: &str) {
        self.lock().remove(&(event_id, binding.to_string()));
    }

    pub fn snapshot(&self) -> Vec<InFlightRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
