//! Task record: the unit of work handed to one worker queue.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskState;
use super::worker::WorkerName;

/// Opaque task payload.
///
/// The dispatch core never looks inside. At rest it is written as a plain
/// string when the bytes are UTF-8 so operators can read it, otherwise as
/// `{"base64": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PayloadRepr {
    Text(String),
    Binary { base64: String },
}

impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match std::str::from_utf8(&self.0) {
            Ok(text) => PayloadRepr::Text(text.to_string()),
            Err(_) => PayloadRepr::Binary {
                base64: STANDARD.encode(&self.0),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match PayloadRepr::deserialize(deserializer)? {
            PayloadRepr::Text(text) => Ok(Self(text.into_bytes())),
            PayloadRepr::Binary { base64 } => STANDARD
                .decode(base64)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// A task as stored by the `TaskStore`.
///
/// Fields are read-only outside the crate: the only way to change a task is
/// `TaskStore::transition`, which calls [`Task::apply_transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    worker: WorkerName,
    payload: Payload,
    state: TaskState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempt: u32,
}

impl Task {
    pub fn new(id: TaskId, worker: WorkerName, payload: Payload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            worker,
            payload,
            state: TaskState::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            attempt: 0,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn worker(&self) -> &WorkerName {
        &self.worker
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// FIFO order within a worker queue: creation time, then id.
    pub fn fifo_key(&self) -> (DateTime<Utc>, TaskId) {
        (self.created_at, self.id)
    }

    /// Apply an already-validated transition and its timestamp side effects.
    ///
    /// Callers check `state().can_transition_to(to)` and the CAS precondition
    /// first; this only rewrites fields.
    pub(crate) fn apply_transition(&mut self, to: TaskState, now: DateTime<Utc>) {
        let from = self.state;
        match to {
            TaskState::Processing => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            TaskState::Completed | TaskState::Failed => {
                self.completed_at = Some(now);
            }
            TaskState::Pending => {
                if matches!(from, TaskState::Processing | TaskState::Failed) {
                    self.attempt = self.attempt.saturating_add(1);
                }
                self.started_at = None;
                self.completed_at = None;
            }
            TaskState::DeadLettered => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(now);
                }
            }
        }
        self.state = to;
    }
}
