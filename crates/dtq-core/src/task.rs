use crate::{TaskError, Result, RECORD_DELIMITER, RECORD_ESCAPE};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Caller-assigned task identifier. The broker does not enforce uniqueness.
pub type TaskId = i32;

const RECORD_FIELDS: usize = 6;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Task status in the queue system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskStatus {
    /// Task is waiting to be assigned to a worker
    Pending = 0,
    /// Task is currently being processed by a worker
    InProgress = 1,
    /// Task completed successfully
    Completed = 2,
    /// Task failed
    Failed = 3,
}

impl TaskStatus {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::InProgress),
            2 => Some(TaskStatus::Completed),
            3 => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work exchanged by value between producers, the broker and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    /// Opaque work description
    pub payload: String,

    pub status: TaskStatus,

    /// Opaque result, empty until completion
    pub result: String,

    /// Broker-level delivery retries
    pub retry_count: i32,

    /// Set by the broker at enqueue, used for latency measurement
    pub enqueue_time_ms: i64,
}

impl Task {
    /// Create a pending task
    pub fn new(task_id: TaskId, payload: impl Into<String>) -> Self {
        Task {
            task_id,
            payload: payload.into(),
            status: TaskStatus::Pending,
            result: String::new(),
            retry_count: 0,
            enqueue_time_ms: 0,
        }
    }

    /// Record the enqueue timestamp
    pub fn stamp_enqueue_time(&mut self) {
        self.enqueue_time_ms = now_ms();
    }

    /// Milliseconds elapsed between enqueue and `now_ms`
    pub fn latency_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.enqueue_time_ms).max(0)
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        self.status = TaskStatus::Completed;
        self.result = result.into();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.result = reason.into();
    }

    /// Reset for another delivery attempt after a failed handoff
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Encode as `taskId|payload|status|result|retryCount|enqueueTimeMs`.
    ///
    /// Delimiters and escape characters inside `payload` and `result` are
    /// backslash-escaped, so any string survives a round trip. Records whose
    /// text fields contain neither character are the plain delimited format.
    pub fn to_record(&self) -> String {
        let mut record = String::with_capacity(self.payload.len() + self.result.len() + 32);
        record.push_str(&self.task_id.to_string());
        record.push(RECORD_DELIMITER);
        push_escaped(&mut record, &self.payload);
        record.push(RECORD_DELIMITER);
        record.push_str(&self.status.as_i32().to_string());
        record.push(RECORD_DELIMITER);
        push_escaped(&mut record, &self.result);
        record.push(RECORD_DELIMITER);
        record.push_str(&self.retry_count.to_string());
        record.push(RECORD_DELIMITER);
        record.push_str(&self.enqueue_time_ms.to_string());
        record
    }

    /// Decode a record produced by [`Task::to_record`]
    pub fn from_record(record: &str) -> Result<Self> {
        let fields = split_record(record)?;
        if fields.len() != RECORD_FIELDS {
            return Err(TaskError::Malformed(format!(
                "expected {} fields, got {}",
                RECORD_FIELDS,
                fields.len()
            )));
        }

        let mut fields = fields.into_iter();
        let mut next = || fields.next().unwrap_or_default();

        let task_id = parse_field::<TaskId>(&next(), "task id")?;
        let payload = next();
        let raw_status = parse_field::<i32>(&next(), "status")?;
        let status = TaskStatus::from_i32(raw_status).ok_or(TaskError::InvalidStatus(raw_status))?;
        let result = next();
        let retry_count = parse_field::<i32>(&next(), "retry count")?;
        let enqueue_time_ms = parse_field::<i64>(&next(), "enqueue time")?;

        Ok(Task {
            task_id,
            payload,
            status,
            result,
            retry_count,
            enqueue_time_ms,
        })
    }

    /// Serialize task to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_record().into_bytes()
    }

    /// Deserialize task from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record = std::str::from_utf8(bytes)?;
        Self::from_record(record)
    }
}

fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        if c == RECORD_DELIMITER || c == RECORD_ESCAPE {
            out.push(RECORD_ESCAPE);
        }
        out.push(c);
    }
}

fn split_record(record: &str) -> Result<Vec<String>> {
    let mut fields = Vec::with_capacity(RECORD_FIELDS);
    let mut current = String::new();
    let mut chars = record.chars();

    while let Some(c) = chars.next() {
        if c == RECORD_ESCAPE {
            match chars.next() {
                Some(escaped) => current.push(escaped),
                None => {
                    return Err(TaskError::Malformed("dangling escape at end of record".to_string()))
                }
            }
        } else if c == RECORD_DELIMITER {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    Ok(fields)
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    field
        .parse::<T>()
        .map_err(|e| TaskError::Malformed(format!("{} {:?}: {}", name, field, e)))
}
