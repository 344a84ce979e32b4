// Row-shaped types shared between the engine and the storage backends.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task state. `Pending`/`Retry`/`Progress` rows live in the pending
/// partition, the rest in the archive partition; a task crosses over exactly
/// once and never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Progress,
    Successful,
    Error,
    Retry,
    Canceled,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "progress" => Some(Self::Progress),
            "successful" => Some(Self::Successful),
            "error" => Some(Self::Error),
            "retry" => Some(Self::Retry),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progress => "progress",
            Self::Successful => "successful",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::Canceled => "canceled",
        }
    }

    /// True for statuses that belong to the archive partition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Error | Self::Canceled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored task, as returned by claim and lookup operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub reference: Option<String>,
    pub eta: DateTime<Utc>,
    pub name: String,
    pub params: Map<String, Value>,
    pub max_retries: i32,
    pub retry_delay: Duration,
    pub status: TaskStatus,
    pub last_stamp: DateTime<Utc>,
    /// Number of failed attempts so far; None until the first attempt.
    pub retries: Option<i32>,
}

/// Insert payload for the pending partition. `eta: None` means "now"
/// (resolved server-side so a single clock decides eligibility).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub params: Map<String, Value>,
    pub reference: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub retry_delay: Duration,
}

/// One append-only execution-log row; one per attempt, never updated.
#[derive(Debug, Clone)]
pub struct TaskLogEntry {
    pub task_id: i64,
    pub eta: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_cls: Option<String>,
    pub traceback: Option<String>,
}

/// Result of one watermark advance: the transaction-local `now`, the
/// previous watermark, and whether the singleton row was created by this
/// call (first-ever tick against this schema).
#[derive(Debug, Clone, Copy)]
pub struct CronWindow {
    pub now: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub first_boot: bool,
}

/// Earliest-run time accepted by `schedule`: an absolute timestamp or epoch
/// seconds.
#[derive(Debug, Clone, Copy)]
pub enum Eta {
    Timestamp(DateTime<Utc>),
    Epoch(f64),
}

impl Eta {
    pub fn resolve(&self) -> DateTime<Utc> {
        match *self {
            Eta::Timestamp(dt) => dt,
            Eta::Epoch(secs) => {
                let millis = (secs * 1000.0) as i64;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or_else(Utc::now)
            }
        }
    }
}

impl From<DateTime<Utc>> for Eta {
    fn from(dt: DateTime<Utc>) -> Self {
        Eta::Timestamp(dt)
    }
}

impl From<f64> for Eta {
    fn from(secs: f64) -> Self {
        Eta::Epoch(secs)
    }
}

impl From<i64> for Eta {
    fn from(secs: i64) -> Self {
        Eta::Epoch(secs as f64)
    }
}
