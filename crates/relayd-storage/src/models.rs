//! Storage models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job status values
pub mod status {
    /// Waiting to be claimed
    pub const PENDING: &str = "pending";
    /// Claimed by a worker
    pub const RUNNING: &str = "running";
    /// Finished successfully
    pub const COMPLETED: &str = "completed";
    /// Retry budget exhausted; parked
    pub const FAILED: &str = "failed";
}

/// A queued pipeline job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
