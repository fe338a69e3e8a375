//! Durable job queue operations
//!
//! Jobs are claimed with a single UPDATE .. RETURNING so a claim and its
//! attempt increment are atomic. Redelivery is driven entirely by row
//! state; a job left `running` by a crash is reset to `pending` at
//! startup, giving the pipeline at-least-once semantics.

use crate::db::DatabasePool;
use crate::models::{status, Job};
use chrono::{Duration, Utc};
use relayd_common::{Error, Result};
use uuid::Uuid;

/// Store for queued pipeline jobs
#[derive(Clone)]
pub struct JobStore {
    db: DatabasePool,
}

impl JobStore {
    /// Create a new job store
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    /// Enqueue a single job, due immediately
    pub async fn enqueue(&self, queue: &str, payload: &str, max_attempts: i32) -> Result<String> {
        let mut ids = self.enqueue_batch(queue, &[payload.to_string()], max_attempts).await?;
        Ok(ids.remove(0))
    }

    /// Enqueue a batch of jobs in one transaction.
    ///
    /// Either every job in the batch becomes durable or none does; the
    /// distribute stage relies on this before it releases the original
    /// spool file.
    pub async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: &[String],
        max_attempts: i32,
    ) -> Result<Vec<String>> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let now = Utc::now();
        let mut ids = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let id = Uuid::now_v7().to_string();

            sqlx::query(
                r#"
                INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, scheduled_at, created_at)
                VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)
                "#,
            )
            .bind(&id)
            .bind(queue)
            .bind(payload)
            .bind(status::PENDING)
            .bind(max_attempts)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to enqueue job: {}", e)))?;

            ids.push(id);
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit enqueue: {}", e)))?;

        Ok(ids)
    }

    /// Claim up to `limit` due jobs, marking them running and counting the
    /// attempt. Returns the claimed jobs.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();

        let jobs: Vec<Job> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = ?1, started_at = ?2, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = ?3 AND scheduled_at <= ?2
                ORDER BY scheduled_at ASC
                LIMIT ?4
            )
            RETURNING *
            "#,
        )
        .bind(status::RUNNING)
        .bind(now)
        .bind(status::PENDING)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to claim jobs: {}", e)))?;

        Ok(jobs)
    }

    /// Mark a job completed
    pub async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?1, completed_at = ?2 WHERE id = ?3")
            .bind(status::COMPLETED)
            .bind(Utc::now())
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to complete job: {}", e)))?;
        Ok(())
    }

    /// Record a failed attempt: reschedule when budget remains, otherwise
    /// park the job as failed. Returns true when the job was parked.
    pub async fn retry_or_park(
        &self,
        job: &Job,
        error: &str,
        retry_delay: Duration,
    ) -> Result<bool> {
        let parked = job.attempts >= job.max_attempts;

        if parked {
            sqlx::query(
                "UPDATE jobs SET status = ?1, last_error = ?2, completed_at = ?3 WHERE id = ?4",
            )
            .bind(status::FAILED)
            .bind(error)
            .bind(Utc::now())
            .bind(&job.id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to park job: {}", e)))?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = ?1, last_error = ?2, scheduled_at = ?3 WHERE id = ?4",
            )
            .bind(status::PENDING)
            .bind(error)
            .bind(Utc::now() + retry_delay * job.attempts)
            .bind(&job.id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to reschedule job: {}", e)))?;
        }

        Ok(parked)
    }

    /// Park a job immediately regardless of remaining attempts, for
    /// failures that cannot resolve with time
    pub async fn park(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?1, last_error = ?2, completed_at = ?3 WHERE id = ?4")
            .bind(status::FAILED)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to park job: {}", e)))?;
        Ok(())
    }

    /// Reset jobs left running by a previous process back to pending
    pub async fn recover_running(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = ?1 WHERE status = ?2")
            .bind(status::PENDING)
            .bind(status::RUNNING)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to recover jobs: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Fetch all jobs in a queue, newest last
    pub async fn list_queue(&self, queue: &str) -> Result<Vec<Job>> {
        let jobs: Vec<Job> =
            sqlx::query_as("SELECT * FROM jobs WHERE queue = ?1 ORDER BY created_at ASC")
                .bind(queue)
                .fetch_all(self.db.pool())
                .await
                .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn store() -> JobStore {
        JobStore::new(DatabasePool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let store = store().await;

        store.enqueue("deliver", r#"{"n":1}"#, 3).await.unwrap();
        store.enqueue("deliver", r#"{"n":2}"#, 3).await.unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].status, status::RUNNING);
        assert_eq!(claimed[0].attempts, 1);

        // Already claimed; nothing left
        assert!(store.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_enqueue_is_atomic() {
        let store = store().await;

        let payloads = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ids = store.enqueue_batch("deliver", &payloads, 3).await.unwrap();
        assert_eq!(ids.len(), 3);

        let jobs = store.list_queue("deliver").await.unwrap();
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_then_park() {
        let store = store().await;
        store.enqueue("deliver", "{}", 2).await.unwrap();

        // First attempt fails: rescheduled
        let job = store.claim_due(1).await.unwrap().remove(0);
        let parked = store
            .retry_or_park(&job, "mx down", Duration::zero())
            .await
            .unwrap();
        assert!(!parked);

        // Second attempt exhausts the budget: parked
        let job = store.claim_due(1).await.unwrap().remove(0);
        assert_eq!(job.attempts, 2);
        let parked = store
            .retry_or_park(&job, "mx down", Duration::zero())
            .await
            .unwrap();
        assert!(parked);

        let jobs = store.list_queue("deliver").await.unwrap();
        assert_eq!(jobs[0].status, status::FAILED);
        assert_eq!(jobs[0].last_error.as_deref(), Some("mx down"));
    }

    #[tokio::test]
    async fn test_recover_running() {
        let store = store().await;
        store.enqueue("deliver", "{}", 3).await.unwrap();
        store.claim_due(1).await.unwrap();

        let recovered = store.recover_running().await.unwrap();
        assert_eq!(recovered, 1);

        // Claimable again after recovery
        assert_eq!(store.claim_due(1).await.unwrap().len(), 1);
    }
}
