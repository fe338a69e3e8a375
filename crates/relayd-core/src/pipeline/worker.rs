//! Queue worker: claims due jobs and executes pipeline stages
//!
//! Runs on its own tasks, decoupled from the SMTP accept loop, so a
//! slow exchange can never stall the listener. Concurrency is bounded
//! by a semaphore rather than the claim batch size.

use super::jobs::{
    CleanupPayload, DeliverPayload, DistributePayload, QUEUE_CLEANUP, QUEUE_DELIVER,
    QUEUE_DISTRIBUTE,
};
use super::Pipeline;
use relayd_common::config::QueueConfig;
use relayd_common::{Error, Result};
use relayd_storage::models::Job;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Polling executor for the durable job queue
pub struct QueueWorker {
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    retry_delay: chrono::Duration,
    workers: Arc<Semaphore>,
    batch_size: i64,
}

impl QueueWorker {
    pub fn new(pipeline: Arc<Pipeline>, config: &QueueConfig) -> Self {
        Self {
            pipeline,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            retry_delay: chrono::Duration::seconds(config.retry_delay_secs as i64),
            workers: Arc::new(Semaphore::new(config.workers)),
            batch_size: config.workers as i64,
        }
    }

    /// Reset jobs orphaned by a previous process, then poll forever
    pub async fn run(&self) {
        match self.pipeline.store().recover_running().await {
            Ok(0) => {}
            Ok(n) => info!(jobs = n, "Recovered orphaned jobs"),
            Err(e) => error!("Failed to recover orphaned jobs: {}", e),
        }

        let mut ticker = interval(self.poll_interval);
        info!("Queue worker started");

        loop {
            ticker.tick().await;

            if let Err(e) = self.drain_due().await {
                error!("Error processing queue: {}", e);
            }
        }
    }

    /// Claim and execute one batch of due jobs
    pub async fn drain_due(&self) -> Result<()> {
        let jobs = self.pipeline.store().claim_due(self.batch_size).await?;

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = self
                .workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Worker semaphore closed: {}", e)))?;
            let pipeline = self.pipeline.clone();
            let retry_delay = self.retry_delay;

            handles.push(tokio::spawn(async move {
                process_job(&pipeline, job, retry_delay).await;
                drop(permit);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job task panicked: {}", e);
            }
        }

        Ok(())
    }
}

/// Execute one claimed job through its stage and record the outcome.
/// Nothing here may propagate a failure out of the worker pool.
async fn process_job(pipeline: &Pipeline, job: Job, retry_delay: chrono::Duration) {
    debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "Processing job");

    match job.queue.as_str() {
        QUEUE_DISTRIBUTE => {
            let payload: DistributePayload = match parse_payload(pipeline, &job).await {
                Some(payload) => payload,
                None => return,
            };

            match pipeline.run_distribute(&payload).await {
                Ok(()) => complete(pipeline, &job).await,
                Err(e) => {
                    fail(pipeline, &job, &e, retry_delay).await;
                }
            }
        }

        QUEUE_DELIVER => {
            let payload: DeliverPayload = match parse_payload(pipeline, &job).await {
                Some(payload) => payload,
                None => return,
            };

            let (attachments, outcome) = pipeline.run_deliver(&payload).await;

            match outcome {
                Ok(()) => {
                    // Enqueued before complete(); a crash in between
                    // redelivers into an idempotent cleanup instead of
                    // stranding the spool copy
                    if let Err(e) = pipeline.enqueue_cleanup(&payload, attachments).await {
                        error!(job_id = %job.id, "Failed to enqueue cleanup: {}", e);
                    }
                    complete(pipeline, &job).await;
                    info!(
                        txn = "send",
                        address = %payload.recipient,
                        status = "okay",
                        message_id = %payload.message_id,
                        "Delivery succeeded"
                    );
                }
                Err(e) => {
                    let parked = fail(pipeline, &job, &e, retry_delay).await;

                    if parked {
                        // Terminal outcome: exactly one cleanup job
                        if let Err(e) = pipeline.enqueue_cleanup(&payload, attachments).await {
                            error!(job_id = %job.id, "Failed to enqueue cleanup: {}", e);
                        }
                        info!(
                            txn = "send",
                            address = %payload.recipient,
                            status = "failed",
                            message_id = %payload.message_id,
                            error = %e,
                            "Delivery failed; job parked"
                        );
                    } else {
                        // The retry re-materializes its own attachments;
                        // release this attempt's files now
                        for path in &attachments {
                            let _ = pipeline.spool().remove(path).await;
                        }
                    }
                }
            }
        }

        QUEUE_CLEANUP => {
            let payload: CleanupPayload = match parse_payload(pipeline, &job).await {
                Some(payload) => payload,
                None => return,
            };

            match pipeline.run_cleanup(&payload).await {
                Ok(()) => complete(pipeline, &job).await,
                Err(e) => {
                    fail(pipeline, &job, &e, retry_delay).await;
                }
            }
        }

        other => {
            error!(job_id = %job.id, queue = %other, "Unknown queue; parking job");
            let _ = pipeline.store().park(&job.id, "unknown queue").await;
        }
    }
}

/// Deserialize a job payload, parking the job when it is unreadable
async fn parse_payload<T: serde::de::DeserializeOwned>(pipeline: &Pipeline, job: &Job) -> Option<T> {
    match serde_json::from_str(&job.payload) {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!(job_id = %job.id, "Unreadable job payload: {}", e);
            let _ = pipeline
                .store()
                .park(&job.id, &format!("unreadable payload: {}", e))
                .await;
            None
        }
    }
}

async fn complete(pipeline: &Pipeline, job: &Job) {
    if let Err(e) = pipeline.store().complete(&job.id).await {
        error!(job_id = %job.id, "Failed to mark job completed: {}", e);
    }
}

/// Record a failed attempt. Non-retryable errors park immediately;
/// others consume the retry budget. Returns true when the job is now
/// terminal.
async fn fail(pipeline: &Pipeline, job: &Job, error: &Error, retry_delay: chrono::Duration) -> bool {
    warn!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "Job failed: {}", error);

    if !error.is_retryable() {
        if let Err(e) = pipeline.store().park(&job.id, &error.to_string()).await {
            tracing::error!(job_id = %job.id, "Failed to park job: {}", e);
        }
        return true;
    }

    match pipeline
        .store()
        .retry_or_park(job, &error.to_string(), retry_delay)
        .await
    {
        Ok(parked) => parked,
        Err(e) => {
            tracing::error!(job_id = %job.id, "Failed to record job failure: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{DisabledDkim, ExchangeBehavior, ScriptedTransportFactory};
    use crate::delivery::DeliveryAgent;
    use crate::dns::testing::StaticMxResolver;
    use pretty_assertions::assert_eq;
    use relayd_common::types::{EmailAddress, Envelope, Identity, MxRecord};
    use relayd_storage::models::status;
    use relayd_storage::{DatabasePool, JobStore, Spool};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn worker_with(
        resolver: StaticMxResolver,
        factory: Arc<ScriptedTransportFactory>,
        max_attempts: i32,
    ) -> (QueueWorker, Arc<Pipeline>, Spool) {
        let db = DatabasePool::in_memory().await.unwrap();
        let store = JobStore::new(db);
        let dir = std::env::temp_dir().join(format!("relayd-worker-test-{}", Uuid::new_v4()));
        let spool = Spool::from_path(&dir).unwrap();
        let agent = DeliveryAgent::new(
            Arc::new(resolver),
            Arc::new(DisabledDkim),
            factory,
            std::time::Duration::from_secs(5),
        );
        let pipeline = Arc::new(Pipeline::new(store, spool.clone(), agent, max_attempts));

        let config = QueueConfig {
            max_attempts,
            poll_interval_secs: 1,
            retry_delay_secs: 0,
            workers: 4,
        };
        (
            QueueWorker::new(pipeline.clone(), &config),
            pipeline,
            spool,
        )
    }

    async fn spool_message(spool: &Spool, raw: &[u8]) -> PathBuf {
        use tokio::io::AsyncWriteExt;
        let (path, mut file) = spool.create_message().await.unwrap();
        file.write_all(raw).await.unwrap();
        file.flush().await.unwrap();
        path
    }

    fn identity() -> Identity {
        Identity::new(EmailAddress::new("alice", "example.com"), "Alice")
    }

    /// Drive distribute, deliver and cleanup to completion for one
    /// submitted message
    #[tokio::test]
    async fn test_pipeline_runs_to_completion() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![(
            "mx1.other.org",
            ExchangeBehavior::Accept,
        )]));
        let (worker, pipeline, spool) = worker_with(
            StaticMxResolver::new(vec![(
                "other.org",
                vec![MxRecord::new("mx1.other.org", 10)],
            )]),
            factory.clone(),
            3,
        )
        .await;

        let path = spool_message(&spool, b"Subject: Hi\r\n\r\nHello Bob\r\n").await;
        let envelope = Envelope {
            mail_from: Some(identity().address),
            rcpt_to: vec![EmailAddress::new("bob", "other.org")],
        };
        pipeline.submit(&identity(), &envelope, &path).await.unwrap();

        // distribute, then deliver, then cleanup
        worker.drain_due().await.unwrap();
        worker.drain_due().await.unwrap();
        worker.drain_due().await.unwrap();

        assert_eq!(factory.deliveries.lock().unwrap().len(), 1);

        for queue in [QUEUE_DISTRIBUTE, QUEUE_DELIVER, QUEUE_CLEANUP] {
            let jobs = pipeline.store().list_queue(queue).await.unwrap();
            assert_eq!(jobs.len(), 1, "queue {}", queue);
            assert_eq!(jobs[0].status, status::COMPLETED, "queue {}", queue);
        }

        // Spool fully drained
        let mut entries = std::fs::read_dir(spool.base_path()).unwrap();
        assert!(entries.next().is_none());
    }

    /// The cleanup job must be on disk by the time the deliver job is
    /// marked completed, so an interrupted worker cannot leave a
    /// delivered message without its cleanup
    #[tokio::test]
    async fn test_successful_delivery_enqueues_cleanup_durably() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![(
            "mx1.other.org",
            ExchangeBehavior::Accept,
        )]));
        let (worker, pipeline, spool) = worker_with(
            StaticMxResolver::new(vec![(
                "other.org",
                vec![MxRecord::new("mx1.other.org", 10)],
            )]),
            factory.clone(),
            3,
        )
        .await;

        let path = spool_message(&spool, b"Subject: Hi\r\n\r\nHello\r\n").await;
        let envelope = Envelope {
            mail_from: Some(identity().address),
            rcpt_to: vec![EmailAddress::new("bob", "other.org")],
        };
        pipeline.submit(&identity(), &envelope, &path).await.unwrap();

        worker.drain_due().await.unwrap(); // distribute
        worker.drain_due().await.unwrap(); // deliver

        let deliver_jobs = pipeline.store().list_queue(QUEUE_DELIVER).await.unwrap();
        assert_eq!(deliver_jobs[0].status, status::COMPLETED);

        let cleanup_jobs = pipeline.store().list_queue(QUEUE_CLEANUP).await.unwrap();
        assert_eq!(cleanup_jobs.len(), 1);
        assert_eq!(cleanup_jobs[0].status, status::PENDING);
    }

    /// A deliver job that exhausts its budget is parked and still gets
    /// exactly one cleanup job
    #[tokio::test]
    async fn test_exhausted_deliver_job_parks_and_cleans_up() {
        let factory = Arc::new(ScriptedTransportFactory::new(vec![(
            "mx1.other.org",
            ExchangeBehavior::FailConnect,
        )]));
        let (worker, pipeline, spool) = worker_with(
            StaticMxResolver::new(vec![(
                "other.org",
                vec![MxRecord::new("mx1.other.org", 10)],
            )]),
            factory.clone(),
            2,
        )
        .await;

        let path = spool_message(&spool, b"Subject: Hi\r\n\r\nHello\r\n").await;
        let envelope = Envelope {
            mail_from: Some(identity().address),
            rcpt_to: vec![EmailAddress::new("bob", "other.org")],
        };
        pipeline.submit(&identity(), &envelope, &path).await.unwrap();

        worker.drain_due().await.unwrap(); // distribute
        worker.drain_due().await.unwrap(); // deliver attempt 1: rescheduled
        worker.drain_due().await.unwrap(); // deliver attempt 2: parked
        worker.drain_due().await.unwrap(); // cleanup

        let deliver_jobs = pipeline.store().list_queue(QUEUE_DELIVER).await.unwrap();
        assert_eq!(deliver_jobs.len(), 1);
        assert_eq!(deliver_jobs[0].status, status::FAILED);
        assert_eq!(deliver_jobs[0].attempts, 2);

        let cleanup_jobs = pipeline.store().list_queue(QUEUE_CLEANUP).await.unwrap();
        assert_eq!(cleanup_jobs.len(), 1);
        assert_eq!(cleanup_jobs[0].status, status::COMPLETED);

        // The parked job's copy was removed by cleanup
        let mut entries = std::fs::read_dir(spool.base_path()).unwrap();
        assert!(entries.next().is_none());
    }
}
