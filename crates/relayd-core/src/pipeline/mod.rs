//! Durable three-stage delivery pipeline: distribute, deliver, cleanup
//!
//! Stages are rows in the job table, so pipeline state survives a
//! process restart with at-least-once semantics. Every stage is written
//! to tolerate re-execution.

mod compose;
mod jobs;
mod worker;

pub use jobs::{CleanupPayload, DeliverPayload, DistributePayload};
pub use jobs::{QUEUE_CLEANUP, QUEUE_DELIVER, QUEUE_DISTRIBUTE};
pub use worker::QueueWorker;

use crate::delivery::DeliveryAgent;
use crate::ingest::MessageIngestor;
use relayd_common::types::{Envelope, Identity};
use relayd_common::Result;
use relayd_storage::{JobStore, Spool};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// The delivery pipeline stages and their submission entry point
pub struct Pipeline {
    store: JobStore,
    spool: Spool,
    ingestor: MessageIngestor,
    agent: DeliveryAgent,
    max_attempts: i32,
}

impl Pipeline {
    pub fn new(store: JobStore, spool: Spool, agent: DeliveryAgent, max_attempts: i32) -> Self {
        let ingestor = MessageIngestor::new(spool.clone());
        Self {
            store,
            spool,
            ingestor,
            agent,
            max_attempts,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Accept a spooled message for delivery.
    ///
    /// Enqueues the distribute job and returns its message id. Once this
    /// returns, the submitting session is done: delivery proceeds
    /// asynchronously and its outcome is never reported back.
    pub async fn submit(
        &self,
        identity: &Identity,
        envelope: &Envelope,
        mail_path: &Path,
    ) -> Result<String> {
        let message_id = Uuid::now_v7().to_string();

        let payload = DistributePayload {
            message_id: message_id.clone(),
            identity: identity.clone(),
            envelope: envelope.clone(),
            mail_path: mail_path.to_path_buf(),
        };

        self.store
            .enqueue(
                QUEUE_DISTRIBUTE,
                &serde_json::to_string(&payload)?,
                self.max_attempts,
            )
            .await?;

        info!(
            message_id = %message_id,
            sender = %identity.address,
            recipients = envelope.rcpt_to.len(),
            "Message accepted for delivery"
        );

        Ok(message_id)
    }

    /// Distribute stage: one deliver job per parseable recipient, each
    /// with its own copy of the message file.
    ///
    /// All deliver jobs are committed in a single transaction before the
    /// original file is unlinked, so a crash in between re-runs
    /// distribute without losing a recipient.
    pub(crate) async fn run_distribute(&self, payload: &DistributePayload) -> Result<()> {
        let mut deliver_payloads = Vec::new();
        let mut copies = Vec::new();

        for recipient in &payload.envelope.rcpt_to {
            let copy = self.spool.duplicate(&payload.mail_path).await?;
            copies.push(copy.clone());

            deliver_payloads.push(serde_json::to_string(&DeliverPayload {
                message_id: payload.message_id.clone(),
                identity: payload.identity.clone(),
                recipient: recipient.clone(),
                mail_path: copy,
            })?);
        }

        if let Err(e) = self
            .store
            .enqueue_batch(QUEUE_DELIVER, &deliver_payloads, self.max_attempts)
            .await
        {
            // None of the deliver jobs became durable; release the
            // copies so the retry starts clean
            for copy in &copies {
                let _ = self.spool.remove(copy).await;
            }
            return Err(e);
        }

        // Ownership has transferred to the copies
        self.spool.remove(&payload.mail_path).await?;

        debug!(
            message_id = %payload.message_id,
            jobs = copies.len(),
            "Distributed message"
        );

        Ok(())
    }

    /// Deliver stage: rebuild the message from this job's copy and run
    /// the failover delivery algorithm.
    ///
    /// Returns the attachment files materialized by this attempt along
    /// with the outcome, so the caller can route them to cleanup on a
    /// terminal outcome or release them before a retry.
    pub(crate) async fn run_deliver(
        &self,
        payload: &DeliverPayload,
    ) -> (Vec<PathBuf>, Result<()>) {
        let raw = match self.spool.read(&payload.mail_path).await {
            Ok(raw) => raw,
            Err(e) => return (Vec::new(), Err(e)),
        };

        let message = match self.ingestor.ingest(&raw).await {
            Ok(message) => message,
            Err(e) => return (Vec::new(), Err(e)),
        };
        let attachments: Vec<PathBuf> =
            message.attachments.iter().map(|a| a.path.clone()).collect();

        let outbound =
            match compose::assemble(&payload.identity, &payload.recipient, &message).await {
                Ok(outbound) => outbound,
                Err(e) => return (attachments, Err(e)),
            };

        let outcome = self
            .agent
            .deliver(&payload.identity, &payload.recipient, &outbound)
            .await;

        (attachments, outcome)
    }

    /// Cleanup stage: remove the message copy and this job's attachment
    /// files. Safe to run more than once.
    pub(crate) async fn run_cleanup(&self, payload: &CleanupPayload) -> Result<()> {
        self.spool.remove(&payload.mail_path).await?;

        for attachment in &payload.attachments {
            self.spool.remove(attachment).await?;
        }

        debug!(message_id = %payload.message_id, "Cleaned up delivery artifacts");
        Ok(())
    }

    /// Enqueue the cleanup job for a deliver job that reached a terminal
    /// outcome
    pub(crate) async fn enqueue_cleanup(
        &self,
        payload: &DeliverPayload,
        attachments: Vec<PathBuf>,
    ) -> Result<()> {
        let cleanup = CleanupPayload {
            message_id: payload.message_id.clone(),
            mail_path: payload.mail_path.clone(),
            attachments,
        };

        self.store
            .enqueue(
                QUEUE_CLEANUP,
                &serde_json::to_string(&cleanup)?,
                self.max_attempts,
            )
            .await?;
        Ok(())
    }

    pub(crate) fn spool(&self) -> &Spool {
        &self.spool
    }
}
