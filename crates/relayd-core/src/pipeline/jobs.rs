//! Job payloads for the three pipeline stages

use relayd_common::types::{EmailAddress, Envelope, Identity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Queue names, one per stage
pub const QUEUE_DISTRIBUTE: &str = "distribute";
pub const QUEUE_DELIVER: &str = "deliver";
pub const QUEUE_CLEANUP: &str = "cleanup";

/// Payload for the distribute stage: fan a spooled message out to one
/// deliver job per recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributePayload {
    pub message_id: String,
    pub identity: Identity,
    pub envelope: Envelope,
    pub mail_path: PathBuf,
}

/// Payload for the deliver stage: one recipient, one exclusively-owned
/// message copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverPayload {
    pub message_id: String,
    pub identity: Identity,
    pub recipient: EmailAddress,
    pub mail_path: PathBuf,
}

/// Payload for the cleanup stage: artifacts owned by a finished deliver
/// job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub message_id: String,
    pub mail_path: PathBuf,
    pub attachments: Vec<PathBuf>,
}
