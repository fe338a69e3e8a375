//! Filesystem spool for in-flight messages and attachments
//!
//! Every artifact lives under one scratch directory and is owned by
//! exactly one job: the session owns the original message file until
//! distribute hands per-recipient copies to their deliver jobs, and the
//! cleanup stage removes whatever its deliver job owned. Removal is
//! idempotent because queue redelivery can re-run any stage.

use relayd_common::config::SpoolConfig;
use relayd_common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Spool rooted at a scratch directory
#[derive(Clone)]
pub struct Spool {
    base_path: PathBuf,
}

impl Spool {
    /// Create a spool from config, ensuring the directory exists
    pub fn new(config: &SpoolConfig) -> Result<Self> {
        Self::from_path(&config.path)
    }

    /// Create a spool rooted at the given directory
    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Spool(format!("Failed to create spool directory: {}", e)))?;

        info!(path = %path.display(), "Initialized spool");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Spool directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Open a fresh message file for streaming writes
    pub async fn create_message(&self) -> Result<(PathBuf, fs::File)> {
        let path = self
            .base_path
            .join(format!("message-{}.eml", Uuid::now_v7()));

        let file = fs::File::create(&path)
            .await
            .map_err(|e| Error::Spool(format!("Failed to create message file: {}", e)))?;

        Ok((path, file))
    }

    /// Write an attachment body to its own spool file, flushed to disk
    /// before the path is returned
    pub async fn write_attachment(&self, data: &[u8]) -> Result<PathBuf> {
        let path = self
            .base_path
            .join(format!("attachment-{}.bin", Uuid::now_v7()));

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| Error::Spool(format!("Failed to create attachment file: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Spool(format!("Failed to write attachment: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Spool(format!("Failed to flush attachment: {}", e)))?;

        Ok(path)
    }

    /// Duplicate a message file into a new exclusively-owned copy
    pub async fn duplicate(&self, src: &Path) -> Result<PathBuf> {
        let dest = self
            .base_path
            .join(format!("message-{}.eml", Uuid::now_v7()));

        fs::copy(src, &dest)
            .await
            .map_err(|e| Error::Spool(format!("Failed to copy message file: {}", e)))?;

        debug!(src = %src.display(), dest = %dest.display(), "Duplicated spool file");
        Ok(dest)
    }

    /// Read a spooled file in full
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .map_err(|e| Error::Spool(format!("Failed to read {}: {}", path.display(), e)))
    }

    /// Remove a spooled file. Already-removed files are not an error.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Spool(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
