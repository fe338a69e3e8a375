//! Error types for relayd

use thiserror::Error;

/// Main error type for relayd
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid address: {0}")]
    AddressParse(String),

    #[error("No MX records found for {0}")]
    NoMxRecords(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Domain {0} has no authorization entry")]
    DkimDomainNotConfigured(String),

    #[error("DKIM error: {0}")]
    Dkim(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for relayd
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("Serialization error: {}", e))
    }
}

impl Error {
    /// Whether a failed delivery job should be redelivered by the queue.
    ///
    /// Missing MX records, unparseable addresses and unconfigured DKIM
    /// domains will not resolve themselves between attempts, so jobs
    /// failing with those are parked immediately. Transport and DNS
    /// lookup failures may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NoMxRecords(_) => false,
            Error::AddressParse(_) => false,
            Error::DkimDomainNotConfigured(_) => false,
            Error::Config(_) => false,
            Error::Transport(_) => true,
            Error::Dns(_) => true,
            Error::Delivery(_) => true,
            _ => true,
        }
    }
}
