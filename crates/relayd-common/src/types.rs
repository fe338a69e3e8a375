//! Common types for relayd

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for in-flight messages
pub type MessageId = Uuid;

/// Unique identifier for queued jobs
pub type JobId = Uuid;

/// Email address split into localpart and domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub localpart: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(localpart: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            localpart: localpart.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string.
    ///
    /// Requires exactly one `@` with a non-empty localpart and domain.
    /// The domain is lowercased; the localpart is preserved as given.
    pub fn parse(s: &str) -> Option<Self> {
        let first = s.find('@')?;
        let last = s.rfind('@')?;
        if first != last {
            return None;
        }

        let (localpart, domain) = (&s[..first], &s[first + 1..]);
        if localpart.is_empty() || domain.is_empty() {
            return None;
        }

        Some(Self::new(localpart, domain.to_lowercase()))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.localpart, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::AddressParse(s.to_string()))
    }
}

/// Identity bound to a session after successful authentication.
///
/// Immutable once bound; the MAIL FROM address must match `address`
/// exactly for the transaction to proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: EmailAddress,
    pub name: String,
}

impl Identity {
    pub fn new(address: EmailAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }

    /// Formatted sender suitable for the outbound From header
    pub fn formatted(&self) -> String {
        format!("{} <{}>", self.name, self.address)
    }
}

/// Message envelope (SMTP level), distinct from message headers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (MAIL FROM)
    pub mail_from: Option<EmailAddress>,

    /// Recipients (RCPT TO)
    pub rcpt_to: Vec<EmailAddress>,
}

impl Envelope {
    pub fn clear(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

/// A single mail-exchange record; lower priority means higher precedence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

impl MxRecord {
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
        }
    }
}

/// Sort MX records into delivery order (ascending priority)
pub fn sort_mx_records(records: &mut [MxRecord]) {
    records.sort_by_key(|r| r.priority);
}
