//! relayd core: SMTP session handling, message ingestion, and the
//! durable delivery pipeline with MX failover.

pub mod delivery;
pub mod dkim;
pub mod dns;
pub mod ingest;
pub mod pipeline;
pub mod smtp;

pub use delivery::{DeliveryAgent, LettreTransportFactory, MailTransport, TransportFactory};
pub use dkim::{ConfigDkimProvider, DkimKey, DkimProvider, DkimSigner, DkimStatus};
pub use dns::{MxResolver, SystemMxResolver};
pub use ingest::{IngestedMessage, MessageIngestor};
pub use pipeline::Pipeline;
pub use smtp::{AuthOutcome, AuthProvider, AuthReason, ConfigAuthProvider, SmtpServer};
