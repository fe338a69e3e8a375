//! SMTP submission front end

pub mod auth;
pub mod server;
pub mod session;
pub mod tls;

pub use auth::{AuthOutcome, AuthProvider, AuthReason, ConfigAuthProvider};
pub use server::SmtpServer;
pub use session::{Session, SessionOutcome};
