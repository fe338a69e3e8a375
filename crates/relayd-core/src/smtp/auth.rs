//! Credential validation for mail submission
//!
//! The protocol layer must never branch its client-visible response on
//! the failure reason; the reason exists only for the structured auth
//! log event, so a probing client cannot enumerate accounts.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relayd_common::config::Config;
use relayd_common::types::{EmailAddress, Identity};
use relayd_common::Result;
use std::sync::Arc;

/// Why a validation attempt succeeded or failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
    Ok,
    BadPassword,
    BadAddress,
}

impl AuthReason {
    /// Status value for the auth log event
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthReason::Ok => "okay",
            AuthReason::BadPassword => "bad-password",
            AuthReason::BadAddress => "bad-address",
        }
    }
}

/// Outcome of a credential validation
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub reason: AuthReason,
    pub identity: Option<Identity>,
}

impl AuthOutcome {
    pub fn ok(identity: Identity) -> Self {
        Self {
            reason: AuthReason::Ok,
            identity: Some(identity),
        }
    }

    pub fn rejected(reason: AuthReason) -> Self {
        Self {
            reason,
            identity: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.identity.is_some()
    }
}

/// Pluggable credential validator
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate a username/password pair. The username is the full
    /// submission address.
    async fn validate(&self, username: &str, password: &str) -> Result<AuthOutcome>;
}

/// AuthProvider backed by the per-domain user lists in the configuration
pub struct ConfigAuthProvider {
    config: Arc<Config>,
}

impl ConfigAuthProvider {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AuthProvider for ConfigAuthProvider {
    async fn validate(&self, username: &str, password: &str) -> Result<AuthOutcome> {
        let address = match EmailAddress::parse(username) {
            Some(address) => address,
            None => return Ok(AuthOutcome::rejected(AuthReason::BadAddress)),
        };

        // An account for a domain this relay does not serve
        let domain = match self.config.domain(&address.domain) {
            Some(domain) => domain,
            None => return Ok(AuthOutcome::rejected(AuthReason::BadAddress)),
        };

        for user in &domain.users {
            let known = match EmailAddress::parse(&user.email) {
                Some(known) => known,
                None => continue,
            };

            if known == address {
                if user.password == password {
                    return Ok(AuthOutcome::ok(Identity::new(address, user.name.clone())));
                }
                return Ok(AuthOutcome::rejected(AuthReason::BadPassword));
            }
        }

        Ok(AuthOutcome::rejected(AuthReason::BadAddress))
    }
}

/// Base64 "Username:" challenge for AUTH LOGIN
pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

/// Base64 "Password:" challenge for AUTH LOGIN
pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}

/// Decode one base64 AUTH LOGIN response line
pub fn decode_login_response(line: &str) -> Option<String> {
    let decoded = BASE64.decode(line.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider() -> ConfigAuthProvider {
        let toml = r#"
[[domains]]
domain = "example.com"

[[domains.users]]
email = "alice@example.com"
name = "Alice"
password = "hunter2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        ConfigAuthProvider::new(Arc::new(config))
    }

    #[test]
    fn test_login_challenges() {
        assert_eq!(login_challenge_username(), "VXNlcm5hbWU6");
        assert_eq!(login_challenge_password(), "UGFzc3dvcmQ6");
    }

    #[tokio::test]
    async fn test_valid_credentials_bind_identity() {
        let outcome = provider().validate("alice@example.com", "hunter2").await.unwrap();
        assert!(outcome.is_valid());
        assert_eq!(outcome.reason, AuthReason::Ok);

        let identity = outcome.identity.unwrap();
        assert_eq!(identity.formatted(), "Alice <alice@example.com>");
    }

    #[tokio::test]
    async fn test_failure_reasons_are_distinguished_internally() {
        let provider = provider();

        let wrong_password = provider.validate("alice@example.com", "nope").await.unwrap();
        assert!(!wrong_password.is_valid());
        assert_eq!(wrong_password.reason, AuthReason::BadPassword);

        let unknown_user = provider.validate("mallory@example.com", "x").await.unwrap();
        assert_eq!(unknown_user.reason, AuthReason::BadAddress);

        let unknown_domain = provider.validate("alice@elsewhere.org", "x").await.unwrap();
        assert_eq!(unknown_domain.reason, AuthReason::BadAddress);

        let not_an_address = provider.validate("alice", "x").await.unwrap();
        assert_eq!(not_an_address.reason, AuthReason::BadAddress);
    }

    #[test]
    fn test_decode_login_response() {
        let encoded = BASE64.encode(b"alice@example.com");
        assert_eq!(
            decode_login_response(&encoded).as_deref(),
            Some("alice@example.com")
        );
        assert!(decode_login_response("!!!").is_none());
    }
}
