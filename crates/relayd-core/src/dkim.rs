//! Per-domain DKIM key lookup and RFC 6376 signing
//!
//! Signing uses relaxed/relaxed canonicalization with rsa-sha256. A
//! domain with DKIM switched off is a normal outcome (mail goes out
//! unsigned); a domain with no authorization entry at all is an error.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use relayd_common::config::Config;
use relayd_common::{Error, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Signing material for one domain
#[derive(Debug, Clone)]
pub struct DkimKey {
    pub selector: String,
    pub private_key_pem: String,
}

/// Outcome of a signing-key lookup for a configured domain
#[derive(Debug, Clone)]
pub enum DkimStatus {
    /// Domain is known but DKIM is switched off; send unsigned
    Disabled,
    /// Domain signs outbound mail with this key
    Enabled(DkimKey),
}

/// Per-domain signing-key lookup
#[async_trait]
pub trait DkimProvider: Send + Sync {
    /// Look up the signing key for a sender domain.
    ///
    /// Fails with [`Error::DkimDomainNotConfigured`] when the domain has
    /// no authorization entry, which is distinct from DKIM being
    /// disabled for a known domain.
    async fn signing_key(&self, domain: &str) -> Result<DkimStatus>;
}

/// DkimProvider reading selectors and key files from the configuration
pub struct ConfigDkimProvider {
    config: Arc<Config>,
}

impl ConfigDkimProvider {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DkimProvider for ConfigDkimProvider {
    async fn signing_key(&self, domain: &str) -> Result<DkimStatus> {
        let entry = self
            .config
            .domain(domain)
            .ok_or_else(|| Error::DkimDomainNotConfigured(domain.to_string()))?;

        if !entry.dkim.enabled {
            return Ok(DkimStatus::Disabled);
        }

        // validate() guarantees these are set when dkim is enabled
        let selector = entry
            .dkim
            .selector
            .clone()
            .ok_or_else(|| Error::Dkim(format!("{}: missing selector", domain)))?;
        let key_path = entry
            .dkim
            .key_path
            .clone()
            .ok_or_else(|| Error::Dkim(format!("{}: missing key path", domain)))?;

        let private_key_pem = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| Error::Dkim(format!("Failed to read key {}: {}", key_path.display(), e)))?;

        debug!(domain = %domain, selector = %selector, "Loaded DKIM signing key");

        Ok(DkimStatus::Enabled(DkimKey {
            selector,
            private_key_pem,
        }))
    }
}

/// Headers covered by the signature when present in the message
const SIGNED_HEADERS: &[&str] = &[
    "from",
    "to",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
];

/// DKIM signer for outbound mail
pub struct DkimSigner {
    domain: String,
    selector: String,
    signing_key: SigningKey<Sha256>,
}

impl DkimSigner {
    /// Create a signer from a domain's key material
    pub fn new(domain: impl Into<String>, key: &DkimKey) -> Result<Self> {
        let private_key = parse_rsa_private_key(&key.private_key_pem)?;

        Ok(Self {
            domain: domain.into(),
            selector: key.selector.clone(),
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Sign a raw message, returning it with the DKIM-Signature header
    /// prepended
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let header_value = self.sign(message)?;

        let mut signed = Vec::with_capacity(message.len() + header_value.len() + 32);
        signed.extend_from_slice(b"DKIM-Signature: ");
        signed.extend_from_slice(header_value.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(message);
        Ok(signed)
    }

    /// Produce the DKIM-Signature header value for a raw message
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let (headers, body) = split_message(message)?;

        let canon_body = canonicalize_body_relaxed(&body);
        let body_hash = BASE64.encode(Sha256::digest(&canon_body));

        let signed_headers: Vec<&str> = SIGNED_HEADERS
            .iter()
            .copied()
            .filter(|h| headers.contains_key(*h))
            .collect();

        let timestamp = chrono::Utc::now().timestamp();
        let mut dkim_header = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
            self.domain,
            self.selector,
            timestamp,
            signed_headers.join(":"),
            body_hash
        );

        let canon_headers = canonicalize_headers_relaxed(&headers, &signed_headers, &dkim_header);

        let signature = self.signing_key.sign(canon_headers.as_bytes());
        dkim_header.push_str(&BASE64.encode(signature.to_bytes().as_ref()));

        Ok(dkim_header)
    }
}

fn parse_rsa_private_key(pem: &str) -> Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::Dkim(format!("Failed to parse RSA private key: {}", e)))
}

/// Split a raw message into a lowercased header map and the body
fn split_message(message: &[u8]) -> Result<(HashMap<String, String>, String)> {
    let message_str = String::from_utf8_lossy(message);

    let (header_section, body) = if let Some((h, b)) = message_str.split_once("\r\n\r\n") {
        (h, b)
    } else if let Some((h, b)) = message_str.split_once("\n\n") {
        (h, b)
    } else {
        return Err(Error::Dkim(
            "Could not find header/body separator".to_string(),
        ));
    };

    let mut headers = HashMap::new();
    let mut current_name = String::new();
    let mut current_value = String::new();

    for line in header_section.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header
            current_value.push(' ');
            current_value.push_str(line.trim());
        } else if let Some(colon_pos) = line.find(':') {
            if !current_name.is_empty() {
                headers.insert(current_name.to_lowercase(), current_value.clone());
            }
            current_name = line[..colon_pos].to_string();
            current_value = line[colon_pos + 1..].trim().to_string();
        }
    }

    if !current_name.is_empty() {
        headers.insert(current_name.to_lowercase(), current_value);
    }

    Ok((headers, body.to_string()))
}

/// Relaxed body canonicalization: collapse whitespace runs, strip
/// trailing whitespace, drop trailing empty lines, CRLF endings
fn canonicalize_body_relaxed(body: &str) -> Vec<u8> {
    let mut lines: Vec<String> = body
        .lines()
        .map(|line| {
            let mut result = String::new();
            let mut last_was_space = false;
            for c in line.chars() {
                if c.is_whitespace() {
                    if !last_was_space {
                        result.push(' ');
                        last_was_space = true;
                    }
                } else {
                    result.push(c);
                    last_was_space = false;
                }
            }
            result.trim_end().to_string()
        })
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let mut result = lines.join("\r\n");
    if !result.is_empty() {
        result.push_str("\r\n");
    }
    result.into_bytes()
}

/// Relaxed header canonicalization over the signed header set, ending
/// with the unsigned DKIM-Signature header itself
fn canonicalize_headers_relaxed(
    headers: &HashMap<String, String>,
    signed_headers: &[&str],
    dkim_header: &str,
) -> String {
    let mut result = String::new();

    for name in signed_headers {
        if let Some(value) = headers.get(*name) {
            result.push_str(name);
            result.push(':');
            let value: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
            result.push_str(&value);
            result.push_str("\r\n");
        }
    }

    result.push_str("dkim-signature:");
    let value: String = dkim_header.split_whitespace().collect::<Vec<_>>().join(" ");
    result.push_str(&value);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_message() {
        let message =
            b"From: alice@example.com\r\nSubject: Test\r\n\tfolded\r\n\r\nThis is the body.";
        let (headers, body) = split_message(message).unwrap();

        assert_eq!(headers.get("from"), Some(&"alice@example.com".to_string()));
        assert_eq!(headers.get("subject"), Some(&"Test folded".to_string()));
        assert_eq!(body, "This is the body.");
    }

    #[test]
    fn test_relaxed_body_canonicalization() {
        let canon = canonicalize_body_relaxed("hello   world \nsecond\t line\n\n\n");
        assert_eq!(canon, b"hello world\r\nsecond line\r\n");

        assert_eq!(canonicalize_body_relaxed(""), b"");
    }

    #[test]
    fn test_canonicalized_headers_order_follows_signed_list() {
        let mut headers = HashMap::new();
        headers.insert("from".to_string(), "alice@example.com".to_string());
        headers.insert("subject".to_string(), "Hi  there".to_string());

        let canon = canonicalize_headers_relaxed(&headers, &["from", "subject"], "v=1; b=");
        assert_eq!(
            canon,
            "from:alice@example.com\r\nsubject:Hi there\r\ndkim-signature:v=1; b="
        );
    }

    #[tokio::test]
    async fn test_provider_distinguishes_disabled_and_unconfigured() {
        let toml = r#"
[[domains]]
domain = "example.com"

[domains.dkim]
enabled = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let provider = ConfigDkimProvider::new(Arc::new(config));

        match provider.signing_key("example.com").await.unwrap() {
            DkimStatus::Disabled => {}
            other => panic!("expected Disabled, got {:?}", other),
        }

        match provider.signing_key("stranger.org").await {
            Err(Error::DkimDomainNotConfigured(domain)) => assert_eq!(domain, "stranger.org"),
            other => panic!("expected DkimDomainNotConfigured, got {:?}", other.map(|_| ())),
        }
    }
}
