//! Assembly of the outbound MIME message from an ingested copy

use crate::ingest::IngestedMessage;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use relayd_common::types::{EmailAddress, Identity};
use relayd_common::{Error, Result};

const RELAY_BANNER: &str = "relayd";

/// Build the raw outbound message for one recipient.
///
/// From, To and Content-Type are always regenerated here; the filtered
/// headers from ingestion are carried over verbatim.
pub async fn assemble(
    identity: &Identity,
    recipient: &EmailAddress,
    message: &IngestedMessage,
) -> Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .header("From", Raw::new(identity.formatted()))
        .to(recipient.to_string())
        .header("X-Powered-By", Raw::new(RELAY_BANNER));

    if let Some(subject) = &message.subject {
        builder = builder.subject(subject.as_str());
    }

    for header in &message.headers {
        builder = builder.header(header.name.as_str(), Raw::new(header.value.as_str()));
    }

    if let Some(text) = &message.text {
        builder = builder.text_body(text.as_str());
    }
    if let Some(html) = &message.html {
        builder = builder.html_body(html.as_str());
    }

    for attachment in &message.attachments {
        let contents = tokio::fs::read(&attachment.path)
            .await
            .map_err(|e| Error::Spool(format!("Failed to read attachment: {}", e)))?;

        let filename = attachment
            .filename
            .clone()
            .unwrap_or_else(|| "attachment".to_string());

        builder = match &attachment.content_id {
            Some(cid) => builder.inline(attachment.content_type.clone(), cid.clone(), contents),
            None => builder.attachment(attachment.content_type.clone(), filename, contents),
        };
    }

    builder
        .write_to_vec()
        .map_err(|e| Error::Smtp(format!("Failed to assemble message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ForwardHeader;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_assembled_message_regenerates_addressing() {
        let identity = Identity::new(EmailAddress::new("alice", "example.com"), "Alice");
        let recipient = EmailAddress::new("bob", "other.org");
        let message = IngestedMessage {
            subject: Some("Hi".to_string()),
            headers: vec![ForwardHeader {
                name: "X-Custom".to_string(),
                value: "kept".to_string(),
            }],
            text: Some("Hello Bob".to_string()),
            ..Default::default()
        };

        let raw = assemble(&identity, &recipient, &message).await.unwrap();

        let parsed = mail_parser::MessageParser::default().parse(&raw).unwrap();
        assert_eq!(parsed.subject(), Some("Hi"));
        assert_eq!(
            parsed.from().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("alice@example.com")
        );
        assert_eq!(
            parsed.header_raw("From").map(str::trim),
            Some("Alice <alice@example.com>")
        );
        assert_eq!(
            parsed.to().and_then(|a| a.first()).and_then(|a| a.address()),
            Some("bob@other.org")
        );
        assert_eq!(
            parsed.header_raw("X-Custom").map(str::trim),
            Some("kept")
        );
        assert_eq!(
            parsed.header_raw("X-Powered-By").map(str::trim),
            Some(RELAY_BANNER)
        );
        assert!(parsed.body_text(0).unwrap().contains("Hello Bob"));
    }
}
