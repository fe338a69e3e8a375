//! Message ingestion: MIME parsing, header sanitization, and
//! attachment materialization into the spool

use mail_parser::{MessageParser, MimeHeaders, PartType};
use relayd_common::{Error, Result};
use relayd_storage::Spool;
use std::path::PathBuf;
use tracing::debug;

/// Headers dropped before forwarding. They either trace hops, expose
/// backend infrastructure, or are regenerated at assembly time.
const DENIED_HEADERS: &[&str] = &[
    // exposes backend infrastructure
    "x-sender-id",
    "x-php-script",
    "x-authentication-warning",
    "x-mailer",
    "received",
    // set elsewhere
    "content-type",
    "to",
    "from",
];

/// A header that survived filtering and is forwarded verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHeader {
    pub name: String,
    pub value: String,
}

/// An attachment materialized into its own spool file
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AttachmentRef {
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub content_type: String,
    pub path: PathBuf,
}

/// A message after ingestion, ready for assembly
#[derive(Debug, Clone, Default)]
pub struct IngestedMessage {
    pub subject: Option<String>,
    pub headers: Vec<ForwardHeader>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

/// Parses raw messages and materializes attachments into the spool
pub struct MessageIngestor {
    spool: Spool,
}

impl MessageIngestor {
    pub fn new(spool: Spool) -> Self {
        Self { spool }
    }

    /// Ingest a raw message.
    ///
    /// Returns only after every attachment has been fully written and
    /// flushed to its own spool file; the returned message is complete.
    pub async fn ingest(&self, raw: &[u8]) -> Result<IngestedMessage> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Smtp("Failed to parse message".to_string()))?;

        let mut message = IngestedMessage {
            subject: parsed.subject().map(|s| s.to_string()),
            ..Default::default()
        };

        for header in parsed.headers() {
            let name = header.name.as_str();
            let lower = name.to_lowercase();

            if lower == "subject" || DENIED_HEADERS.contains(&lower.as_str()) {
                continue;
            }

            let raw_value = &parsed.raw_message[header.offset_start..header.offset_end];
            message.headers.push(ForwardHeader {
                name: name.to_string(),
                value: String::from_utf8_lossy(raw_value).trim().to_string(),
            });
        }

        if !parsed.text_body.is_empty() {
            message.text = parsed.body_text(0).map(|s| s.to_string());
        }
        // mail-parser lists text-only parts under html_body too and
        // synthesizes an HTML rendition on demand; only a genuine
        // text/html part is forwarded
        let has_html_part = parsed
            .html_body
            .iter()
            .filter_map(|id| parsed.part(*id))
            .any(|part| matches!(part.body, PartType::Html(_)));
        if has_html_part {
            message.html = parsed.body_html(0).map(|s| s.to_string());
        }

        for part in parsed.attachments() {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            let path = self.spool.write_attachment(part.contents()).await?;

            message.attachments.push(AttachmentRef {
                filename: part.attachment_name().map(|s| s.to_string()),
                content_id: part.content_id().map(|s| s.to_string()),
                content_type,
                path,
            });
        }

        debug!(
            headers = message.headers.len(),
            attachments = message.attachments.len(),
            "Ingested message"
        );

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn ingestor() -> MessageIngestor {
        let dir = std::env::temp_dir().join(format!("relayd-ingest-test-{}", Uuid::new_v4()));
        MessageIngestor::new(Spool::from_path(&dir).unwrap())
    }

    #[tokio::test]
    async fn test_header_filtering_and_subject_extraction() {
        let raw = b"Received: from somewhere\r\n\
X-Mailer: oldclient 1.0\r\n\
Subject: Hi\r\n\
To: bob@other.org\r\n\
From: alice@example.com\r\n\
X-Custom: kept\r\n\
\r\n\
Body text\r\n";

        let message = ingestor().ingest(raw).await.unwrap();

        assert_eq!(message.subject.as_deref(), Some("Hi"));
        assert_eq!(message.headers.len(), 1);
        assert_eq!(message.headers[0].name, "X-Custom");
        assert_eq!(message.headers[0].value, "kept");
        assert!(message.text.unwrap().contains("Body text"));
    }

    #[tokio::test]
    async fn test_attachment_materialization() {
        let raw = b"Subject: With attachment\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello\r\n\
--sep\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"data.bin\"\r\n\
\r\n\
FILEDATA\r\n\
--sep--\r\n";

        let ingestor = ingestor();
        let message = ingestor.ingest(raw).await.unwrap();

        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("data.bin"));
        assert_eq!(attachment.content_type, "application/octet-stream");

        let spooled = tokio::fs::read(&attachment.path).await.unwrap();
        assert_eq!(spooled, b"FILEDATA");
    }

    #[tokio::test]
    async fn test_text_only_message_gets_no_html_body() {
        let raw = b"Subject: Plain\r\n\
\r\n\
Just text\r\n";

        let message = ingestor().ingest(raw).await.unwrap();

        assert!(message.text.unwrap().contains("Just text"));
        assert_eq!(message.html, None);
    }

    #[tokio::test]
    async fn test_html_part_is_forwarded() {
        let raw = b"Subject: Both\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain\r\n\
\r\n\
Plain part\r\n\
--sep\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Rich part</p>\r\n\
--sep--\r\n";

        let message = ingestor().ingest(raw).await.unwrap();

        assert!(message.text.unwrap().contains("Plain part"));
        assert!(message.html.unwrap().contains("<p>Rich part</p>"));
    }

    #[tokio::test]
    async fn test_unparseable_message_is_rejected() {
        assert!(ingestor().ingest(b"").await.is_err());
    }
}
