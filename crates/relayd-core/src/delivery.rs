//! Outbound delivery with rank-ordered MX failover

use crate::dkim::{DkimProvider, DkimSigner, DkimStatus};
use crate::dns::MxResolver;
use async_trait::async_trait;
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use relayd_common::types::{EmailAddress, Identity};
use relayd_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a send attempt against one exchange
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Recipient addresses the remote explicitly accepted
    pub accepted: Vec<String>,
}

/// A connection to a single mail exchange
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Verify the exchange is usable before attempting a send
    async fn verify(&self) -> Result<()>;

    /// Send a raw message with a single-recipient envelope
    async fn send(
        &self,
        from: &EmailAddress,
        recipient: &EmailAddress,
        raw: &[u8],
    ) -> Result<SendOutcome>;
}

/// Opens transports to candidate exchanges
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, exchange: &str) -> Result<Box<dyn MailTransport>>;
}

/// TransportFactory building lettre SMTP transports on port 25
pub struct LettreTransportFactory {
    hello_name: String,
}

impl LettreTransportFactory {
    /// `hello_name` is the hostname announced in the outbound EHLO
    pub fn new(hello_name: impl Into<String>) -> Self {
        Self {
            hello_name: hello_name.into(),
        }
    }
}

#[async_trait]
impl TransportFactory for LettreTransportFactory {
    async fn connect(&self, exchange: &str) -> Result<Box<dyn MailTransport>> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(exchange)
            .port(25)
            .hello_name(ClientId::Domain(self.hello_name.clone()))
            .build();

        Ok(Box::new(LettreTransport { transport }))
    }
}

struct LettreTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl MailTransport for LettreTransport {
    async fn verify(&self) -> Result<()> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Transport("Exchange verification failed".to_string())),
            Err(e) => Err(Error::Transport(format!("Exchange unreachable: {}", e))),
        }
    }

    async fn send(
        &self,
        from: &EmailAddress,
        recipient: &EmailAddress,
        raw: &[u8],
    ) -> Result<SendOutcome> {
        let from: Address = from
            .to_string()
            .parse()
            .map_err(|e| Error::AddressParse(format!("{}: {}", from, e)))?;
        let to: Address = recipient
            .to_string()
            .parse()
            .map_err(|e| Error::AddressParse(format!("{}: {}", recipient, e)))?;

        let envelope = lettre::address::Envelope::new(Some(from), vec![to])
            .map_err(|e| Error::Transport(format!("Invalid envelope: {}", e)))?;

        let response = self
            .transport
            .send_raw(&envelope, raw)
            .await
            .map_err(|e| Error::Transport(format!("Send failed: {}", e)))?;

        if !response.is_positive() {
            return Err(Error::Transport(format!(
                "Remote rejected message: {}",
                response.code()
            )));
        }

        // lettre fails the send when any envelope recipient is refused,
        // and ours carries exactly one
        Ok(SendOutcome {
            accepted: vec![recipient.to_string()],
        })
    }
}

/// Executes the delivery algorithm for a single recipient
pub struct DeliveryAgent {
    resolver: Arc<dyn MxResolver>,
    dkim: Arc<dyn DkimProvider>,
    transports: Arc<dyn TransportFactory>,
    attempt_timeout: Duration,
}

impl DeliveryAgent {
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        dkim: Arc<dyn DkimProvider>,
        transports: Arc<dyn TransportFactory>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            dkim,
            transports,
            attempt_timeout,
        }
    }

    /// Deliver a raw message to one recipient.
    ///
    /// Exchanges are tried once each in ascending priority order. A
    /// failure at any step of an attempt advances to the next record;
    /// exhausting all records is a terminal failure for this attempt.
    pub async fn deliver(
        &self,
        identity: &Identity,
        recipient: &EmailAddress,
        raw: &[u8],
    ) -> Result<()> {
        let records = self.resolver.resolve_mx(&recipient.domain).await?;
        let total = records.len();

        for record in records {
            // DKIM misconfiguration of the sender domain cannot be fixed
            // by trying another exchange, so it propagates
            let signed;
            let outbound: &[u8] = match self.dkim.signing_key(&identity.address.domain).await? {
                DkimStatus::Disabled => raw,
                DkimStatus::Enabled(key) => {
                    let signer = DkimSigner::new(identity.address.domain.clone(), &key)?;
                    signed = signer.sign_message(raw)?;
                    &signed
                }
            };

            let attempt = async {
                let transport = self.transports.connect(&record.exchange).await?;
                transport.verify().await?;
                transport.send(&identity.address, recipient, outbound).await
            };

            let outcome = match tokio::time::timeout(self.attempt_timeout, attempt).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(
                        exchange = %record.exchange,
                        recipient = %recipient,
                        error = %e,
                        "Exchange attempt failed"
                    );
                    continue;
                }
                Err(_) => {
                    warn!(
                        exchange = %record.exchange,
                        recipient = %recipient,
                        "Exchange attempt timed out"
                    );
                    continue;
                }
            };

            if outcome.accepted.iter().any(|a| a == &recipient.to_string()) {
                debug!(
                    exchange = %record.exchange,
                    recipient = %recipient,
                    "Delivered"
                );
                return Ok(());
            }

            warn!(
                exchange = %record.exchange,
                recipient = %recipient,
                "Remote did not accept recipient"
            );
        }

        Err(Error::Delivery(format!(
            "All {} exchanges for {} failed",
            total, recipient.domain
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted behavior for one exchange
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum ExchangeBehavior {
        Accept,
        FailConnect,
        FailVerify,
        RejectRecipient,
    }

    /// TransportFactory with scripted per-exchange outcomes, recording
    /// the order exchanges were tried
    pub struct ScriptedTransportFactory {
        behaviors: HashMap<String, ExchangeBehavior>,
        pub attempts: Arc<Mutex<Vec<String>>>,
        pub deliveries: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
    }

    impl ScriptedTransportFactory {
        pub fn new(entries: Vec<(&str, ExchangeBehavior)>) -> Self {
            Self {
                behaviors: entries
                    .into_iter()
                    .map(|(exchange, behavior)| (exchange.to_string(), behavior))
                    .collect(),
                attempts: Arc::new(Mutex::new(Vec::new())),
                deliveries: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn attempted(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedTransportFactory {
        async fn connect(&self, exchange: &str) -> Result<Box<dyn MailTransport>> {
            self.attempts.lock().unwrap().push(exchange.to_string());

            let behavior = self
                .behaviors
                .get(exchange)
                .copied()
                .unwrap_or(ExchangeBehavior::FailConnect);

            if behavior == ExchangeBehavior::FailConnect {
                return Err(Error::Transport(format!("{}: connection refused", exchange)));
            }

            Ok(Box::new(ScriptedTransport {
                behavior,
                exchange: exchange.to_string(),
                deliveries: self.deliveries.clone(),
            }))
        }
    }

    struct ScriptedTransport {
        behavior: ExchangeBehavior,
        exchange: String,
        deliveries: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn verify(&self) -> Result<()> {
            match self.behavior {
                ExchangeBehavior::FailVerify => {
                    Err(Error::Transport(format!("{}: verify failed", self.exchange)))
                }
                _ => Ok(()),
            }
        }

        async fn send(
            &self,
            _from: &EmailAddress,
            recipient: &EmailAddress,
            raw: &[u8],
        ) -> Result<SendOutcome> {
            match self.behavior {
                ExchangeBehavior::RejectRecipient => Ok(SendOutcome { accepted: vec![] }),
                _ => {
                    self.deliveries.lock().unwrap().push((
                        self.exchange.clone(),
                        recipient.to_string(),
                        raw.to_vec(),
                    ));
                    Ok(SendOutcome {
                        accepted: vec![recipient.to_string()],
                    })
                }
            }
        }
    }

    /// DkimProvider that always reports DKIM disabled
    pub struct DisabledDkim;

    #[async_trait]
    impl DkimProvider for DisabledDkim {
        async fn signing_key(&self, _domain: &str) -> Result<DkimStatus> {
            Ok(DkimStatus::Disabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::dns::testing::StaticMxResolver;
    use pretty_assertions::assert_eq;
    use relayd_common::types::MxRecord;

    fn agent(
        resolver: StaticMxResolver,
        factory: Arc<ScriptedTransportFactory>,
    ) -> DeliveryAgent {
        DeliveryAgent::new(
            Arc::new(resolver),
            Arc::new(DisabledDkim),
            factory,
            Duration::from_secs(5),
        )
    }

    fn identity() -> Identity {
        Identity::new(EmailAddress::new("alice", "example.com"), "Alice")
    }

    #[tokio::test]
    async fn test_failover_tries_exchanges_in_priority_order() {
        let resolver = StaticMxResolver::new(vec![(
            "other.org",
            vec![
                MxRecord::new("mx3.other.org", 30),
                MxRecord::new("mx1.other.org", 10),
                MxRecord::new("mx2.other.org", 20),
            ],
        )]);
        let factory = Arc::new(ScriptedTransportFactory::new(vec![
            ("mx1.other.org", ExchangeBehavior::FailVerify),
            ("mx2.other.org", ExchangeBehavior::FailVerify),
            ("mx3.other.org", ExchangeBehavior::Accept),
        ]));

        let recipient = EmailAddress::new("bob", "other.org");
        agent(resolver, factory.clone())
            .deliver(&identity(), &recipient, b"Subject: Hi\r\n\r\nBody\r\n")
            .await
            .unwrap();

        assert_eq!(
            factory.attempted(),
            vec!["mx1.other.org", "mx2.other.org", "mx3.other.org"]
        );
    }

    #[tokio::test]
    async fn test_exhausting_all_exchanges_is_terminal() {
        let resolver = StaticMxResolver::new(vec![(
            "other.org",
            vec![
                MxRecord::new("mx1.other.org", 10),
                MxRecord::new("mx2.other.org", 20),
            ],
        )]);
        let factory = Arc::new(ScriptedTransportFactory::new(vec![
            ("mx1.other.org", ExchangeBehavior::FailConnect),
            ("mx2.other.org", ExchangeBehavior::RejectRecipient),
        ]));

        let recipient = EmailAddress::new("bob", "other.org");
        let result = agent(resolver, factory.clone())
            .deliver(&identity(), &recipient, b"Subject: Hi\r\n\r\nBody\r\n")
            .await;

        assert!(matches!(result, Err(Error::Delivery(_))));
        assert_eq!(factory.attempted().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_mx_records_propagate() {
        let resolver = StaticMxResolver::new(vec![]);
        let factory = Arc::new(ScriptedTransportFactory::new(vec![]));

        let recipient = EmailAddress::new("bob", "nowhere.test");
        let result = agent(resolver, factory.clone())
            .deliver(&identity(), &recipient, b"x")
            .await;

        assert!(matches!(result, Err(Error::NoMxRecords(_))));
        assert!(factory.attempted().is_empty());
    }
}
