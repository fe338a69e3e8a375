//! MX resolution for recipient domains

use async_trait::async_trait;
use relayd_common::types::{sort_mx_records, MxRecord};
use relayd_common::{Error, Result};
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// Resolver for a domain's mail exchanges.
///
/// Implementations return records sorted ascending by priority, so the
/// first record is always the preferred exchange. A domain with no MX
/// entries fails with [`Error::NoMxRecords`], which the pipeline treats
/// as a delivery failure rather than a transient error.
#[async_trait]
pub trait MxResolver: Send + Sync {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>>;
}

/// MxResolver backed by the system DNS configuration
pub struct SystemMxResolver {
    resolver: TokioAsyncResolver,
}

impl SystemMxResolver {
    /// Create a resolver using the default upstream configuration
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for SystemMxResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MxResolver for SystemMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        let lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(e) => {
                return match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => {
                        Err(Error::NoMxRecords(domain.to_string()))
                    }
                    _ => Err(Error::Dns(format!("MX lookup for {} failed: {}", domain, e))),
                }
            }
        };

        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| {
                let exchange = mx.exchange().to_utf8();
                MxRecord::new(exchange.trim_end_matches('.').to_string(), mx.preference())
            })
            .collect();

        if records.is_empty() {
            return Err(Error::NoMxRecords(domain.to_string()));
        }

        sort_mx_records(&mut records);
        debug!(domain = %domain, records = records.len(), "Resolved MX records");

        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Resolver with a fixed record table, for tests
    pub struct StaticMxResolver {
        records: HashMap<String, Vec<MxRecord>>,
    }

    impl StaticMxResolver {
        pub fn new(entries: Vec<(&str, Vec<MxRecord>)>) -> Self {
            Self {
                records: entries
                    .into_iter()
                    .map(|(domain, records)| (domain.to_string(), records))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl MxResolver for StaticMxResolver {
        async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
            match self.records.get(domain) {
                Some(records) if !records.is_empty() => {
                    let mut records = records.clone();
                    sort_mx_records(&mut records);
                    Ok(records)
                }
                _ => Err(Error::NoMxRecords(domain.to_string())),
            }
        }
    }
}
