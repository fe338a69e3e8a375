//! SMTP submission listener

use crate::pipeline::Pipeline;
use crate::smtp::auth::AuthProvider;
use crate::smtp::session::{Session, SessionOutcome};
use crate::smtp::tls::create_tls_acceptor;
use relayd_common::config::Config;
use relayd_common::{Error, Result};
use relayd_storage::Spool;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Accepts submission connections and runs one session per client
pub struct SmtpServer {
    config: Arc<Config>,
    auth: Arc<dyn AuthProvider>,
    pipeline: Arc<Pipeline>,
    spool: Spool,
    connection_semaphore: Arc<Semaphore>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl SmtpServer {
    /// Create a server, loading the TLS acceptor when configured.
    ///
    /// A forced-TLS configuration without a working certificate is a
    /// startup error; an optional one degrades to plaintext with a
    /// warning.
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn AuthProvider>,
        pipeline: Arc<Pipeline>,
        spool: Spool,
    ) -> Result<Self> {
        let tls_acceptor = match config.tls.as_ref() {
            Some(tls_config) => match create_tls_acceptor(tls_config) {
                Ok(acceptor) => {
                    info!("TLS configured, STARTTLS enabled");
                    Some(Arc::new(acceptor))
                }
                Err(e) if tls_config.forced => {
                    return Err(Error::Config(format!(
                        "TLS is forced but could not be initialized: {}",
                        e
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to initialize TLS, STARTTLS disabled");
                    None
                }
            },
            None => None,
        };

        let max_connections = config.smtp.max_connections;

        Ok(Self {
            config,
            auth,
            pipeline,
            spool,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            tls_acceptor,
        })
    }

    /// Accept connections until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.smtp.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Smtp(format!("Failed to bind {}: {}", addr, e)))?;

        info!(
            addr = %addr,
            starttls = self.tls_acceptor.is_some(),
            "Submission server listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer_addr, "Max connections reached, rejecting");
                            tokio::spawn(refuse_connection(stream));
                            continue;
                        }
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer_addr.ip()).await {
                            error!(peer = %peer_addr, error = %e, "Session error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: std::net::IpAddr) -> Result<()> {
        let session = Session::new(
            self.config.clone(),
            self.auth.clone(),
            self.pipeline.clone(),
            self.spool.clone(),
            peer.to_string(),
            self.tls_acceptor.is_some(),
        );

        let (outcome, stream) = session.run(stream, false).await?;
        match outcome {
            SessionOutcome::Closed => Ok(()),
            SessionOutcome::StartTls => {
                // The acceptor exists or the session would have refused
                // the command
                let acceptor = self
                    .tls_acceptor
                    .as_ref()
                    .ok_or_else(|| Error::Smtp("STARTTLS accepted without TLS".to_string()))?;

                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::Smtp(format!("TLS handshake failed: {}", e)))?;

                // Protocol state starts over on the encrypted stream
                session.run(tls_stream, true).await?;
                Ok(())
            }
        }
    }
}

/// Turn away a client at the connection cap with a retryable response
async fn refuse_connection<S>(mut stream: S)
where
    S: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use tokio::io::AsyncWriteExt;

    let _ = stream.write_all(b"421 Too many connections\r\n").await;
    let _ = stream.shutdown().await;
}
