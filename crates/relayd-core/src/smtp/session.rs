//! SMTP submission session state machine
//!
//! One session handles one client connection: greet, authenticate via
//! AUTH LOGIN, collect the envelope, stream DATA into a spool file and
//! hand it to the pipeline. The 250 after end-of-data acknowledges
//! queueing only; delivery happens asynchronously.

use crate::pipeline::Pipeline;
use crate::smtp::auth::{
    decode_login_response, login_challenge_password, login_challenge_username, AuthProvider,
};
use relayd_common::config::Config;
use relayd_common::types::{EmailAddress, Envelope, Identity};
use relayd_common::Result;
use relayd_storage::Spool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tracing::{debug, info, warn};

/// SMTP session state
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    AuthUsername,
    AuthPassword { username: String },
    MailFrom,
    RcptTo,
}

/// Why the command loop ended
#[derive(Debug, PartialEq)]
pub enum SessionOutcome {
    /// Client quit or the connection dropped
    Closed,
    /// Client asked for STARTTLS and was told to proceed; the caller
    /// must wrap the stream and run a fresh command loop over it
    StartTls,
}

/// Result of streaming one DATA payload
enum DataOutcome {
    Complete { path: PathBuf },
    Oversized,
    Disconnected,
}

/// Handles a single client connection
pub struct Session {
    config: Arc<Config>,
    auth: Arc<dyn AuthProvider>,
    pipeline: Arc<Pipeline>,
    spool: Spool,
    peer: String,
    starttls_available: bool,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn AuthProvider>,
        pipeline: Arc<Pipeline>,
        spool: Spool,
        peer: String,
        starttls_available: bool,
    ) -> Self {
        Self {
            config,
            auth,
            pipeline,
            spool,
            peer,
            starttls_available,
        }
    }

    /// Run the command loop over a connected stream.
    ///
    /// `tls_active` reflects whether the stream is already encrypted;
    /// after a `StartTls` outcome the caller wraps the returned stream
    /// and re-enters with `true`, and the protocol state starts over
    /// from the greeting.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        tls_active: bool,
    ) -> Result<(SessionOutcome, S)> {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let outcome = self.command_loop(&mut reader, &mut writer, tls_active).await?;

        // Every response is flushed before this point, so no buffered
        // output is lost
        let stream = reader.into_inner().unsplit(writer.into_inner());
        Ok((outcome, stream))
    }

    async fn command_loop<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        tls_active: bool,
    ) -> Result<SessionOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut state = SessionState::Connected;
        let mut envelope = Envelope::default();
        let mut identity: Option<Identity> = None;

        self.send(
            writer,
            220,
            &format!("{} ESMTP relayd", self.config.server.hostname),
        )
        .await?;

        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| relayd_common::Error::Smtp(format!("read failed: {}", e)))?;

            if bytes_read == 0 {
                debug!(ip = %self.peer, "Client disconnected");
                return Ok(SessionOutcome::Closed);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            debug!(ip = %self.peer, line = trimmed, "SMTP command");

            // AUTH LOGIN continuation lines are base64 responses, not
            // commands
            match state {
                SessionState::AuthUsername => {
                    if trimmed == "*" {
                        state = SessionState::Greeted;
                        self.send(writer, 501, "Authentication cancelled").await?;
                        continue;
                    }
                    match decode_login_response(trimmed) {
                        Some(username) => {
                            state = SessionState::AuthPassword { username };
                            self.send(writer, 334, &login_challenge_password())
                                .await?;
                        }
                        None => {
                            state = SessionState::Greeted;
                            self.send(writer, 501, "Invalid base64").await?;
                        }
                    }
                    continue;
                }
                SessionState::AuthPassword { ref username } => {
                    let username = username.clone();
                    state = SessionState::Greeted;

                    if trimmed == "*" {
                        self.send(writer, 501, "Authentication cancelled").await?;
                        continue;
                    }

                    let password = match decode_login_response(trimmed) {
                        Some(password) => password,
                        None => {
                            self.send(writer, 501, "Invalid base64").await?;
                            continue;
                        }
                    };

                    let outcome = self.auth.validate(&username, &password).await?;
                    info!(
                        txn = "auth",
                        ip = %self.peer,
                        address = %username,
                        status = outcome.reason.as_str(),
                        "Authentication attempt"
                    );

                    if let Some(bound) = outcome.identity {
                        identity = Some(bound);
                        self.send(writer, 235, "Authentication successful")
                            .await?;
                    } else {
                        // One generic refusal regardless of reason
                        self.send(writer, 535, "Invalid Credentials").await?;
                    }
                    continue;
                }
                _ => {}
            }

            let (command, args) = parse_command(trimmed);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    state = SessionState::Greeted;
                    envelope.clear();
                    self.send(writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    state = SessionState::Greeted;
                    envelope.clear();

                    let mut extensions = vec![
                        format!("{} Hello {}", self.config.server.hostname, args),
                        format!("SIZE {}", self.config.smtp.max_message_size),
                    ];
                    if self.starttls_available && !tls_active {
                        extensions.push("STARTTLS".to_string());
                    }
                    extensions.push("AUTH LOGIN".to_string());

                    let last = extensions.len() - 1;
                    for (i, ext) in extensions.iter().enumerate() {
                        if i == last {
                            self.send(writer, 250, ext).await?;
                        } else {
                            self.send_continue(writer, 250, ext).await?;
                        }
                    }
                }

                "STARTTLS" => {
                    if !self.starttls_available || tls_active {
                        self.send(writer, 502, "STARTTLS not supported").await?;
                        continue;
                    }
                    self.send(writer, 220, "Ready to start TLS").await?;
                    return Ok(SessionOutcome::StartTls);
                }

                "AUTH" => {
                    if state != SessionState::Greeted {
                        self.send(writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }
                    if identity.is_some() {
                        self.send(writer, 503, "Already authenticated").await?;
                        continue;
                    }
                    if self.tls_required_for_auth() && !tls_active {
                        self.send(writer, 530, "Must issue a STARTTLS command first")
                            .await?;
                        continue;
                    }

                    let mut parts = args.splitn(2, ' ');
                    let mechanism = parts.next().unwrap_or("").to_uppercase();
                    if mechanism != "LOGIN" {
                        self.send(writer, 504, "Unrecognized authentication mechanism")
                            .await?;
                        continue;
                    }

                    // AUTH LOGIN [initial-response]
                    match parts.next() {
                        Some(initial) => match decode_login_response(initial) {
                            Some(username) => {
                                state = SessionState::AuthPassword { username };
                                self.send(writer, 334, &login_challenge_password())
                                    .await?;
                            }
                            None => {
                                self.send(writer, 501, "Invalid base64").await?;
                            }
                        },
                        None => {
                            state = SessionState::AuthUsername;
                            self.send(writer, 334, &login_challenge_username())
                                .await?;
                        }
                    }
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send(writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let bound = match identity.as_ref() {
                        Some(bound) => bound,
                        None => {
                            self.send(writer, 530, "Authentication required")
                                .await?;
                            continue;
                        }
                    };

                    let (address_raw, size) = match parse_mail_from(args) {
                        Some(parsed) => parsed,
                        None => {
                            self.send(writer, 501, "Bad sender address syntax")
                                .await?;
                            continue;
                        }
                    };

                    if let Some(declared) = size {
                        if declared > self.config.smtp.max_message_size {
                            self.send(writer, 552, "Message exceeds maximum size")
                                .await?;
                            continue;
                        }
                    }

                    // The sender must be exactly the address the session
                    // authenticated as; anything else gets the same
                    // generic refusal as an unparseable address
                    match EmailAddress::parse(&address_raw) {
                        Some(sender) if sender == bound.address => {
                            envelope.mail_from = Some(sender);
                            state = SessionState::MailFrom;
                            self.send(writer, 250, "OK").await?;
                        }
                        rejected => {
                            warn!(
                                ip = %self.peer,
                                address = %address_raw,
                                authenticated = %bound.address,
                                parsed = rejected.is_some(),
                                "Rejected sender address"
                            );
                            self.send(writer, 550, "Bad Address").await?;
                        }
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send(writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    match parse_rcpt_to(args) {
                        Some(recipient) => {
                            envelope.rcpt_to.push(recipient);
                            state = SessionState::RcptTo;
                            self.send(writer, 250, "OK").await?;
                        }
                        None => {
                            self.send(writer, 501, "Bad recipient address syntax")
                                .await?;
                        }
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo || envelope.rcpt_to.is_empty() {
                        self.send(writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send(writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.receive_data(reader).await? {
                        DataOutcome::Complete { path } => {
                            let bound = identity.as_ref().ok_or_else(|| {
                                relayd_common::Error::Smtp("DATA without identity".to_string())
                            })?;

                            match self.pipeline.submit(bound, &envelope, &path).await {
                                Ok(message_id) => {
                                    info!(
                                        ip = %self.peer,
                                        message_id = %message_id,
                                        recipients = envelope.rcpt_to.len(),
                                        "Message accepted"
                                    );
                                    self.send(
                                        writer,
                                        250,
                                        &format!("OK: queued as {}", message_id),
                                    )
                                    .await?;
                                }
                                Err(e) => {
                                    warn!(ip = %self.peer, error = %e, "Failed to queue message");
                                    self.spool.remove(&path).await?;
                                    self.send(writer, 451, "Temporary error").await?;
                                }
                            }
                        }
                        DataOutcome::Oversized => {
                            self.send(writer, 552, "Message exceeds maximum size")
                                .await?;
                        }
                        DataOutcome::Disconnected => {
                            debug!(ip = %self.peer, "Client disconnected during DATA");
                            return Ok(SessionOutcome::Closed);
                        }
                    }

                    envelope.clear();
                    state = SessionState::Greeted;
                }

                "RSET" => {
                    envelope.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send(writer, 250, "OK").await?;
                }

                "NOOP" => {
                    self.send(writer, 250, "OK").await?;
                }

                "VRFY" => {
                    self.send(writer, 252, "Cannot VRFY user").await?;
                }

                "QUIT" => {
                    self.send(writer, 221, "Bye").await?;
                    return Ok(SessionOutcome::Closed);
                }

                _ => {
                    self.send(writer, 500, "Command not recognized").await?;
                }
            }
        }
    }

    fn tls_required_for_auth(&self) -> bool {
        self.config.tls.as_ref().map(|t| t.forced).unwrap_or(false)
    }

    /// Stream the DATA payload into a spool file until <CRLF>.<CRLF>.
    ///
    /// Oversized payloads are drained to the terminator so the session
    /// can keep going; partial files never survive this function except
    /// on the `Complete` path.
    async fn receive_data<R: AsyncBufRead + Unpin>(&self, reader: &mut R) -> Result<DataOutcome> {
        let (path, mut file) = self.spool.create_message().await?;
        let max_size = self.config.smtp.max_message_size;

        let mut written = 0usize;
        let mut oversized = false;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| relayd_common::Error::Smtp(format!("read failed: {}", e)))?;

            if bytes_read == 0 {
                self.spool.remove(&path).await?;
                return Ok(DataOutcome::Disconnected);
            }

            if line.trim_end_matches(['\r', '\n']) == "." {
                break;
            }

            // Transparency: a leading double dot is one literal dot
            let bytes = if line.starts_with("..") {
                &line.as_bytes()[1..]
            } else {
                line.as_bytes()
            };

            written += bytes.len();
            if written > max_size {
                oversized = true;
                continue;
            }

            file.write_all(bytes)
                .await
                .map_err(|e| relayd_common::Error::Spool(format!("spool write failed: {}", e)))?;
        }

        if oversized {
            self.spool.remove(&path).await?;
            return Ok(DataOutcome::Oversized);
        }

        file.flush()
            .await
            .map_err(|e| relayd_common::Error::Spool(format!("spool flush failed: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| relayd_common::Error::Spool(format!("spool sync failed: {}", e)))?;

        Ok(DataOutcome::Complete { path })
    }

    async fn send<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        self.write_line(writer, &format!("{} {}\r\n", code, message))
            .await
    }

    /// Intermediate line of a multi-line response
    async fn send_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        self.write_line(writer, &format!("{}-{}\r\n", code, message))
            .await
    }

    async fn write_line<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        response: &str,
    ) -> Result<()> {
        writer
            .write_all(response.as_bytes())
            .await
            .map_err(|e| relayd_common::Error::Smtp(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| relayd_common::Error::Smtp(format!("flush failed: {}", e)))?;
        debug!(ip = %self.peer, response = response.trim_end(), "SMTP response");
        Ok(())
    }
}

/// Split a command line into verb and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Parse `FROM:<address> [SIZE=n]`, returning the raw address text and
/// the declared size if present
fn parse_mail_from(args: &str) -> Option<(String, Option<usize>)> {
    let args = args.trim();
    if !args.get(..5)?.eq_ignore_ascii_case("FROM:") {
        return None;
    }
    let rest = args[5..].trim();

    let (address, params) = extract_address(rest)?;

    let mut size = None;
    for param in params.split_whitespace() {
        if let Some(value) = param
            .strip_prefix("SIZE=")
            .or_else(|| param.strip_prefix("size="))
        {
            size = Some(value.parse::<usize>().ok()?);
        }
    }

    Some((address, size))
}

/// Parse `TO:<address>`
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();
    if !args.get(..3)?.eq_ignore_ascii_case("TO:") {
        return None;
    }
    let (address, _) = extract_address(args[3..].trim())?;
    EmailAddress::parse(&address)
}

/// Pull the address out of optional angle brackets; the remainder is
/// the ESMTP parameter text
fn extract_address(text: &str) -> Option<(String, &str)> {
    if let Some(stripped) = text.strip_prefix('<') {
        let end = stripped.find('>')?;
        Some((stripped[..end].to_string(), &stripped[end + 1..]))
    } else {
        let mut parts = text.splitn(2, ' ');
        let address = parts.next()?;
        Some((address.to_string(), parts.next().unwrap_or("")))
    }
}
