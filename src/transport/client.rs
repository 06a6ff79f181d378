//! Stateful IMAP-subset client
//!
//! One authenticated connection to a remote mailbox server: greeting,
//! capability negotiation, STARTTLS upgrade, LOGIN, SELECT, UID FETCH for
//! header enumeration / deltas / bodies. Every exchange runs under the
//! per-command timeout; a malformed header record is skipped and logged,
//! not fatal to the batch.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, SecurityMode, SessionSettings};
use crate::transport::parser::{
    self, FetchRecord, Line, SelectState, Status,
};
use crate::transport::stream::{connect_plain, wrap_tls, MailStream};
use crate::transport::{HeaderDelta, MailConnector, MailTransport, RemoteHeader, SyncToken};
use crate::types::error::{MailError, Result};

const HEADER_FETCH_ITEMS: &str = "(UID FLAGS BODY.PEEK[HEADER.FIELDS (SUBJECT FROM DATE)])";
const FLAG_FETCH_ITEMS: &str = "(UID FLAGS)";

/// Protocol client over any byte stream. Production uses `MailStream`;
/// tests drive it over an in-memory duplex pipe.
pub struct TransportClient<S> {
    stream: S,
    read_buf: Vec<u8>,
    tag_counter: u32,
    capabilities: Vec<String>,
    selected: Option<String>,
    command_timeout: Duration,
}

impl<S> TransportClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, command_timeout: Duration) -> Self {
        Self {
            stream,
            read_buf: Vec::with_capacity(4096),
            tag_counter: 0,
            capabilities: Vec::new(),
            selected: None,
            command_timeout,
        }
    }

    /// Hand the underlying stream back (STARTTLS upgrade).
    pub fn into_stream(self) -> S {
        self.stream
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:04}", self.tag_counter)
    }

    /// Read one CRLF-terminated line; reports a trailing `{N}` literal size
    /// without consuming the literal bytes.
    async fn read_line(&mut self) -> Result<(String, Option<usize>)> {
        self.read_buf.clear();
        loop {
            let mut byte = [0u8; 1];
            let n = self.stream.read(&mut byte).await?;
            if n == 0 {
                return Err(MailError::Network("connection closed by server".to_string()));
            }
            self.read_buf.push(byte[0]);
            if self.read_buf.ends_with(b"\r\n") {
                break;
            }
        }
        let line = String::from_utf8_lossy(&self.read_buf[..self.read_buf.len() - 2])
            .trim()
            .to_string();
        let literal = parser::literal_size(&line);
        Ok((line, literal))
    }

    /// Read one line plus its announced literal, if any.
    async fn read_response(&mut self) -> Result<(String, Option<Vec<u8>>)> {
        let (line, literal) = self.read_line().await?;
        if let Some(size) = literal {
            let mut data = vec![0u8; size];
            self.stream.read_exact(&mut data).await?;
            return Ok((line, Some(data)));
        }
        Ok((line, None))
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send one command and collect untagged responses until the tagged
    /// status arrives. The whole exchange runs under the command timeout.
    async fn command(&mut self, cmd: &str) -> Result<(Vec<(Line, Option<Vec<u8>>)>, Line)> {
        let tag = self.next_tag();
        let deadline = self.command_timeout;
        let exchange = async {
            let full = format!("{} {}", tag, cmd);
            self.write_line(&full).await?;
            let mut untagged = Vec::new();
            loop {
                let (line_str, literal) = self.read_response().await?;
                let line = parser::parse_line(&line_str);
                if line.tag.as_deref() == Some(tag.as_str()) {
                    return Ok((untagged, line));
                }
                untagged.push((line, literal));
            }
        };
        timeout(deadline, exchange)
            .await
            .map_err(|_| MailError::Network("protocol exchange timed out".to_string()))?
    }

    /// Read the server greeting. Must be `* OK` or `* PREAUTH`.
    pub async fn read_greeting(&mut self) -> Result<String> {
        let (line, _) = timeout(self.command_timeout, self.read_response())
            .await
            .map_err(|_| MailError::Network("greeting timed out".to_string()))??;
        if !line.starts_with("* OK") && !line.starts_with("* PREAUTH") {
            return Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                line
            )));
        }
        Ok(line)
    }

    /// Learn capabilities from the greeting code or a CAPABILITY exchange.
    pub async fn negotiate_capabilities(&mut self, greeting: Option<&str>) -> Result<()> {
        if let Some(greeting) = greeting {
            let caps = parser::parse_capabilities(greeting);
            if !caps.is_empty() {
                self.capabilities = caps;
                return Ok(());
            }
        }
        let (untagged, done) = self.command("CAPABILITY").await?;
        if done.status != Some(Status::Ok) {
            return Err(MailError::Protocol("CAPABILITY rejected".to_string()));
        }
        for (line, _) in untagged {
            let caps = parser::parse_capabilities(&line.raw);
            if !caps.is_empty() {
                self.capabilities = caps;
                break;
            }
        }
        Ok(())
    }

    /// Request the TLS upgrade. The caller swaps the stream after this
    /// returns; the connection must not be used in between.
    pub async fn request_starttls(&mut self) -> Result<()> {
        if !self.has_capability("STARTTLS") {
            return Err(MailError::Protocol(
                "server does not offer STARTTLS".to_string(),
            ));
        }
        let (_, done) = self.command("STARTTLS").await?;
        match done.status {
            Some(Status::Ok) => Ok(()),
            _ => Err(MailError::Protocol("STARTTLS rejected".to_string())),
        }
    }

    /// Authenticate. A tagged NO is a credential rejection and is never
    /// retried at this layer.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let cmd = format!(
            "LOGIN {} {}",
            parser::quote_string(user),
            parser::quote_string(password)
        );
        let (_, done) = self.command(&cmd).await?;
        match done.status {
            Some(Status::Ok) => Ok(()),
            Some(Status::No) => Err(MailError::Auth("credentials rejected".to_string())),
            _ => Err(MailError::Protocol("LOGIN failed".to_string())),
        }
    }

    async fn select(&mut self, mailbox: &str) -> Result<SelectState> {
        let condstore = self.has_capability("CONDSTORE");
        let cmd = if condstore {
            format!("SELECT {} (CONDSTORE)", parser::quote_string(mailbox))
        } else {
            format!("SELECT {}", parser::quote_string(mailbox))
        };
        let (untagged, done) = self.command(&cmd).await?;
        if done.status != Some(Status::Ok) {
            self.selected = None;
            return Err(MailError::NotFound(format!(
                "mailbox {:?} not selectable",
                mailbox
            )));
        }
        let mut state = SelectState::default();
        for (line, _) in &untagged {
            parser::parse_select_line(&line.raw, &mut state);
        }
        self.selected = Some(mailbox.to_string());
        Ok(state)
    }

    /// Run a UID FETCH and hand every well-formed record to `collect`.
    /// Malformed records are skipped with a warning.
    async fn uid_fetch<F>(&mut self, cmd: &str, mut collect: F) -> Result<Line>
    where
        F: FnMut(FetchRecord) + Send,
    {
        let (untagged, done) = self.command(cmd).await?;
        for (line, literal) in untagged {
            if !line.untagged {
                continue;
            }
            if line.raw.contains(" FETCH (") {
                match parser::parse_fetch_line(&line.raw, literal.as_deref()) {
                    Some(record) => collect(record),
                    None => warn!("Skipping malformed fetch record: {}", line.raw),
                }
            }
        }
        Ok(done)
    }

    fn collect_headers(records: Vec<FetchRecord>) -> Vec<RemoteHeader> {
        let mut headers = Vec::with_capacity(records.len());
        for record in records {
            match parser::remote_header_from(record) {
                Some(header) => headers.push(header),
                None => warn!("Skipping header record without UID"),
            }
        }
        headers
    }

    async fn list_full(&mut self, state: SelectState) -> Result<HeaderDelta> {
        let mut records = Vec::new();
        if state.exists > 0 {
            let cmd = format!("UID FETCH 1:* {}", HEADER_FETCH_ITEMS);
            let done = self.uid_fetch(&cmd, |r| records.push(r)).await?;
            if done.status != Some(Status::Ok) {
                return Err(MailError::Protocol(
                    "header enumeration rejected".to_string(),
                ));
            }
        }
        let headers = Self::collect_headers(records);
        let max_uid = headers.iter().map(|h| h.uid).max().unwrap_or(0);
        let token = SyncToken {
            uidvalidity: state.uidvalidity.unwrap_or(0),
            uidnext: state.uidnext.unwrap_or(max_uid + 1),
            modseq: state.highest_modseq.unwrap_or(0),
        };
        Ok(HeaderDelta::Full { headers, token })
    }

    async fn list_changes(
        &mut self,
        state: SelectState,
        since: &SyncToken,
    ) -> Result<HeaderDelta> {
        // New messages first: everything at or past the old UIDNEXT.
        let mut new_records = Vec::new();
        let server_uidnext = state.uidnext.unwrap_or(since.uidnext);
        if server_uidnext > since.uidnext {
            let cmd = format!("UID FETCH {}:* {}", since.uidnext, HEADER_FETCH_ITEMS);
            let done = self.uid_fetch(&cmd, |r| new_records.push(r)).await?;
            if done.status != Some(Status::Ok) {
                return Err(MailError::Protocol("delta fetch rejected".to_string()));
            }
        }
        // Servers answer a UID range past the end with the last message;
        // keep only genuinely new UIDs.
        let new: Vec<RemoteHeader> = Self::collect_headers(new_records)
            .into_iter()
            .filter(|h| h.uid >= since.uidnext)
            .collect();

        // Flag changes and expunges since the old MODSEQ.
        let cmd = format!(
            "UID FETCH 1:* {} (CHANGEDSINCE {} VANISHED)",
            FLAG_FETCH_ITEMS, since.modseq
        );
        let (untagged, done) = self.command(&cmd).await?;
        if done.status == Some(Status::Bad) {
            // Server cannot serve a delta from this token anymore.
            return Err(MailError::ResyncRequired);
        }
        if done.status != Some(Status::Ok) {
            return Err(MailError::Protocol("change fetch rejected".to_string()));
        }

        let mut flag_updates = Vec::new();
        let mut expunged = Vec::new();
        for (line, literal) in untagged {
            if let Some(uids) = parser::parse_vanished(&line.raw) {
                expunged.extend(uids);
                continue;
            }
            if line.raw.contains(" FETCH (") {
                match parser::parse_fetch_line(&line.raw, literal.as_deref()) {
                    Some(record) => match (record.uid, record.flags) {
                        (Some(uid), Some(flags)) if uid < since.uidnext => {
                            flag_updates.push((uid, flags));
                        }
                        (Some(_), _) => {} // new message, handled above
                        (None, _) => warn!("Skipping flag record without UID"),
                    },
                    None => warn!("Skipping malformed fetch record: {}", line.raw),
                }
            }
        }

        let max_new_uid = new.iter().map(|h| h.uid).max();
        let token = SyncToken {
            uidvalidity: since.uidvalidity,
            uidnext: state
                .uidnext
                .unwrap_or_else(|| max_new_uid.map(|u| u + 1).unwrap_or(since.uidnext)),
            modseq: state.highest_modseq.unwrap_or(since.modseq),
        };
        Ok(HeaderDelta::Changes {
            new,
            flag_updates,
            expunged,
            token,
        })
    }
}

#[async_trait]
impl<S> MailTransport for TransportClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn list_headers(
        &mut self,
        mailbox: &str,
        since: Option<&SyncToken>,
    ) -> Result<HeaderDelta> {
        let state = self.select(mailbox).await?;
        let uidvalidity = state
            .uidvalidity
            .ok_or_else(|| MailError::Protocol("SELECT reported no UIDVALIDITY".to_string()))?;

        match since {
            Some(token) if token.uidvalidity != uidvalidity => {
                // Mailbox was recreated; every cached UID is invalid.
                debug!(
                    "UIDVALIDITY changed for {:?}: {} -> {}",
                    mailbox, token.uidvalidity, uidvalidity
                );
                Err(MailError::ResyncRequired)
            }
            Some(token) if self.has_capability("CONDSTORE") => {
                self.list_changes(state, token).await
            }
            // No token, or no CONDSTORE support: full enumeration.
            _ => self.list_full(state).await,
        }
    }

    async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>> {
        if self.selected.as_deref() != Some(mailbox) {
            self.select(mailbox).await?;
        }
        let cmd = format!("UID FETCH {} (BODY[])", uid);
        let mut body: Option<Vec<u8>> = None;
        let done = self
            .uid_fetch(&cmd, |record| {
                if record.uid == Some(uid) || record.uid.is_none() {
                    if let Some(data) = record.header {
                        body = Some(data);
                    }
                }
            })
            .await?;
        if done.status != Some(Status::Ok) {
            return Err(MailError::Protocol("body fetch rejected".to_string()));
        }
        body.ok_or_else(|| MailError::NotFound(format!("no message with uid {}", uid)))
    }

    async fn close(&mut self) -> Result<()> {
        // Best-effort: the server may already have dropped us.
        let _ = self.command("LOGOUT").await;
        Ok(())
    }
}

/// Production connector: TCP + TLS/STARTTLS + LOGIN per the account config.
pub struct NetConnector {
    settings: SessionSettings,
}

impl NetConnector {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.connect_timeout_secs)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }
}

#[async_trait]
impl MailConnector for NetConnector {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn MailTransport>> {
        let password = account.password.resolve().await?;
        let tcp = connect_plain(&account.host, account.port, self.connect_timeout()).await?;

        let stream = match account.security {
            SecurityMode::Tls => {
                let tls = wrap_tls(&account.host, tcp, self.connect_timeout()).await?;
                MailStream::Tls(Box::new(tls))
            }
            SecurityMode::Plain | SecurityMode::Starttls => MailStream::Plain(tcp),
        };

        let mut client = TransportClient::new(stream, self.command_timeout());
        let greeting = client.read_greeting().await?;
        client.negotiate_capabilities(Some(&greeting)).await?;

        if account.security == SecurityMode::Starttls {
            client.request_starttls().await?;
            let upgraded = client
                .into_stream()
                .upgrade_to_tls(&account.host, self.connect_timeout())
                .await?;
            client = TransportClient::new(upgraded, self.command_timeout());
            // Capabilities may differ after the upgrade.
            client.negotiate_capabilities(None).await?;
        }

        client.login(account.login_user(), &password).await?;
        info!(
            "Connected to {}:{} for account {}",
            account.host, account.port, account.id
        );
        Ok(Box::new(client))
    }
}
