//! Service facade
//!
//! The one surface a frontend talks to: list cached headers (syncing on a
//! cold cache), summarize free text, summarize a cached message. Errors
//! crossing this boundary are flattened to a closed `kind` vocabulary with
//! fixed messages; raw protocol and model detail stays in the logs.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::{HeaderCache, SyncEngine, SyncScheduler, SyncTrigger};
use crate::config::{AccountConfig, ServiceConfig};
use crate::session::SessionManager;
use crate::summarize::{InferenceClient, OllamaClient, SummarizeEngine, SummarizeRequest};
use crate::transport::{MailConnector, NetConnector};
use crate::types::error::{MailError, Result};
use crate::types::{HeaderView, MessageKey, SummaryResult};

/// Error shape handed to the frontend. `kind` is a closed vocabulary a UI
/// can switch on; `message` is fixed text safe to display verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiError {
    pub kind: &'static str,
    pub message: &'static str,
}

impl From<MailError> for UiError {
    fn from(e: MailError) -> Self {
        let (kind, message) = match &e {
            MailError::Network(_) => ("network", "The connection to the mail server failed"),
            MailError::Unavailable(_) => ("unavailable", "The mail server is unreachable"),
            MailError::Auth(_) => ("auth", "Authentication failed; check the account credentials"),
            MailError::Protocol(_) | MailError::ResyncRequired => {
                ("protocol", "The mail server sent an unexpected response")
            }
            MailError::ModelUnavailable(_) => {
                ("model_unavailable", "The local model is not available")
            }
            MailError::ModelTimeout(_) => {
                ("model_timeout", "Summarization took too long and was stopped")
            }
            MailError::EmptyInput => ("empty_input", "There is no text to summarize"),
            MailError::Busy => ("busy", "The summarizer is busy; try again shortly"),
            MailError::Cancelled => ("cancelled", "The request was cancelled"),
            MailError::NotFound(_) => ("not_found", "The requested item does not exist"),
            MailError::Config(_) => ("config", "The service configuration is invalid"),
            MailError::CacheCorruption(_)
            | MailError::Database(_)
            | MailError::Internal(_) => ("internal", "Something went wrong; see the service logs"),
        };
        // The detailed error never crosses the boundary; log it here.
        warn!("Returning {} to caller: {}", kind, e);
        Self { kind, message }
    }
}

pub type UiResult<T> = std::result::Result<T, UiError>;

pub struct MailService {
    config: ServiceConfig,
    cache: Arc<HeaderCache>,
    sessions: Arc<SessionManager>,
    sync: Arc<SyncEngine>,
    engine: Arc<SummarizeEngine>,
    scheduler: Arc<SyncScheduler>,
    trigger_rx: Mutex<Option<flume::Receiver<SyncTrigger>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MailService {
    /// Wire up the production stack.
    pub fn new(config: ServiceConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(HeaderCache::new(&config.cache.db_path)?);
        let connector: Arc<dyn MailConnector> =
            Arc::new(NetConnector::new(config.session.clone()));
        let inference: Arc<dyn InferenceClient> = Arc::new(OllamaClient::new(&config.summarizer)?);
        Ok(Self::with_parts(config, cache, connector, inference))
    }

    /// Assemble from explicit parts. Tests inject fakes here.
    pub fn with_parts(
        config: ServiceConfig,
        cache: Arc<HeaderCache>,
        connector: Arc<dyn MailConnector>,
        inference: Arc<dyn InferenceClient>,
    ) -> Arc<Self> {
        let sessions = SessionManager::new(connector, config.session.clone());
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&cache),
            Arc::clone(&sessions),
            config.cache.body_budget_bytes,
        ));
        let engine = Arc::new(SummarizeEngine::new(inference, &config.summarizer));
        let (scheduler, trigger_rx) = SyncScheduler::new(config.sync.clone());
        Arc::new(Self {
            config,
            cache,
            sessions,
            sync,
            engine,
            scheduler: Arc::new(scheduler),
            trigger_rx: Mutex::new(Some(trigger_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn account(&self, account_id: &str) -> Result<&AccountConfig> {
        self.config
            .account(account_id)
            .ok_or_else(|| MailError::NotFound(format!("unknown account {:?}", account_id)))
    }

    /// Headers for one account across its configured mailboxes, newest UID
    /// first within each mailbox. A cold cache syncs inline; a warm cache is
    /// served immediately and refreshed in the background.
    pub async fn get_emails(&self, account_id: &str) -> UiResult<Vec<HeaderView>> {
        let account = self.account(account_id)?;
        let mailboxes = &self.config.sync.mailboxes;

        let mut views: Vec<HeaderView> = Vec::new();
        let mut cold = true;
        for mailbox in mailboxes {
            let headers = self.sync.list_headers(account_id, mailbox)?;
            if self.cache.sync_token(account_id, mailbox)?.is_some() {
                cold = false;
            }
            views.extend(headers.into_iter().map(HeaderView::from));
        }

        if cold {
            info!("Cold cache for account {}, syncing inline", account_id);
            views.clear();
            for mailbox in mailboxes {
                self.sync.sync(account, mailbox).await?;
                views.extend(
                    self.sync
                        .list_headers(account_id, mailbox)?
                        .into_iter()
                        .map(HeaderView::from),
                );
            }
        } else {
            // Serve the cache now, refresh behind the caller's back.
            let tx = self.scheduler.trigger_sender();
            for mailbox in mailboxes {
                let _ = tx.send(SyncTrigger::Mailbox {
                    account_id: account_id.to_string(),
                    mailbox: mailbox.clone(),
                });
            }
        }
        Ok(views)
    }

    /// Summarize free-form text with no message identity.
    pub async fn summarize_content(&self, text: &str) -> UiResult<SummaryResult> {
        let result = self
            .engine
            .summarize(SummarizeRequest::from_text(text), None)
            .await?;
        Ok(result)
    }

    /// Summarize one cached message. The body is fetched (cache-first),
    /// pinned against eviction while in use, and the header is marked
    /// summarized on success.
    pub async fn summarize_message(
        &self,
        account_id: &str,
        mailbox: &str,
        uid: u32,
    ) -> UiResult<SummaryResult> {
        let account = self.account(account_id)?;
        let key = MessageKey::new(account_id, mailbox, uid);
        let header = self
            .cache
            .get_header(&key)?
            .ok_or_else(|| MailError::NotFound(format!("no cached message {}", key)))?;

        self.cache.pin_body(&key);
        let outcome = async {
            let raw = self.sync.fetch_body(account, &key).await?;
            let body = extract_body_text(&raw)?;
            self.engine
                .summarize(
                    SummarizeRequest {
                        key: Some(key.clone()),
                        from: header.from.clone(),
                        subject: header.subject.clone(),
                        body,
                    },
                    None,
                )
                .await
        }
        .await;
        self.cache.unpin_body(&key);

        let result = outcome?;
        self.cache.mark_summarized(&key)?;
        Ok(result)
    }

    /// Text body of one cached message, fetching from the server when the
    /// body cache misses.
    pub async fn fetch_body(&self, account_id: &str, mailbox: &str, uid: u32) -> UiResult<String> {
        let account = self.account(account_id)?;
        let key = MessageKey::new(account_id, mailbox, uid);
        let raw = self.sync.fetch_body(account, &key).await?;
        let body = extract_body_text(&raw)?;
        Ok(body)
    }

    /// Start the background sync machinery: scheduler ticks, the trigger
    /// consumer, and the idle-session reaper.
    pub fn start_background(self: &Arc<Self>) {
        let rx = match self.trigger_rx.lock().expect("trigger lock poisoned").take() {
            Some(rx) => rx,
            None => {
                warn!("Background tasks already started");
                return;
            }
        };

        self.scheduler.mark_running();
        let ticker = {
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        let consumer = {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.consume_triggers(rx).await })
        };

        let reaper = self.sessions.spawn_idle_reaper();

        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.push(ticker);
        tasks.push(consumer);
        tasks.push(reaper);
        info!("Background sync started");
    }

    async fn consume_triggers(&self, rx: flume::Receiver<SyncTrigger>) {
        while let Ok(trigger) = rx.recv_async().await {
            match trigger {
                SyncTrigger::Poll => {
                    for account in &self.config.accounts {
                        for mailbox in &self.config.sync.mailboxes {
                            if let Err(e) = self.sync.sync(account, mailbox).await {
                                error!(
                                    "Scheduled sync of {}/{} failed: {}",
                                    account.id, mailbox, e
                                );
                            }
                        }
                    }
                }
                SyncTrigger::Mailbox {
                    account_id,
                    mailbox,
                } => {
                    let Some(account) = self.config.account(&account_id) else {
                        warn!("Sync trigger for unknown account {:?}", account_id);
                        continue;
                    };
                    if let Err(e) = self.sync.sync(account, &mailbox).await {
                        error!("Refresh of {}/{} failed: {}", account_id, mailbox, e);
                    }
                }
                SyncTrigger::Shutdown => break,
            }
        }
    }

    /// Stop background tasks and close pooled connections.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.sessions.close_all().await;
        info!("Service shut down");
    }
}

/// Pull displayable text out of a raw message: the first text/plain part,
/// falling back to the root body.
fn extract_body_text(raw: &[u8]) -> Result<String> {
    let mail = mailparse::parse_mail(raw)
        .map_err(|e| MailError::Internal(format!("unparseable message: {}", e)))?;

    fn find_plain<'a, 'b>(
        part: &'b mailparse::ParsedMail<'a>,
    ) -> Option<&'b mailparse::ParsedMail<'a>> {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return Some(part);
        }
        part.subparts.iter().find_map(find_plain)
    }

    let part = find_plain(&mail).unwrap_or(&mail);
    part.get_body()
        .map_err(|e| MailError::Internal(format!("undecodable message body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_error_hides_raw_detail() {
        let err = UiError::from(MailError::Protocol(
            "A0003 BAD internal server hostname leaked".to_string(),
        ));
        assert_eq!(err.kind, "protocol");
        assert!(!err.message.contains("hostname"));
    }

    #[test]
    fn test_ui_error_kind_mapping() {
        let cases = [
            (MailError::Network("x".into()), "network"),
            (MailError::Unavailable("x".into()), "unavailable"),
            (MailError::Auth("x".into()), "auth"),
            (MailError::ModelUnavailable("x".into()), "model_unavailable"),
            (MailError::ModelTimeout(60), "model_timeout"),
            (MailError::Busy, "busy"),
            (MailError::EmptyInput, "empty_input"),
            (MailError::NotFound("x".into()), "not_found"),
            (MailError::CacheCorruption("x".into()), "internal"),
        ];
        for (error, kind) in cases {
            assert_eq!(UiError::from(error).kind, kind);
        }
    }

    #[test]
    fn test_extract_body_prefers_text_plain() {
        let raw = b"Content-Type: multipart/alternative; boundary=\"b\"\r\n\r\n\
            --b\r\nContent-Type: text/html\r\n\r\n<p>html</p>\r\n\
            --b\r\nContent-Type: text/plain\r\n\r\nplain text\r\n--b--\r\n";
        let body = extract_body_text(raw).unwrap();
        assert_eq!(body.trim(), "plain text");
    }

    #[test]
    fn test_extract_body_falls_back_to_root() {
        let raw = b"Content-Type: text/html\r\n\r\n<p>only html</p>\r\n";
        let body = extract_body_text(raw).unwrap();
        assert!(body.contains("only html"));
    }
}
