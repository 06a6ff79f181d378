//! Sync engine
//!
//! Drives reconciliation between the remote server and the local cache.
//! One sync per (account, mailbox) runs at a time: concurrent callers
//! coalesce onto the in-flight run and all receive its outcome. A server
//! that can no longer serve a delta (`ResyncRequired`) triggers exactly one
//! cache reset and full re-enumeration; a second demand in the same pass is
//! a protocol failure, not a loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::db::HeaderCache;
use crate::config::AccountConfig;
use crate::session::SessionManager;
use crate::transport::{HeaderDelta, SyncToken};
use crate::types::error::{MailError, Result};
use crate::types::{MessageHeader, MessageKey, SyncOutcome};

type InflightMap = HashMap<(String, String), watch::Receiver<Option<Result<SyncOutcome>>>>;

pub struct SyncEngine {
    cache: Arc<HeaderCache>,
    sessions: Arc<SessionManager>,
    body_budget_bytes: u64,
    inflight: Mutex<InflightMap>,
}

impl SyncEngine {
    pub fn new(
        cache: Arc<HeaderCache>,
        sessions: Arc<SessionManager>,
        body_budget_bytes: u64,
    ) -> Self {
        Self {
            cache,
            sessions,
            body_budget_bytes,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Serve headers straight from the cache. Corrupt rows clear the
    /// mailbox (token included), so the next sync is a full enumeration;
    /// the caller sees an empty mailbox, never the corruption.
    pub fn list_headers(&self, account_id: &str, mailbox: &str) -> Result<Vec<MessageHeader>> {
        match self.cache.list_headers(account_id, mailbox) {
            Ok(headers) => Ok(headers),
            Err(MailError::CacheCorruption(msg)) => {
                warn!(
                    "Corrupt cached headers for {}/{}: {}",
                    account_id, mailbox, msg
                );
                self.cache.clear_mailbox(account_id, mailbox)?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Sync one mailbox. If a sync for the same mailbox is already running,
    /// wait for it and return its outcome instead of starting another.
    pub async fn sync(&self, account: &AccountConfig, mailbox: &str) -> Result<SyncOutcome> {
        let key = (account.id.clone(), mailbox.to_string());

        let role = {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            match inflight.get(&key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let result = self.do_sync(account, mailbox).await;
                let _ = tx.send(Some(result.clone()));
                self.inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&key);
                result
            }
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(MailError::Internal(
                        "in-flight sync abandoned".to_string(),
                    ));
                }
            },
        }
    }

    async fn do_sync(&self, account: &AccountConfig, mailbox: &str) -> Result<SyncOutcome> {
        // A corrupt token means the cache can no longer be trusted for this
        // mailbox; reset and enumerate from scratch.
        let token = match self.cache.sync_token(&account.id, mailbox) {
            Ok(token) => token,
            Err(MailError::CacheCorruption(msg)) => {
                warn!("Corrupt sync state for {}/{}: {}", account.id, mailbox, msg);
                self.cache.clear_mailbox(&account.id, mailbox)?;
                None
            }
            Err(e) => return Err(e),
        };

        let mut attempted_full = token.is_none();
        let mut current = token;
        loop {
            match self.list_remote(account, mailbox, current).await {
                Ok(delta) => return self.apply(account, mailbox, delta),
                Err(MailError::ResyncRequired) if !attempted_full => {
                    warn!(
                        "Server invalidated sync state for {}/{}, re-enumerating",
                        account.id, mailbox
                    );
                    self.cache.clear_mailbox(&account.id, mailbox)?;
                    attempted_full = true;
                    current = None;
                }
                Err(MailError::ResyncRequired) => {
                    return Err(MailError::Protocol(
                        "server demanded resync after full enumeration".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_remote(
        &self,
        account: &AccountConfig,
        mailbox: &str,
        token: Option<SyncToken>,
    ) -> Result<HeaderDelta> {
        let mailbox = mailbox.to_string();
        self.sessions
            .with_session(account, move |transport| {
                Box::pin(async move { transport.list_headers(&mailbox, token.as_ref()).await })
            })
            .await
    }

    fn apply(
        &self,
        account: &AccountConfig,
        mailbox: &str,
        delta: HeaderDelta,
    ) -> Result<SyncOutcome> {
        let outcome = match delta {
            HeaderDelta::Full { headers, token } => {
                self.cache
                    .reconcile_full(&account.id, mailbox, &headers, &token)?
            }
            HeaderDelta::Changes {
                new,
                flag_updates,
                expunged,
                token,
            } => self.cache.reconcile_changes(
                &account.id,
                mailbox,
                &new,
                &flag_updates,
                &expunged,
                &token,
            )?,
        };
        if !outcome.is_noop() {
            info!(
                "Synced {}/{}: {} added, {} updated, {} removed",
                account.id, mailbox, outcome.added, outcome.updated, outcome.removed
            );
        }
        Ok(outcome)
    }

    /// Fetch one raw body, cache-first. A remote fetch stores the body and
    /// trims the body cache back under its byte budget.
    pub async fn fetch_body(&self, account: &AccountConfig, key: &MessageKey) -> Result<Vec<u8>> {
        if let Some(body) = self.cache.load_body(key)? {
            return Ok(body);
        }
        let mailbox = key.mailbox.clone();
        let uid = key.uid;
        let body = self
            .sessions
            .with_session(account, move |transport| {
                Box::pin(async move { transport.fetch_body(&mailbox, uid).await })
            })
            .await?;
        self.cache.store_body(key, &body)?;
        self.cache.evict_over_budget(self.body_budget_bytes)?;
        Ok(body)
    }
}

enum Role {
    Leader(watch::Sender<Option<Result<SyncOutcome>>>),
    Follower(watch::Receiver<Option<Result<SyncOutcome>>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialSource, SecurityMode, SessionSettings};
    use crate::transport::{MailConnector, MailTransport, RemoteHeader};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_account() -> AccountConfig {
        AccountConfig {
            id: "acct".into(),
            email: "me@example.com".into(),
            host: "mail.example.com".into(),
            port: 993,
            security: SecurityMode::Tls,
            user: None,
            password: CredentialSource::Raw("pw".into()),
        }
    }

    fn remote(uid: u32, subject: &str) -> RemoteHeader {
        RemoteHeader {
            uid,
            subject: subject.to_string(),
            from: "sender@example.com".to_string(),
            date: String::new(),
            flags: vec![],
        }
    }

    /// Shared fake server: scripted header set plus behavior knobs.
    struct FakeServer {
        headers: Vec<RemoteHeader>,
        token: SyncToken,
        /// Return ResyncRequired this many times before succeeding.
        resync_demands: AtomicUsize,
        /// Fail with a network error this many times before succeeding.
        network_failures: AtomicUsize,
        list_calls: AtomicUsize,
        list_delay: Duration,
        bodies: HashMap<u32, Vec<u8>>,
        body_fetches: AtomicUsize,
    }

    impl FakeServer {
        fn new(headers: Vec<RemoteHeader>) -> Arc<Self> {
            Arc::new(Self {
                headers,
                token: SyncToken {
                    uidvalidity: 1,
                    uidnext: 100,
                    modseq: 10,
                },
                resync_demands: AtomicUsize::new(0),
                network_failures: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                list_delay: Duration::ZERO,
                bodies: HashMap::new(),
                body_fetches: AtomicUsize::new(0),
            })
        }
    }

    struct FakeTransport {
        server: Arc<FakeServer>,
    }

    #[async_trait]
    impl MailTransport for FakeTransport {
        async fn list_headers(
            &mut self,
            _mailbox: &str,
            since: Option<&SyncToken>,
        ) -> Result<HeaderDelta> {
            self.server.list_calls.fetch_add(1, Ordering::SeqCst);
            if !self.server.list_delay.is_zero() {
                tokio::time::sleep(self.server.list_delay).await;
            }
            let _ = since;
            if self
                .server
                .network_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MailError::Network("connection reset".to_string()));
            }
            if self
                .server
                .resync_demands
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MailError::ResyncRequired);
            }
            Ok(HeaderDelta::Full {
                headers: self.server.headers.clone(),
                token: self.server.token,
            })
        }

        async fn fetch_body(&mut self, _mailbox: &str, uid: u32) -> Result<Vec<u8>> {
            self.server.body_fetches.fetch_add(1, Ordering::SeqCst);
            self.server
                .bodies
                .get(&uid)
                .cloned()
                .ok_or_else(|| MailError::NotFound(format!("no message with uid {}", uid)))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeConnector {
        server: Arc<FakeServer>,
    }

    #[async_trait]
    impl MailConnector for FakeConnector {
        async fn connect(&self, _account: &AccountConfig) -> Result<Box<dyn MailTransport>> {
            Ok(Box::new(FakeTransport {
                server: Arc::clone(&self.server),
            }))
        }
    }

    fn engine_for(server: Arc<FakeServer>) -> Arc<SyncEngine> {
        engine_with_cache(server, Arc::new(HeaderCache::in_memory().unwrap()))
    }

    fn engine_with_cache(server: Arc<FakeServer>, cache: Arc<HeaderCache>) -> Arc<SyncEngine> {
        let sessions = SessionManager::new(
            Arc::new(FakeConnector { server }),
            SessionSettings::default(),
        );
        Arc::new(SyncEngine::new(cache, sessions, 1024 * 1024))
    }

    #[tokio::test]
    async fn test_first_sync_populates_cache() {
        let server = FakeServer::new(vec![remote(1, "a"), remote(2, "b"), remote(3, "c")]);
        let engine = engine_for(server);
        let account = test_account();

        let outcome = engine.sync(&account, "INBOX").await.unwrap();
        assert_eq!(outcome.added, 3);

        let headers = engine.list_headers(&account.id, "INBOX").unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].uid, 3);
    }

    #[tokio::test]
    async fn test_resync_demand_triggers_exactly_one_retry() {
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_for(Arc::clone(&server));
        let account = test_account();

        // Seed a token, then make the server reject it once.
        engine.sync(&account, "INBOX").await.unwrap();
        server.resync_demands.store(1, Ordering::SeqCst);
        server.list_calls.store(0, Ordering::SeqCst);

        let outcome = engine.sync(&account, "INBOX").await.unwrap();
        // Cache was cleared, so the full re-enumeration re-adds everything.
        assert_eq!(outcome.added, 1);
        assert_eq!(server.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_resync_demand_fails_without_looping() {
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_for(Arc::clone(&server));
        let account = test_account();

        engine.sync(&account, "INBOX").await.unwrap();
        // The server keeps demanding a resync even after the full
        // re-enumeration attempt; the engine must give up, not loop.
        server.resync_demands.store(usize::MAX, Ordering::SeqCst);
        server.list_calls.store(0, Ordering::SeqCst);

        let err = engine.sync(&account, "INBOX").await.unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)));
        assert_eq!(server.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_syncs_coalesce() {
        let mut server = FakeServer::new(vec![remote(1, "a")]);
        Arc::get_mut(&mut server).unwrap().list_delay = Duration::from_millis(200);
        let engine = engine_for(Arc::clone(&server));
        let account = test_account();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                engine.sync(&account, "INBOX").await
            }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.added, 1);
        }
        assert_eq!(server.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_token_triggers_full_resync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = Arc::new(HeaderCache::new(&path).unwrap());
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_with_cache(Arc::clone(&server), Arc::clone(&cache));
        let account = test_account();

        engine.sync(&account, "INBOX").await.unwrap();

        // Mangle the persisted token behind the cache's back.
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE sync_state SET token = 'not-a-token'", [])
            .unwrap();
        drop(conn);

        let outcome = engine.sync(&account, "INBOX").await.unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(engine.list_headers(&account.id, "INBOX").unwrap().len(), 1);
        assert!(cache.sync_token(&account.id, "INBOX").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_flags_column_triggers_full_resync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = Arc::new(HeaderCache::new(&path).unwrap());
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_with_cache(Arc::clone(&server), Arc::clone(&cache));
        let account = test_account();

        engine.sync(&account, "INBOX").await.unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE headers SET flags = 'not json'", [])
            .unwrap();
        drop(conn);

        // The corrupt read clears the mailbox instead of failing the caller.
        assert!(engine.list_headers(&account.id, "INBOX").unwrap().is_empty());
        assert!(cache.sync_token(&account.id, "INBOX").unwrap().is_none());

        // The next sync is a full enumeration that restores the mailbox.
        let outcome = engine.sync(&account, "INBOX").await.unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(engine.list_headers(&account.id, "INBOX").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_not_advanced_when_sync_fails() {
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_for(Arc::clone(&server));
        let account = test_account();

        engine.sync(&account, "INBOX").await.unwrap();
        let before = engine.cache.sync_token(&account.id, "INBOX").unwrap();

        server.network_failures.store(1, Ordering::SeqCst);
        let err = engine.sync(&account, "INBOX").await.unwrap_err();
        assert!(matches!(err, MailError::Network(_)));
        assert_eq!(
            engine.cache.sync_token(&account.id, "INBOX").unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn test_body_fetch_is_cache_first() {
        let mut server = FakeServer::new(vec![remote(1, "a")]);
        Arc::get_mut(&mut server)
            .unwrap()
            .bodies
            .insert(1, b"hello".to_vec());
        let engine = engine_for(Arc::clone(&server));
        let account = test_account();
        let key = MessageKey::new("acct", "INBOX", 1);

        let first = engine.fetch_body(&account, &key).await.unwrap();
        let second = engine.fetch_body(&account, &key).await.unwrap();
        assert_eq!(first, b"hello");
        assert_eq!(second, b"hello");
        assert_eq!(server.body_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_body_surfaces_not_found() {
        let server = FakeServer::new(vec![remote(1, "a")]);
        let engine = engine_for(server);
        let account = test_account();
        let key = MessageKey::new("acct", "INBOX", 42);

        let err = engine.fetch_body(&account, &key).await.unwrap_err();
        assert!(matches!(err, MailError::NotFound(_)));
    }
}
