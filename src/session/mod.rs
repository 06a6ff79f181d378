//! Session management
//!
//! Owns every live transport connection. Callers never hold a connection
//! across calls; they borrow one for the duration of a single closure via
//! `with_session`. Per-account pools cap concurrent connections (mail
//! servers ration them), reconnects back off exponentially, and idle
//! connections are reaped after a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, SessionSettings};
use crate::transport::{MailConnector, MailTransport};
use crate::types::error::{MailError, Result};

struct IdleConn {
    transport: Box<dyn MailTransport>,
    since: Instant,
}

/// Pool state for one account.
struct AccountPool {
    /// Caps live connections at `pool_size`.
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
}

impl AccountPool {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            idle: Mutex::new(Vec::new()),
        }
    }
}

/// Hands out pooled, authenticated sessions per account.
pub struct SessionManager {
    connector: Arc<dyn MailConnector>,
    settings: SessionSettings,
    pools: RwLock<HashMap<String, Arc<AccountPool>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn MailConnector>, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            connector,
            settings,
            pools: RwLock::new(HashMap::new()),
        })
    }

    async fn pool_for(&self, account_id: &str) -> Arc<AccountPool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(account_id) {
                return Arc::clone(pool);
            }
        }
        let mut pools = self.pools.write().await;
        Arc::clone(
            pools
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(AccountPool::new(self.settings.pool_size))),
        )
    }

    /// Connect with exponential backoff. Only transient network failures are
    /// retried; an authentication rejection surfaces immediately.
    async fn connect_with_backoff(&self, account: &AccountConfig) -> Result<Box<dyn MailTransport>> {
        let mut delay = Duration::from_millis(self.settings.retry_base_delay_ms);
        let cap = Duration::from_millis(self.settings.retry_max_delay_ms);
        let mut last_error = None;

        for attempt in 0..self.settings.retry_attempts.max(1) {
            if attempt > 0 {
                debug!(
                    "Reconnect attempt {} for account {} after {:?}",
                    attempt + 1,
                    account.id,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
            match self.connector.connect(account).await {
                Ok(transport) => return Ok(transport),
                Err(MailError::Network(msg)) => {
                    warn!("Connection to account {} failed: {}", account.id, msg);
                    last_error = Some(msg);
                }
                Err(other) => return Err(other),
            }
        }
        Err(MailError::Unavailable(format!(
            "account {} unreachable: {}",
            account.id,
            last_error.unwrap_or_default()
        )))
    }

    /// Borrow a session for one operation. Reuses an idle connection when one
    /// exists, otherwise dials. On a connection-level failure the session is
    /// discarded instead of being returned to the pool.
    pub async fn with_session<T, F>(&self, account: &AccountConfig, op: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(
                &'a mut dyn MailTransport,
            ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
    {
        let pool = self.pool_for(&account.id).await;
        let _permit = pool
            .semaphore
            .acquire()
            .await
            .map_err(|_| MailError::Internal("session pool closed".to_string()))?;

        let reused = {
            let mut idle = pool.idle.lock().expect("idle pool lock poisoned");
            idle.pop()
        };
        let mut transport = match reused {
            Some(conn) => {
                debug!("Reusing idle session for account {}", account.id);
                conn.transport
            }
            None => self.connect_with_backoff(account).await?,
        };

        let result = op(transport.as_mut()).await;

        match &result {
            // Connection-level failures poison the session.
            Err(MailError::Network(_)) | Err(MailError::Protocol(_))
            | Err(MailError::Unavailable(_)) => {
                let _ = transport.close().await;
            }
            _ => {
                let mut idle = pool.idle.lock().expect("idle pool lock poisoned");
                idle.push(IdleConn {
                    transport,
                    since: Instant::now(),
                });
            }
        }
        result
    }

    /// Close idle connections older than the idle timeout. Called from the
    /// reaper task.
    pub async fn reap_idle(&self) {
        let timeout = Duration::from_secs(self.settings.idle_timeout_secs);
        let pools: Vec<Arc<AccountPool>> = {
            let pools = self.pools.read().await;
            pools.values().cloned().collect()
        };
        for pool in pools {
            let expired: Vec<IdleConn> = {
                let mut idle = pool.idle.lock().expect("idle pool lock poisoned");
                let (keep, stale): (Vec<_>, Vec<_>) = idle
                    .drain(..)
                    .partition(|conn| conn.since.elapsed() < timeout);
                *idle = keep;
                stale
            };
            for mut conn in expired {
                debug!("Closing idle session (idle {:?})", conn.since.elapsed());
                let _ = conn.transport.close().await;
            }
        }
    }

    /// Spawn the idle reaper. Runs until the manager is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = Duration::from_secs((self.settings.idle_timeout_secs / 2).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => manager.reap_idle().await,
                    None => break,
                }
            }
        })
    }

    /// Close every pooled connection. Used at shutdown.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<AccountPool>> = {
            let pools = self.pools.read().await;
            pools.values().cloned().collect()
        };
        let mut closed = 0usize;
        for pool in pools {
            let conns: Vec<IdleConn> = {
                let mut idle = pool.idle.lock().expect("idle pool lock poisoned");
                idle.drain(..).collect()
            };
            for mut conn in conns {
                let _ = conn.transport.close().await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closed {} pooled sessions", closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialSource, SecurityMode};
    use crate::transport::{HeaderDelta, SyncToken};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_account() -> AccountConfig {
        AccountConfig {
            id: "test".into(),
            email: "me@example.com".into(),
            host: "mail.example.com".into(),
            port: 993,
            security: SecurityMode::Tls,
            user: None,
            password: CredentialSource::Raw("pw".into()),
        }
    }

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
            retry_attempts: 3,
            ..Default::default()
        }
    }

    struct StubTransport {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailTransport for StubTransport {
        async fn list_headers(
            &mut self,
            _mailbox: &str,
            _since: Option<&SyncToken>,
        ) -> Result<HeaderDelta> {
            Ok(HeaderDelta::Full {
                headers: vec![],
                token: SyncToken {
                    uidvalidity: 1,
                    uidnext: 1,
                    modseq: 0,
                },
            })
        }

        async fn fetch_body(&mut self, _mailbox: &str, _uid: u32) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubConnector {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
        fail_with_auth: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailConnector for StubConnector {
        async fn connect(&self, _account: &AccountConfig) -> Result<Box<dyn MailTransport>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_auth {
                return Err(MailError::Auth("credentials rejected".into()));
            }
            if attempt < self.fail_first {
                return Err(MailError::Network("connection refused".into()));
            }
            Ok(Box::new(StubTransport {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn test_retries_network_failures_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector {
            attempts: Arc::clone(&attempts),
            fail_first: 2,
            fail_with_auth: false,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let manager = SessionManager::new(connector, fast_settings());
        let result = manager
            .with_session(&test_account(), |t| {
                Box::pin(async move { t.fetch_body("INBOX", 1).await })
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector {
            attempts: Arc::clone(&attempts),
            fail_first: 0,
            fail_with_auth: true,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let manager = SessionManager::new(connector, fast_settings());
        let err = manager
            .with_session(&test_account(), |t| {
                Box::pin(async move { t.fetch_body("INBOX", 1).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Auth(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let connector = Arc::new(StubConnector {
            attempts: Arc::new(AtomicUsize::new(0)),
            fail_first: usize::MAX,
            fail_with_auth: false,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let manager = SessionManager::new(connector, fast_settings());
        let err = manager
            .with_session(&test_account(), |t| {
                Box::pin(async move { t.fetch_body("INBOX", 1).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_idle_session_is_reused() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector {
            attempts: Arc::clone(&attempts),
            fail_first: 0,
            fail_with_auth: false,
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let manager = SessionManager::new(connector, fast_settings());
        let account = test_account();
        for _ in 0..3 {
            manager
                .with_session(&account, |t| {
                    Box::pin(async move { t.fetch_body("INBOX", 1).await })
                })
                .await
                .unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_dropped_not_pooled() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector {
            attempts: Arc::clone(&attempts),
            fail_first: 0,
            fail_with_auth: false,
            closed: Arc::clone(&closed),
        });
        let manager = SessionManager::new(connector, fast_settings());
        let account = test_account();

        let err = manager
            .with_session(&account, |_t| {
                Box::pin(async move {
                    Err::<(), _>(MailError::Network("connection reset".into()))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Network(_)));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Next call must dial again.
        manager
            .with_session(&account, |t| {
                Box::pin(async move { t.fetch_body("INBOX", 1).await })
            })
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_all_drains_pools() {
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(StubConnector {
            attempts: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            fail_with_auth: false,
            closed: Arc::clone(&closed),
        });
        let manager = SessionManager::new(connector, fast_settings());
        manager
            .with_session(&test_account(), |t| {
                Box::pin(async move { t.fetch_body("INBOX", 1).await })
            })
            .await
            .unwrap();
        manager.close_all().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
