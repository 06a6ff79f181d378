//! SQLite header/body cache
//!
//! Cheap queryable copy of remote mailbox state: header rows keyed by
//! (account_id, mailbox, uid), one sync token per mailbox, and raw bodies
//! under an LRU byte budget. Every reconciliation runs in a single
//! transaction so the token only advances together with the rows it
//! describes.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::{RemoteHeader, SyncToken};
use crate::types::error::{MailError, Result};
use crate::types::{MessageHeader, MessageKey, SyncOutcome};

pub type DbPool = Pool<SqliteConnectionManager>;

fn tune(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        -- Header cache (authoritative copy of server-reported state)
        CREATE TABLE IF NOT EXISTS headers (
            account_id   TEXT NOT NULL,
            mailbox      TEXT NOT NULL,
            uid          INTEGER NOT NULL,
            subject      TEXT NOT NULL DEFAULT '',
            from_addr    TEXT NOT NULL DEFAULT '',
            date         TEXT NOT NULL DEFAULT '',
            flags        TEXT NOT NULL DEFAULT '[]',  -- JSON array
            summarized   INTEGER NOT NULL DEFAULT 0,
            created_at   INTEGER NOT NULL,            -- unix epoch ms
            updated_at   INTEGER NOT NULL,
            PRIMARY KEY (account_id, mailbox, uid)
        );

        CREATE INDEX IF NOT EXISTS idx_headers_mailbox
        ON headers(account_id, mailbox, uid DESC);

        -- One sync token per mailbox; absent until the first successful sync
        CREATE TABLE IF NOT EXISTS sync_state (
            account_id   TEXT NOT NULL,
            mailbox      TEXT NOT NULL,
            token        TEXT NOT NULL,
            last_sync    INTEGER NOT NULL,            -- unix epoch ms
            PRIMARY KEY (account_id, mailbox)
        );

        -- Raw bodies, LRU-evicted past the byte budget
        CREATE TABLE IF NOT EXISTS bodies (
            account_id   TEXT NOT NULL,
            mailbox      TEXT NOT NULL,
            uid          INTEGER NOT NULL,
            content      BLOB NOT NULL,
            byte_len     INTEGER NOT NULL,
            last_access  INTEGER NOT NULL,            -- unix epoch ms
            PRIMARY KEY (account_id, mailbox, uid)
        );
        ",
    )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn flags_to_json(flags: &[String]) -> String {
    serde_json::to_string(flags).unwrap_or_else(|_| "[]".to_string())
}

fn flags_from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| MailError::CacheCorruption(format!("bad flags column: {}", e)))
}

/// The local cache. Cheap to clone behind an `Arc`; all methods take `&self`.
pub struct HeaderCache {
    pool: DbPool,
    /// Bodies exempt from eviction while a summarization is in flight.
    pinned: Mutex<HashSet<MessageKey>>,
}

impl HeaderCache {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| MailError::Database(format!("failed to create cache dir: {}", e)))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(tune);
        Self::build(manager)
    }

    /// In-memory cache for tests. A single pooled connection keeps every
    /// caller on the same database.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(tune);
        let pool = Pool::builder().max_size(1).build(manager)?;
        let conn = pool.get()?;
        initialize_schema(&conn)?;
        drop(conn);
        Ok(Self {
            pool,
            pinned: Mutex::new(HashSet::new()),
        })
    }

    fn build(manager: SqliteConnectionManager) -> Result<Self> {
        let pool = Pool::builder().max_size(8).build(manager)?;
        let conn = pool.get()?;
        initialize_schema(&conn)?;
        drop(conn);
        info!("Header cache ready");
        Ok(Self {
            pool,
            pinned: Mutex::new(HashSet::new()),
        })
    }

    /// Headers for one mailbox, newest UID first.
    pub fn list_headers(&self, account_id: &str, mailbox: &str) -> Result<Vec<MessageHeader>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT uid, subject, from_addr, date, flags, summarized
             FROM headers WHERE account_id = ?1 AND mailbox = ?2
             ORDER BY uid DESC",
        )?;
        let rows = stmt.query_map(params![account_id, mailbox], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut headers = Vec::new();
        for row in rows {
            let (uid, subject, from, date, flags_raw, summarized) = row?;
            headers.push(MessageHeader {
                account_id: account_id.to_string(),
                mailbox: mailbox.to_string(),
                uid,
                subject,
                from,
                date,
                flags: flags_from_json(&flags_raw)?,
                summarized,
            });
        }
        Ok(headers)
    }

    pub fn get_header(&self, key: &MessageKey) -> Result<Option<MessageHeader>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT subject, from_addr, date, flags, summarized
             FROM headers WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
            params![key.account_id, key.mailbox, key.uid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(subject, from, date, flags_raw, summarized)| {
            Ok(MessageHeader {
                account_id: key.account_id.clone(),
                mailbox: key.mailbox.clone(),
                uid: key.uid,
                subject,
                from,
                date,
                flags: flags_from_json(&flags_raw)?,
                summarized,
            })
        })
        .transpose()
    }

    /// The stored sync token, if any. An unparseable token is corruption.
    pub fn sync_token(&self, account_id: &str, mailbox: &str) -> Result<Option<SyncToken>> {
        let conn = self.pool.get()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT token FROM sync_state WHERE account_id = ?1 AND mailbox = ?2",
                params![account_id, mailbox],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| s.parse()).transpose()
    }

    /// Drop all cached state for one mailbox (headers, bodies, token).
    /// The next sync starts from scratch.
    pub fn clear_mailbox(&self, account_id: &str, mailbox: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM headers WHERE account_id = ?1 AND mailbox = ?2",
            params![account_id, mailbox],
        )?;
        tx.execute(
            "DELETE FROM bodies WHERE account_id = ?1 AND mailbox = ?2",
            params![account_id, mailbox],
        )?;
        tx.execute(
            "DELETE FROM sync_state WHERE account_id = ?1 AND mailbox = ?2",
            params![account_id, mailbox],
        )?;
        tx.commit()?;
        warn!("Cleared cached state for {}/{}", account_id, mailbox);
        Ok(())
    }

    /// Reconcile a full server enumeration: after this the cached UID set for
    /// the mailbox equals the server's. Runs in one transaction with the
    /// token update.
    pub fn reconcile_full(
        &self,
        account_id: &str,
        mailbox: &str,
        headers: &[RemoteHeader],
        token: &SyncToken,
    ) -> Result<SyncOutcome> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();
        let mut outcome = SyncOutcome::default();

        let server_uids: HashSet<u32> = headers.iter().map(|h| h.uid).collect();

        // Remove rows the server no longer reports.
        {
            let mut stmt = tx.prepare(
                "SELECT uid FROM headers WHERE account_id = ?1 AND mailbox = ?2",
            )?;
            let cached: Vec<u32> = stmt
                .query_map(params![account_id, mailbox], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            for uid in cached {
                if !server_uids.contains(&uid) {
                    tx.execute(
                        "DELETE FROM headers WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                        params![account_id, mailbox, uid],
                    )?;
                    tx.execute(
                        "DELETE FROM bodies WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                        params![account_id, mailbox, uid],
                    )?;
                    outcome.removed += 1;
                }
            }
        }

        for header in headers {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT flags FROM headers
                     WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                    params![account_id, mailbox, header.uid],
                    |row| row.get(0),
                )
                .optional()?;
            let flags_json = flags_to_json(&header.flags);
            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO headers
                           (account_id, mailbox, uid, subject, from_addr, date,
                            flags, summarized, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
                        params![
                            account_id,
                            mailbox,
                            header.uid,
                            header.subject,
                            header.from,
                            header.date,
                            flags_json,
                            now
                        ],
                    )?;
                    outcome.added += 1;
                }
                Some(old_flags) if old_flags != flags_json => {
                    tx.execute(
                        "UPDATE headers SET flags = ?4, updated_at = ?5
                         WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                        params![account_id, mailbox, header.uid, flags_json, now],
                    )?;
                    outcome.updated += 1;
                }
                Some(_) => {}
            }
        }

        Self::store_token(&tx, account_id, mailbox, token, now)?;
        tx.commit()?;
        debug!(
            "Full reconcile for {}/{}: +{} ~{} -{}",
            account_id, mailbox, outcome.added, outcome.updated, outcome.removed
        );
        Ok(outcome)
    }

    /// Apply a server delta. New-message inserts are idempotent: a UID the
    /// cache already holds counts as an update, not a duplicate.
    pub fn reconcile_changes(
        &self,
        account_id: &str,
        mailbox: &str,
        new: &[RemoteHeader],
        flag_updates: &[(u32, Vec<String>)],
        expunged: &[u32],
        token: &SyncToken,
    ) -> Result<SyncOutcome> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();
        let mut outcome = SyncOutcome::default();

        for header in new {
            let flags_json = flags_to_json(&header.flags);
            let existed: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM headers
                     WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                    params![account_id, mailbox, header.uid],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT INTO headers
                   (account_id, mailbox, uid, subject, from_addr, date,
                    flags, summarized, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
                 ON CONFLICT(account_id, mailbox, uid) DO UPDATE SET
                   subject = excluded.subject,
                   from_addr = excluded.from_addr,
                   date = excluded.date,
                   flags = excluded.flags,
                   updated_at = excluded.updated_at",
                params![
                    account_id,
                    mailbox,
                    header.uid,
                    header.subject,
                    header.from,
                    header.date,
                    flags_json,
                    now
                ],
            )?;
            if existed.is_some() {
                outcome.updated += 1;
            } else {
                outcome.added += 1;
            }
        }

        for (uid, flags) in flag_updates {
            let changed = tx.execute(
                "UPDATE headers SET flags = ?4, updated_at = ?5
                 WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3 AND flags != ?4",
                params![account_id, mailbox, uid, flags_to_json(flags), now],
            )?;
            outcome.updated += changed as u32;
        }

        for uid in expunged {
            let changed = tx.execute(
                "DELETE FROM headers WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![account_id, mailbox, uid],
            )?;
            tx.execute(
                "DELETE FROM bodies WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![account_id, mailbox, uid],
            )?;
            outcome.removed += changed as u32;
        }

        Self::store_token(&tx, account_id, mailbox, token, now)?;
        tx.commit()?;
        debug!(
            "Delta reconcile for {}/{}: +{} ~{} -{}",
            account_id, mailbox, outcome.added, outcome.updated, outcome.removed
        );
        Ok(outcome)
    }

    fn store_token(
        tx: &rusqlite::Transaction<'_>,
        account_id: &str,
        mailbox: &str,
        token: &SyncToken,
        now: i64,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO sync_state (account_id, mailbox, token, last_sync)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id, mailbox) DO UPDATE SET
               token = excluded.token,
               last_sync = excluded.last_sync",
            params![account_id, mailbox, token.to_string(), now],
        )?;
        Ok(())
    }

    pub fn mark_summarized(&self, key: &MessageKey) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE headers SET summarized = 1, updated_at = ?4
             WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
            params![key.account_id, key.mailbox, key.uid, now_ms()],
        )?;
        Ok(())
    }

    // --- bodies ---------------------------------------------------------

    pub fn store_body(&self, key: &MessageKey, content: &[u8]) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO bodies (account_id, mailbox, uid, content, byte_len, last_access)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id, mailbox, uid) DO UPDATE SET
               content = excluded.content,
               byte_len = excluded.byte_len,
               last_access = excluded.last_access",
            params![
                key.account_id,
                key.mailbox,
                key.uid,
                content,
                content.len() as i64,
                now_ms()
            ],
        )?;
        Ok(())
    }

    /// Load a cached body and bump its LRU clock.
    pub fn load_body(&self, key: &MessageKey) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get()?;
        let body: Option<Vec<u8>> = conn
            .query_row(
                "SELECT content FROM bodies
                 WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![key.account_id, key.mailbox, key.uid],
                |row| row.get(0),
            )
            .optional()?;
        if body.is_some() {
            conn.execute(
                "UPDATE bodies SET last_access = ?4
                 WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![key.account_id, key.mailbox, key.uid, now_ms()],
            )?;
        }
        Ok(body)
    }

    /// Evict least-recently-used bodies until total size fits the budget.
    /// Pinned bodies are never evicted.
    pub fn evict_over_budget(&self, budget_bytes: u64) -> Result<usize> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_len), 0) FROM bodies",
            [],
            |row| row.get(0),
        )?;
        let mut excess = (total as u64).saturating_sub(budget_bytes);
        if excess == 0 {
            return Ok(0);
        }

        let candidates: Vec<(String, String, u32, u64)> = {
            let mut stmt = conn.prepare(
                "SELECT account_id, mailbox, uid, byte_len
                 FROM bodies ORDER BY last_access ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)? as u64,
                ))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let pinned = self.pinned.lock().expect("pin lock poisoned");
        let mut evicted = 0usize;
        for (account_id, mailbox, uid, byte_len) in candidates {
            if excess == 0 {
                break;
            }
            let key = MessageKey {
                account_id: account_id.clone(),
                mailbox: mailbox.clone(),
                uid,
            };
            if pinned.contains(&key) {
                continue;
            }
            conn.execute(
                "DELETE FROM bodies WHERE account_id = ?1 AND mailbox = ?2 AND uid = ?3",
                params![account_id, mailbox, uid],
            )?;
            excess = excess.saturating_sub(byte_len);
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Evicted {} cached bodies over budget", evicted);
        }
        Ok(evicted)
    }

    /// Exempt a body from eviction while it is in use.
    pub fn pin_body(&self, key: &MessageKey) {
        self.pinned
            .lock()
            .expect("pin lock poisoned")
            .insert(key.clone());
    }

    pub fn unpin_body(&self, key: &MessageKey) {
        self.pinned.lock().expect("pin lock poisoned").remove(key);
    }
}
