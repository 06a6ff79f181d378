//! Shared data model: message keys, cached headers, sync outcomes.

pub mod error;

pub use error::{MailError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite key identifying one message across accounts and mailboxes.
///
/// The UID alone is only unique within (account, mailbox); everything that
/// persists or caches message data keys by the full triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub account_id: String,
    pub mailbox: String,
    pub uid: u32,
}

impl MessageKey {
    pub fn new(account_id: impl Into<String>, mailbox: impl Into<String>, uid: u32) -> Self {
        Self {
            account_id: account_id.into(),
            mailbox: mailbox.into(),
            uid,
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.mailbox, self.uid)
    }
}

/// Cached message header.
///
/// Created on first sync observation; only `flags` and `summarized` mutate
/// afterwards. Removed when the server reports the UID expunged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub account_id: String,
    pub mailbox: String,
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub flags: Vec<String>,
    pub summarized: bool,
}

impl MessageHeader {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.account_id.clone(), self.mailbox.clone(), self.uid)
    }
}

/// Header record as exposed to the UI layer.
///
/// `id` maps to the protocol UID and is stable across calls for the same
/// message; the composite key is carried alongside for callers that need
/// cross-account identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderView {
    pub id: u32,
    pub account_id: String,
    pub mailbox: String,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub summarized: bool,
}

impl From<MessageHeader> for HeaderView {
    fn from(h: MessageHeader) -> Self {
        Self {
            id: h.uid,
            account_id: h.account_id,
            mailbox: h.mailbox,
            subject: h.subject,
            from: h.from,
            date: h.date,
            summarized: h.summarized,
        }
    }
}

/// Result of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
}

impl SyncOutcome {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Outcome of one summarization request. Ephemeral; recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub key: Option<MessageKey>,
    pub text: String,
    pub model_name: String,
    pub produced_at: DateTime<Utc>,
    pub truncated: bool,
}
