//! Mail transport: protocol client, response parsing, socket plumbing.
//!
//! The transport speaks an IMAP subset to one remote mailbox server. All
//! operations on one client are `&mut self` - the protocol is half-duplex
//! per connection, so exchanges are strictly sequential by construction.

pub mod client;
pub mod parser;
pub mod stream;

pub use client::{NetConnector, TransportClient};

use async_trait::async_trait;
use std::str::FromStr;

use crate::config::AccountConfig;
use crate::types::error::{MailError, Result};

/// Opaque mailbox state marker.
///
/// `uidvalidity` detects mailbox recreation (all UIDs invalid),
/// `uidnext`/`modseq` bound the delta the server is asked for. Treated as
/// opaque outside the transport; persisted via `Display`/`FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncToken {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub modseq: u64,
}

impl std::fmt::Display for SyncToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.uidvalidity, self.uidnext, self.modseq)
    }
}

impl FromStr for SyncToken {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let parse = |part: Option<&str>| -> Option<u64> { part?.parse().ok() };
        match (
            parse(parts.next()),
            parse(parts.next()),
            parse(parts.next()),
            parts.next(),
        ) {
            (Some(v), Some(n), Some(m), None) if v <= u32::MAX as u64 && n <= u32::MAX as u64 => {
                Ok(SyncToken {
                    uidvalidity: v as u32,
                    uidnext: n as u32,
                    modseq: m,
                })
            }
            _ => Err(MailError::CacheCorruption(format!(
                "unparseable sync token: {:?}",
                s
            ))),
        }
    }
}

/// One message header as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHeader {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub flags: Vec<String>,
}

/// Server-reported mailbox state, either a full enumeration or a delta
/// relative to the token the caller supplied.
#[derive(Debug, Clone)]
pub enum HeaderDelta {
    /// Complete header enumeration; the cache's UID set must end up equal
    /// to this set.
    Full {
        headers: Vec<RemoteHeader>,
        token: SyncToken,
    },
    /// Changes since the supplied token.
    Changes {
        new: Vec<RemoteHeader>,
        flag_updates: Vec<(u32, Vec<String>)>,
        expunged: Vec<u32>,
        token: SyncToken,
    },
}

impl HeaderDelta {
    pub fn token(&self) -> SyncToken {
        match self {
            HeaderDelta::Full { token, .. } => *token,
            HeaderDelta::Changes { token, .. } => *token,
        }
    }
}

/// Protocol operations against one live connection.
#[async_trait]
pub trait MailTransport: Send {
    /// List headers for `mailbox`. With no token (or a token the server can
    /// no longer serve a delta for) this is a full enumeration; with a
    /// current token only the delta is requested. A token whose uidvalidity
    /// the server no longer recognizes surfaces as `ResyncRequired`.
    async fn list_headers(&mut self, mailbox: &str, since: Option<&SyncToken>)
        -> Result<HeaderDelta>;

    /// Fetch the raw message body for one UID.
    async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>>;

    /// Log out and drop the connection. Best-effort.
    async fn close(&mut self) -> Result<()>;
}

/// Opens authenticated transports. The seam the session manager (and tests)
/// plug into.
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn MailTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = SyncToken {
            uidvalidity: 7,
            uidnext: 120,
            modseq: 991,
        };
        let parsed: SyncToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_token_rejects_garbage() {
        for bad in ["", "1:2", "1:2:3:4", "a:b:c", "1:2:x"] {
            let result: Result<SyncToken> = bad.parse();
            assert!(
                matches!(result, Err(MailError::CacheCorruption(_))),
                "accepted {:?}",
                bad
            );
        }
    }
}
