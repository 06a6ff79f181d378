//! Mail retrieval and local summarization service
//!
//! Backend for a desktop mail reader:
//! - IMAP-subset transport with TLS/STARTTLS and pooled sessions
//! - SQLite header/body cache kept consistent by a token-based sync engine
//! - Local LLM summarization through an Ollama-compatible endpoint
//! - A facade (`MailService`) exposing the operations a frontend needs
//!
//! All mail content stays on the local machine; summarization talks only to
//! a locally running model.

pub mod cache;
pub mod config;
pub mod service;
pub mod session;
pub mod summarize;
pub mod transport;
pub mod types;

pub use config::ServiceConfig;
pub use service::{MailService, UiError, UiResult};
pub use types::error::{MailError, Result};
pub use types::{HeaderView, MessageKey, SummaryResult};
