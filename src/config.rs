//! Service configuration
//!
//! Loaded once from TOML and passed into the service as an immutable value;
//! no component reads ambient global configuration. Credentials are held
//! behind `CredentialSource`, which never appears in logs or Debug output.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::error::MailError;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Accounts to serve, in config order.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub summarizer: SummarizerSettings,
}

/// One remote mailbox account. Immutable during a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier used as the cache key prefix.
    pub id: String,

    /// Email address (also the default login user).
    pub email: String,

    /// Mail server hostname.
    pub host: String,

    /// Mail server port (default: 993 for implicit TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub security: SecurityMode,

    /// Login user; defaults to the email address.
    pub user: Option<String>,

    pub password: CredentialSource,
}

impl AccountConfig {
    pub fn login_user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.email)
    }
}

// Credentials must never leak through Debug formatting.
impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection security for the mail transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Plain,
    #[default]
    Tls,
    Starttls,
}

/// Password source - raw value or command to execute (keychain integration).
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialSource {
    Raw(String),
    Command { command: String },
}

impl CredentialSource {
    /// Resolve the credential at connect time. The resolved secret is scoped
    /// to the session being opened and dropped with it.
    pub async fn resolve(&self) -> Result<String, MailError> {
        match self {
            CredentialSource::Raw(value) => Ok(value.clone()),
            CredentialSource::Command { command } => {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .await
                    .map_err(|e| MailError::Config(format!("credential command failed: {}", e)))?;
                if !output.status.success() {
                    return Err(MailError::Config(format!(
                        "credential command exited with {}",
                        output.status
                    )));
                }
                let secret = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                if secret.is_empty() {
                    return Err(MailError::Config(
                        "credential command produced no output".to_string(),
                    ));
                }
                Ok(secret)
            }
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialSource(<redacted>)")
    }
}

/// Header/body cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Byte budget for cached message bodies (LRU eviction past this).
    #[serde(default = "default_body_budget")]
    pub body_budget_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            body_budget_bytes: default_body_budget(),
        }
    }
}

/// Connection pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Connections per account (mail servers often charge per connection).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout applied to each protocol exchange.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Idle connections are closed after this long.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// First reconnect delay; doubles per attempt up to the cap.
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_cap")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_cap(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Background sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between scheduled sync passes.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Mailboxes to sync per account.
    #[serde(default = "default_mailboxes")]
    pub mailboxes: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            mailboxes: default_mailboxes(),
        }
    }
}

/// Local inference settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerSettings {
    /// Base URL of the local inference process.
    #[serde(default = "default_ollama_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Hard cap on prompt body size; larger bodies are truncated.
    #[serde(default = "default_max_input")]
    pub max_input_bytes: usize,

    #[serde(default = "default_summarize_timeout")]
    pub timeout_secs: u64,

    /// Concurrent inference calls the local model can sustain.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Requests allowed to wait for a worker before `Busy` is returned.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_model(),
            max_input_bytes: default_max_input(),
            timeout_secs: default_summarize_timeout(),
            concurrency: default_concurrency(),
            max_queue: default_max_queue(),
        }
    }
}

fn default_port() -> u16 {
    993
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsum")
        .join("cache.db")
}

fn default_body_budget() -> u64 {
    32 * 1024 * 1024
}

fn default_pool_size() -> usize {
    1
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_retry_base() -> u64 {
    1000
}

fn default_retry_cap() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_sync_interval() -> u64 {
    300
}

fn default_mailboxes() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_max_input() -> usize {
    16 * 1024
}

fn default_summarize_timeout() -> u64 {
    60
}

fn default_concurrency() -> usize {
    1
}

fn default_max_queue() -> usize {
    8
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, MailError> {
        info!("Loading configuration from: {:?}", path);
        let content = fs::read_to_string(path)
            .map_err(|e| MailError::Config(format!("failed to read config: {}", e)))?;
        let config: ServiceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Default config file locations, checked in order.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("mailsum").join("config.toml"));
        }
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".config").join("mailsum").join("config.toml"));
        }
        paths
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }
}
