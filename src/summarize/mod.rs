//! Local summarization engine
//!
//! Turns message text into a short summary via the local inference backend.
//! Concurrency is capped to what the local model can sustain; callers past
//! the queue limit get `Busy` immediately instead of piling up. Each request
//! runs under a hard deadline and can be cancelled from outside.

pub mod ollama;

pub use ollama::{InferenceClient, OllamaClient};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::config::SummarizerSettings;
use crate::types::error::{MailError, Result};
use crate::types::{MessageKey, SummaryResult};

const SYSTEM_PROMPT: &str = "Summarize this email concisely. Reply with the summary only.";

/// One unit of work for the engine.
#[derive(Debug, Clone)]
pub struct SummarizeRequest {
    /// Message identity, when the text came from a cached message.
    pub key: Option<MessageKey>,
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl SummarizeRequest {
    /// Free-form text with no message identity attached.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            key: None,
            from: String::new(),
            subject: String::new(),
            body: text.into(),
        }
    }
}

/// Lifecycle of one request, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Requested,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

fn transition(request: &SummarizeRequest, from: JobState, to: JobState) {
    match &request.key {
        Some(key) => debug!("Summarize {}: {:?} -> {:?}", key, from, to),
        None => debug!("Summarize <text>: {:?} -> {:?}", from, to),
    }
}

pub struct SummarizeEngine {
    client: Arc<dyn InferenceClient>,
    max_input_bytes: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_queue: usize,
}

/// Releases a queue slot when a waiting request resolves either way.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolve only when the caller asks for cancellation. A dropped sender
/// means "no cancellation", not "cancel".
async fn cancel_requested(rx: Option<oneshot::Receiver<()>>) {
    if let Some(rx) = rx {
        if rx.await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Cut at a char boundary at or below `max` bytes.
fn truncate_input(s: &str, max: usize) -> (&str, bool) {
    if s.len() <= max {
        return (s, false);
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}

impl SummarizeEngine {
    pub fn new(client: Arc<dyn InferenceClient>, settings: &SummarizerSettings) -> Self {
        Self {
            client,
            max_input_bytes: settings.max_input_bytes,
            timeout: Duration::from_secs(settings.timeout_secs),
            permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            waiting: AtomicUsize::new(0),
            max_queue: settings.max_queue,
        }
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// Summarize one request. `cancel` (when provided) aborts the request
    /// from outside; the engine then reports `Cancelled`.
    pub async fn summarize(
        &self,
        request: SummarizeRequest,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<SummaryResult> {
        let (prompt, truncated) = self.build_prompt(&request)?;

        let _permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // All workers busy; wait only if the queue has room.
                let admitted = self
                    .waiting
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < self.max_queue).then_some(n + 1)
                    })
                    .is_ok();
                if !admitted {
                    warn!("Summarizer queue full, rejecting request");
                    return Err(MailError::Busy);
                }
                let _slot = QueueSlot(&self.waiting);
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| MailError::Internal("summarizer shut down".to_string()))?
            }
        };

        // Verify the configured model actually exists before burning the
        // request's deadline on a doomed completion call.
        let models = self.client.list_models().await?;
        let model = self.client.model_name();
        if !models.iter().any(|m| m == model) {
            return Err(MailError::ModelUnavailable(format!(
                "model {:?} is not installed",
                model
            )));
        }

        transition(&request, JobState::Requested, JobState::Running);
        let deadline = self.timeout;
        let result = tokio::select! {
            _ = cancel_requested(cancel) => {
                transition(&request, JobState::Running, JobState::Cancelled);
                return Err(MailError::Cancelled);
            }
            outcome = tokio::time::timeout(deadline, self.client.generate(SYSTEM_PROMPT, &prompt)) => {
                match outcome {
                    Err(_) => {
                        transition(&request, JobState::Running, JobState::TimedOut);
                        return Err(MailError::ModelTimeout(deadline.as_secs()));
                    }
                    Ok(Err(MailError::ModelTimeout(_))) => {
                        transition(&request, JobState::Running, JobState::TimedOut);
                        return Err(MailError::ModelTimeout(deadline.as_secs()));
                    }
                    Ok(Err(e)) => {
                        transition(&request, JobState::Running, JobState::Failed);
                        return Err(e);
                    }
                    Ok(Ok(text)) => text,
                }
            }
        };

        transition(&request, JobState::Running, JobState::Completed);
        Ok(SummaryResult {
            key: request.key,
            text: result.trim().to_string(),
            model_name: model.to_string(),
            produced_at: chrono::Utc::now(),
            truncated,
        })
    }

    fn build_prompt(&self, request: &SummarizeRequest) -> Result<(String, bool)> {
        if request.body.trim().is_empty() && request.subject.trim().is_empty() {
            return Err(MailError::EmptyInput);
        }
        let (body, truncated) = truncate_input(&request.body, self.max_input_bytes);
        let mut prompt = String::new();
        if !request.from.is_empty() {
            prompt.push_str(&format!("From: {}\n", request.from));
        }
        if !request.subject.is_empty() {
            prompt.push_str(&format!("Subject: {}\n", request.subject));
        }
        if !prompt.is_empty() {
            prompt.push('\n');
        }
        prompt.push_str(body);
        Ok((prompt, truncated))
    }
}
