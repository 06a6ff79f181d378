//! Background sync scheduling
//!
//! Emits periodic poll triggers on a channel the service consumes. External
//! callers (UI refresh, tests) can inject targeted triggers through the same
//! channel; the scheduler itself only ticks.

use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::SyncSettings;

/// What the consumer should sync next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Scheduled pass: sync every configured mailbox of every account.
    Poll,
    /// Targeted sync of one mailbox.
    Mailbox { account_id: String, mailbox: String },
    /// Scheduler is stopping; the consumer loop should exit.
    Shutdown,
}

pub struct SyncScheduler {
    settings: SyncSettings,
    running: Arc<AtomicBool>,
    trigger_tx: Sender<SyncTrigger>,
}

impl SyncScheduler {
    pub fn new(settings: SyncSettings) -> (Self, Receiver<SyncTrigger>) {
        let (tx, rx) = flume::unbounded();
        let scheduler = Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            trigger_tx: tx,
        };
        (scheduler, rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark as running before spawning `run` to avoid racing the first tick.
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        info!("Stopping sync scheduler");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.trigger_tx.send(SyncTrigger::Shutdown);
    }

    /// Sender for externally-injected triggers (targeted refresh).
    pub fn trigger_sender(&self) -> Sender<SyncTrigger> {
        self.trigger_tx.clone()
    }

    /// Tick loop. Runs until `stop` is called.
    pub async fn run(&self) {
        let interval = tokio::time::Duration::from_secs(self.settings.interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the startup sync already ran.
        ticker.tick().await;

        info!("Sync scheduler started (interval: {:?})", interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            debug!("Scheduled sync tick");
            if let Err(e) = self.trigger_tx.send(SyncTrigger::Poll) {
                error!("Failed to send poll trigger: {}", e);
                break;
            }
        }
        info!("Sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            interval_secs: 1,
            mailboxes: vec!["INBOX".to_string()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_emits_poll_triggers() {
        let (scheduler, rx) = SyncScheduler::new(fast_settings());
        scheduler.mark_running();
        let scheduler = Arc::new(scheduler);
        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        // Paused time: advancing the clock drives the ticks.
        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert_eq!(rx.recv_async().await.unwrap(), SyncTrigger::Poll);

        scheduler.stop();
        runner.abort();
    }

    #[tokio::test]
    async fn test_stop_sends_shutdown() {
        let (scheduler, rx) = SyncScheduler::new(fast_settings());
        scheduler.mark_running();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(rx.recv_async().await.unwrap(), SyncTrigger::Shutdown);
    }

    #[tokio::test]
    async fn test_external_trigger_injection() {
        let (scheduler, rx) = SyncScheduler::new(fast_settings());
        let tx = scheduler.trigger_sender();
        tx.send(SyncTrigger::Mailbox {
            account_id: "a".to_string(),
            mailbox: "INBOX".to_string(),
        })
        .unwrap();
        match rx.recv_async().await.unwrap() {
            SyncTrigger::Mailbox { account_id, .. } => assert_eq!(account_id, "a"),
            other => panic!("unexpected trigger {:?}", other),
        }
    }
}
