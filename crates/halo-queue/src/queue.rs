use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use halo_core::{PanelId, QueuedMessageId, RealtimeError, TrackingId};

use crate::store::{QueueStore, QueuedMessage};

/// Retry cadence and attempt budget for the outbound queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// How often the background loop scans the queue.
    pub tick_interval: Duration,
    /// Minimum gap between attempts on one entry.
    pub retry_gap: Duration,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            retry_gap: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Delivery seam: the queue hands each attempt to the stream correlator.
/// A confirmed send returns the tracking id; `None` or an error counts as
/// a failed attempt.
#[async_trait]
pub trait QueueSender: Send + Sync + 'static {
    async fn send_queued(
        &self,
        message: &QueuedMessage,
    ) -> Result<Option<TrackingId>, RealtimeError>;
}

type FailureCallback = Arc<dyn Fn(QueuedMessage) + Send + Sync>;

/// Buffers messages that could not be confirmed sent, persists them
/// across reloads, and retries with bounded attempts. Best-effort
/// delivery: an entry is dequeued on the first confirmed send, or
/// removed with exactly one failure notification once its attempt budget
/// is spent.
pub struct OutboundQueue {
    store: QueueStore,
    sender: Arc<dyn QueueSender>,
    config: QueueConfig,
    entries: Mutex<Vec<QueuedMessage>>,
    on_failure: RwLock<Option<FailureCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundQueue {
    /// Rehydrates any entries the previous session left behind.
    pub fn new(store: QueueStore, sender: Arc<dyn QueueSender>, config: QueueConfig) -> Self {
        let entries = store.load();
        if !entries.is_empty() {
            debug!(count = entries.len(), "queue rehydrated from storage");
        }
        Self {
            store,
            sender,
            config,
            entries: Mutex::new(entries),
            on_failure: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Terminal-failure notification, invoked exactly once per abandoned
    /// message.
    pub fn set_on_failure(&self, callback: FailureCallback) {
        *self.on_failure.write() = Some(callback);
    }

    pub fn enqueue(&self, panel_id: &PanelId, content: &str, metadata: Value) -> QueuedMessageId {
        let message = QueuedMessage::new(
            panel_id.clone(),
            content.to_string(),
            metadata,
            self.config.max_attempts,
        );
        let id = message.id.clone();
        {
            let mut entries = self.entries.lock();
            entries.push(message);
            self.persist(&entries);
        }
        debug!(queued_message_id = %id, panel_id = %panel_id, "message queued");
        id
    }

    /// Start the background retry loop.
    pub fn start(self: Arc<Self>) {
        let queue = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.tick_interval);
            ticker.tick().await; // consume first immediate tick
            loop {
                ticker.tick().await;
                queue.process_tick().await;
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<QueuedMessage> {
        self.entries.lock().clone()
    }

    /// One scan over the queue: abandon exhausted entries, retry the ones
    /// that are due, dequeue on confirmed sends.
    pub async fn process_tick(&self) {
        let abandoned: Vec<QueuedMessage> = {
            let mut entries = self.entries.lock();
            let mut abandoned = Vec::new();
            entries.retain(|m| {
                if m.exhausted() {
                    abandoned.push(m.clone());
                    false
                } else {
                    true
                }
            });
            if !abandoned.is_empty() {
                self.persist(&entries);
            }
            abandoned
        };
        for message in abandoned {
            warn!(
                queued_message_id = %message.id,
                attempts = message.attempts,
                "message abandoned after exhausting attempts"
            );
            let callback = self.on_failure.read().clone();
            if let Some(callback) = callback {
                callback(message);
            }
        }

        let due: Vec<QueuedMessage> = {
            let now = Utc::now();
            let gap = chrono::Duration::from_std(self.config.retry_gap)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
            self.entries
                .lock()
                .iter()
                .filter(|m| match m.last_attempt_at {
                    Some(last) => now - last >= gap,
                    None => true,
                })
                .cloned()
                .collect()
        };

        for message in due {
            let outcome = self.sender.send_queued(&message).await;
            let mut entries = self.entries.lock();
            let Some(pos) = entries.iter().position(|m| m.id == message.id) else {
                continue;
            };
            match outcome {
                Ok(Some(tracking_id)) => {
                    debug!(
                        queued_message_id = %message.id,
                        tracking_id = %tracking_id,
                        "queued message delivered"
                    );
                    entries.remove(pos);
                }
                Ok(None) => {
                    entries[pos].attempts += 1;
                    entries[pos].last_attempt_at = Some(Utc::now());
                }
                Err(e) => {
                    warn!(
                        queued_message_id = %message.id,
                        attempt = entries[pos].attempts + 1,
                        error = %e,
                        "queued send attempt failed"
                    );
                    entries[pos].attempts += 1;
                    entries[pos].last_attempt_at = Some(Utc::now());
                }
            }
            self.persist(&entries);
        }
    }

    fn persist(&self, entries: &[QueuedMessage]) {
        if let Err(e) = self.store.save(entries) {
            warn!(error = %e, "queue persistence failed");
        }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
