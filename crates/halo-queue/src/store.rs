use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use halo_core::{PanelId, QueuedMessageId};

/// One message awaiting confirmed delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: QueuedMessageId,
    pub panel_id: PanelId,
    pub content: String,
    pub metadata: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(panel_id: PanelId, content: String, metadata: Value, max_attempts: u32) -> Self {
        Self {
            id: QueuedMessageId::new(),
            panel_id,
            content,
            metadata,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Durable backing for the outbound queue: one JSON file holding the
/// serialized array, overwritten wholesale on every mutation and
/// rehydrated at start-up. Absent on first run. Last writer wins; there
/// are no partial updates.
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted entries. A missing or unreadable file reads as
    /// an empty queue; a corrupt one is logged and discarded rather than
    /// wedging start-up.
    pub fn load(&self) -> Vec<QueuedMessage> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt queue file discarded");
                Vec::new()
            }
        }
    }

    pub fn save(&self, entries: &[QueuedMessage]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)
    }
}
