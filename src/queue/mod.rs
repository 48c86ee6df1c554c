//! Durable per-session message queues.
//!
//! Each session has an append-only event log (`queue.jsonl`) with two
//! record kinds: `enqueue` and `status`. In-memory state is rebuilt by
//! replaying the log in order; items sort by position ascending, and
//! later status records override status, sent-at, error, and (for
//! requeue-at-head) position. The log is never rewritten; history of
//! sent/failed/cancelled items survives for inspection and requeue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{LegionError, Result};
use crate::storage;
use crate::utils::unix_timestamp;

/// Delivery status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

/// A queued message waiting to be delivered to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: String,
    pub session_id: String,
    pub content: String,
    pub reset_session: bool,
    pub metadata: Option<Value>,
    pub status: QueueStatus,
    pub position: i64,
    pub created_at: f64,
    pub sent_at: Option<f64>,
    pub error: Option<String>,
}

/// On-disk queue log records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum QueueLogRecord {
    Enqueue {
        queue_id: String,
        content: String,
        reset_session: bool,
        metadata: Option<Value>,
        position: i64,
        created_at: f64,
    },
    Status {
        queue_id: String,
        status: QueueStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        sent_at: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<i64>,
    },
}

/// Manages per-session message queues with JSONL persistence.
pub struct QueueManager {
    // session_id -> items ordered by position
    queues: RwLock<HashMap<String, Vec<QueueItem>>>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    fn queue_file(session_dir: &Path) -> PathBuf {
        session_dir.join("queue.jsonl")
    }

    /// Replay `queue.jsonl` to rebuild in-memory state for a session.
    /// Returns all items, including terminal states kept for history.
    pub async fn load_queue(&self, session_id: &str, session_dir: &Path) -> Result<Vec<QueueItem>> {
        let records: Vec<QueueLogRecord> =
            storage::read_jsonl_as(&Self::queue_file(session_dir)).await?;

        let mut items_by_id: HashMap<String, QueueItem> = HashMap::new();
        let mut insertion_order: Vec<String> = Vec::new();

        for record in records {
            match record {
                QueueLogRecord::Enqueue {
                    queue_id,
                    content,
                    reset_session,
                    metadata,
                    position,
                    created_at,
                } => {
                    insertion_order.push(queue_id.clone());
                    items_by_id.insert(
                        queue_id.clone(),
                        QueueItem {
                            queue_id,
                            session_id: session_id.to_string(),
                            content,
                            reset_session,
                            metadata,
                            status: QueueStatus::Pending,
                            position,
                            created_at,
                            sent_at: None,
                            error: None,
                        },
                    );
                }
                QueueLogRecord::Status {
                    queue_id,
                    status,
                    sent_at,
                    error,
                    position,
                } => {
                    if let Some(item) = items_by_id.get_mut(&queue_id) {
                        item.status = status;
                        if let Some(sent_at) = sent_at {
                            item.sent_at = Some(sent_at);
                        }
                        if let Some(error) = error {
                            item.error = Some(error);
                        }
                        if let Some(position) = position {
                            item.position = position;
                        }
                    }
                }
            }
        }

        let mut all_items: Vec<QueueItem> = insertion_order
            .iter()
            .filter_map(|id| items_by_id.get(id).cloned())
            .collect();
        all_items.sort_by_key(|i| i.position);

        let pending = all_items
            .iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .count();
        if pending > 0 {
            info!(target: "queue", "loaded queue for session {}: {} pending, {} total", session_id, pending, all_items.len());
        }

        self.queues
            .write()
            .await
            .insert(session_id.to_string(), all_items.clone());
        Ok(all_items)
    }

    /// Add a message to the session's queue.
    pub async fn enqueue(
        &self,
        session_id: &str,
        session_dir: &Path,
        content: &str,
        reset_session: bool,
        metadata: Option<Value>,
        max_queue_size: usize,
    ) -> Result<QueueItem> {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(session_id.to_string()).or_default();
        let pending: Vec<&QueueItem> = queue
            .iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .collect();

        if pending.len() >= max_queue_size {
            return Err(LegionError::validation(format!(
                "queue full: {}/{} pending items",
                pending.len(),
                max_queue_size
            )));
        }

        let next_pos = pending.iter().map(|i| i.position).max().unwrap_or(-1) + 1;
        let item = QueueItem {
            queue_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
            reset_session,
            metadata,
            status: QueueStatus::Pending,
            position: next_pos,
            created_at: unix_timestamp(),
            sent_at: None,
            error: None,
        };

        storage::append_jsonl(
            &Self::queue_file(session_dir),
            &QueueLogRecord::Enqueue {
                queue_id: item.queue_id.clone(),
                content: item.content.clone(),
                reset_session: item.reset_session,
                metadata: item.metadata.clone(),
                position: item.position,
                created_at: item.created_at,
            },
        )
        .await?;

        queue.push(item.clone());
        info!(target: "queue", "enqueued {} for session {} at position {}", item.queue_id, session_id, next_pos);
        Ok(item)
    }

    /// Cancel a pending item. Returns None when the item does not exist
    /// or is not pending.
    pub async fn cancel(
        &self,
        session_id: &str,
        session_dir: &Path,
        queue_id: &str,
    ) -> Result<Option<QueueItem>> {
        let updated = {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(session_id.to_string()).or_default();
            match queue
                .iter_mut()
                .find(|i| i.queue_id == queue_id && i.status == QueueStatus::Pending)
            {
                Some(item) => {
                    item.status = QueueStatus::Cancelled;
                    Some(item.clone())
                }
                None => None,
            }
        };

        if let Some(item) = &updated {
            storage::append_jsonl(
                &Self::queue_file(session_dir),
                &QueueLogRecord::Status {
                    queue_id: item.queue_id.clone(),
                    status: QueueStatus::Cancelled,
                    sent_at: None,
                    error: None,
                    position: None,
                },
            )
            .await?;
            info!(target: "queue", "cancelled queue item {} for session {}", queue_id, session_id);
        }
        Ok(updated)
    }

    /// Mark a queue item as delivered.
    pub async fn mark_sent(
        &self,
        session_id: &str,
        session_dir: &Path,
        queue_id: &str,
    ) -> Result<Option<QueueItem>> {
        let sent_at = unix_timestamp();
        let updated = {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(session_id.to_string()).or_default();
            match queue.iter_mut().find(|i| i.queue_id == queue_id) {
                Some(item) => {
                    item.status = QueueStatus::Sent;
                    item.sent_at = Some(sent_at);
                    Some(item.clone())
                }
                None => None,
            }
        };

        if updated.is_some() {
            storage::append_jsonl(
                &Self::queue_file(session_dir),
                &QueueLogRecord::Status {
                    queue_id: queue_id.to_string(),
                    status: QueueStatus::Sent,
                    sent_at: Some(sent_at),
                    error: None,
                    position: None,
                },
            )
            .await?;
        }
        Ok(updated)
    }

    /// Mark a queue item as failed with an error description.
    pub async fn mark_failed(
        &self,
        session_id: &str,
        session_dir: &Path,
        queue_id: &str,
        error: &str,
    ) -> Result<Option<QueueItem>> {
        let updated = {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(session_id.to_string()).or_default();
            match queue.iter_mut().find(|i| i.queue_id == queue_id) {
                Some(item) => {
                    item.status = QueueStatus::Failed;
                    item.error = Some(error.to_string());
                    Some(item.clone())
                }
                None => None,
            }
        };

        if updated.is_some() {
            storage::append_jsonl(
                &Self::queue_file(session_dir),
                &QueueLogRecord::Status {
                    queue_id: queue_id.to_string(),
                    status: QueueStatus::Failed,
                    sent_at: None,
                    error: Some(error.to_string()),
                    position: None,
                },
            )
            .await?;
            info!(target: "queue", "marked queue item {} as failed for session {}: {}", queue_id, session_id, error);
        }
        Ok(updated)
    }

    /// Re-queue a sent or failed item: a new pending item with copied
    /// content lands at the head (min pending position − 1). The
    /// original record is untouched for history.
    pub async fn requeue(
        &self,
        session_id: &str,
        session_dir: &Path,
        queue_id: &str,
        max_queue_size: usize,
    ) -> Result<Option<QueueItem>> {
        let (original, front_pos) = {
            let queues = self.queues.read().await;
            let queue = match queues.get(session_id) {
                Some(q) => q,
                None => return Ok(None),
            };
            let original = match queue.iter().find(|i| {
                i.queue_id == queue_id
                    && matches!(i.status, QueueStatus::Sent | QueueStatus::Failed)
            }) {
                Some(item) => item.clone(),
                None => return Ok(None),
            };
            let front_pos = queue
                .iter()
                .filter(|i| i.status == QueueStatus::Pending)
                .map(|i| i.position)
                .min()
                .unwrap_or(0)
                - 1;
            (original, front_pos)
        };

        let mut new_item = self
            .enqueue(
                session_id,
                session_dir,
                &original.content,
                original.reset_session,
                original.metadata.clone(),
                max_queue_size,
            )
            .await?;

        // Move the copy to the head; the position override record makes
        // replay agree with in-memory state.
        {
            let mut queues = self.queues.write().await;
            if let Some(queue) = queues.get_mut(session_id) {
                if let Some(item) = queue.iter_mut().find(|i| i.queue_id == new_item.queue_id) {
                    item.position = front_pos;
                }
            }
        }
        new_item.position = front_pos;

        storage::append_jsonl(
            &Self::queue_file(session_dir),
            &QueueLogRecord::Status {
                queue_id: new_item.queue_id.clone(),
                status: QueueStatus::Pending,
                sent_at: None,
                error: None,
                position: Some(front_pos),
            },
        )
        .await?;

        info!(target: "queue", "re-queued {} as {} at front for session {}", queue_id, new_item.queue_id, session_id);
        Ok(Some(new_item))
    }

    /// Cancel every pending item. Returns the number cancelled.
    pub async fn clear_pending(&self, session_id: &str, session_dir: &Path) -> Result<usize> {
        let cancelled_ids = {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(session_id.to_string()).or_default();
            let mut ids = Vec::new();
            for item in queue.iter_mut() {
                if item.status == QueueStatus::Pending {
                    item.status = QueueStatus::Cancelled;
                    ids.push(item.queue_id.clone());
                }
            }
            ids
        };

        for queue_id in &cancelled_ids {
            storage::append_jsonl(
                &Self::queue_file(session_dir),
                &QueueLogRecord::Status {
                    queue_id: queue_id.clone(),
                    status: QueueStatus::Cancelled,
                    sent_at: None,
                    error: None,
                    position: None,
                },
            )
            .await?;
        }
        if !cancelled_ids.is_empty() {
            info!(target: "queue", "cleared {} pending items for session {}", cancelled_ids.len(), session_id);
        }
        Ok(cancelled_ids.len())
    }

    /// All items for a session, sorted by position.
    pub async fn get_queue(&self, session_id: &str) -> Vec<QueueItem> {
        let mut items = self
            .queues
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        items.sort_by_key(|i| i.position);
        items
    }

    /// Pending items sorted by position (FIFO order).
    pub async fn get_pending(&self, session_id: &str) -> Vec<QueueItem> {
        self.get_queue(session_id)
            .await
            .into_iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .collect()
    }

    pub async fn pending_count(&self, session_id: &str) -> usize {
        self.get_pending(session_id).await.len()
    }

    /// The next pending item without removing it.
    pub async fn peek_next(&self, session_id: &str) -> Option<QueueItem> {
        self.get_pending(session_id).await.into_iter().next()
    }

    /// Drop in-memory state for a session (its log stays on disk).
    pub async fn remove_session(&self, session_id: &str) {
        self.queues.write().await.remove(session_id);
    }
}
