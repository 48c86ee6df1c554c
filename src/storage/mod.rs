//! Persistent storage for session data.
//!
//! Each session owns a directory holding an append-only activity log
//! (`messages.jsonl`) and a state snapshot (`state.json`). The JSONL
//! helpers here are shared by every append-only log in the system
//! (queues, comm logs, timelines, schedule history): one UTF-8 JSON
//! object per line, LF-separated, malformed lines skipped with a
//! warning on replay.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{LegionError, Result};
use crate::utils::unix_timestamp;

/// Append a single JSON record to a JSONL file, creating parent
/// directories as needed.
pub async fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replay a JSONL file into raw JSON values.
///
/// Missing files yield an empty list. Malformed lines are skipped with
/// a warning so a single corrupt record never poisons the rest of the
/// log.
pub async fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let text = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(value),
            Err(e) => {
                warn!(target: "storage", "skipping malformed JSONL line in {}: {}", path.display(), e);
            }
        }
    }
    Ok(records)
}

/// Replay a JSONL file into typed records, skipping lines that fail to
/// deserialize.
pub async fn read_jsonl_as<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = read_jsonl(path).await?;
    let mut records = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(target: "storage", "skipping unreadable record in {}: {}", path.display(), e);
            }
        }
    }
    Ok(records)
}

/// Atomically-enough write of a JSON state snapshot (write then rename
/// is unnecessary here; snapshots are single-writer under the owning
/// registry's lock).
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

/// Read a JSON snapshot, returning `None` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(path).await?;
    let value = serde_json::from_str(&text)?;
    Ok(Some(value))
}

/// Manages persistent storage for one session's activity log and state.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    session_dir: PathBuf,
    messages_file: PathBuf,
    state_file: PathBuf,
}

impl SessionStorage {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        let session_dir = session_dir.into();
        Self {
            messages_file: session_dir.join("messages.jsonl"),
            state_file: session_dir.join("state.json"),
            session_dir,
        }
    }

    /// Create the session directory and an empty messages log.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.session_dir).await?;
        if !tokio::fs::try_exists(&self.messages_file).await? {
            tokio::fs::File::create(&self.messages_file).await?;
        }
        debug!(target: "storage", "initialized storage at {}", self.session_dir.display());
        Ok(())
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn messages_path(&self) -> &Path {
        &self.messages_file
    }

    pub fn state_path(&self) -> &Path {
        &self.state_file
    }

    /// Append a message record to the activity log, stamping a Unix
    /// timestamp if the record does not already carry one.
    pub async fn append_message(&self, mut message: Value) -> Result<()> {
        if let Some(obj) = message.as_object_mut() {
            obj.entry("timestamp")
                .or_insert_with(|| Value::from(unix_timestamp()));
        }
        append_jsonl(&self.messages_file, &message).await
    }

    /// Read messages with pagination. `limit = None` reads to the end.
    pub async fn read_messages(&self, limit: Option<usize>, offset: usize) -> Result<Vec<Value>> {
        let all = read_jsonl(&self.messages_file).await?;
        let end = match limit {
            Some(limit) => (offset + limit).min(all.len()),
            None => all.len(),
        };
        if offset >= all.len() {
            return Ok(Vec::new());
        }
        Ok(all[offset..end].to_vec())
    }

    /// Total number of records in the activity log.
    pub async fn message_count(&self) -> Result<usize> {
        Ok(read_jsonl(&self.messages_file).await?.len())
    }

    /// Truncate the activity log. Used when resetting a session.
    pub async fn clear_messages(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.messages_file).await? {
            tokio::fs::write(&self.messages_file, b"").await?;
        }
        Ok(())
    }

    /// Persist the session state snapshot.
    pub async fn write_state<T: Serialize>(&self, state: &T) -> Result<()> {
        write_json(&self.state_file, state).await
    }

    /// Load the session state snapshot, if present.
    pub async fn read_state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        read_json(&self.state_file).await
    }
}

/// Remove a directory tree with one retry, for filesystems that
/// transiently hold locks during mass deletion.
pub async fn remove_dir_all_with_retry(path: &Path) -> Result<()> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    if let Err(first) = tokio::fs::remove_dir_all(path).await {
        warn!(target: "storage", "deletion of {} failed ({}), retrying", path.display(), first);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| LegionError::Storage {
                message: format!("failed to delete directory {}", path.display()),
                source: Some(Box::new(e)),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_messages() {
        let dir = TempDir::new().unwrap();
        let storage = SessionStorage::new(dir.path().join("s1"));
        storage.initialize().await.unwrap();

        storage
            .append_message(json!({"type": "user", "content": "hello"}))
            .await
            .unwrap();
        storage
            .append_message(json!({"type": "assistant", "content": "hi"}))
            .await
            .unwrap();

        let messages = storage.read_messages(None, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], "user");
        // Timestamp stamped on append.
        assert!(messages[0]["timestamp"].as_f64().is_some());
    }

    #[tokio::test]
    async fn test_pagination() {
        let dir = TempDir::new().unwrap();
        let storage = SessionStorage::new(dir.path().join("s1"));
        storage.initialize().await.unwrap();

        for i in 0..5 {
            storage
                .append_message(json!({"type": "user", "content": format!("m{}", i)}))
                .await
                .unwrap();
        }

        let page = storage.read_messages(Some(2), 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["content"], "m1");
        assert_eq!(page[1]["content"], "m2");

        let past_end = storage.read_messages(Some(2), 10).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let storage = SessionStorage::new(dir.path().join("s1"));
        storage.initialize().await.unwrap();

        storage
            .append_message(json!({"type": "user", "content": "good"}))
            .await
            .unwrap();
        // Inject a corrupt line directly.
        let mut raw = tokio::fs::read_to_string(storage.messages_path())
            .await
            .unwrap();
        raw.push_str("{not json\n");
        tokio::fs::write(storage.messages_path(), raw).await.unwrap();
        storage
            .append_message(json!({"type": "user", "content": "also good"}))
            .await
            .unwrap();

        let messages = storage.read_messages(None, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(storage.message_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_messages() {
        let dir = TempDir::new().unwrap();
        let storage = SessionStorage::new(dir.path().join("s1"));
        storage.initialize().await.unwrap();
        storage
            .append_message(json!({"type": "user", "content": "x"}))
            .await
            .unwrap();
        storage.clear_messages().await.unwrap();
        assert_eq!(storage.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = SessionStorage::new(dir.path().join("s1"));
        storage.initialize().await.unwrap();

        let state = json!({"name": "alpha", "order": 3});
        storage.write_state(&state).await.unwrap();
        let loaded: Option<Value> = storage.read_state().await.unwrap();
        assert_eq!(loaded.unwrap(), state);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let values = read_jsonl(&dir.path().join("absent.jsonl")).await.unwrap();
        assert!(values.is_empty());
    }
}
