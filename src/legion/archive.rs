//! Disposal archives.
//!
//! Before a minion is deleted its session data (messages.jsonl,
//! state.json) is copied to `archives/minions/<sid>/<utc_timestamp>/`
//! together with a `disposal_metadata.json` capturing who disposed it,
//! why, and how many descendants went with it.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::SessionManager;
use crate::storage;
use crate::utils::{archive_timestamp, unix_timestamp};

/// Context captured at disposal time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisposalMetadata {
    pub disposed_at: f64,
    /// e.g. "parent_initiated", "cascade_disposal", "user_deleted"
    pub reason: String,
    pub parent_overseer_id: Option<String>,
    pub parent_overseer_name: Option<String>,
    pub legion_id: String,
    /// Session state at disposal time
    pub final_state: String,
    pub minion_id: String,
    pub minion_name: String,
    pub minion_role: Option<String>,
    pub overseer_level: u32,
    pub child_minion_ids: Vec<String>,
    /// Descendants disposed in the same cascade
    pub descendants_count: usize,
}

/// Result of one archive operation.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub archive_path: PathBuf,
    pub files_archived: Vec<String>,
}

/// Copies session data into the archive tree before disposal.
pub struct ArchiveManager {
    data_dir: PathBuf,
    sessions: Arc<SessionManager>,
}

impl ArchiveManager {
    pub fn new(data_dir: impl Into<PathBuf>, sessions: Arc<SessionManager>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sessions,
        }
    }

    fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives").join("minions")
    }

    /// Archive a minion's session data. Missing files are skipped; the
    /// metadata record is always written.
    pub async fn archive_minion(
        &self,
        minion_id: &str,
        reason: &str,
        parent_overseer_id: Option<&str>,
        parent_overseer_name: Option<&str>,
        descendants_count: usize,
    ) -> Result<ArchiveResult> {
        let info = self.sessions.get_session(minion_id).await;

        let archive_dir = self
            .archives_dir()
            .join(minion_id)
            .join(archive_timestamp());
        tokio::fs::create_dir_all(&archive_dir).await?;

        let mut files_archived = Vec::new();
        let session_dir = self.sessions.session_directory(minion_id);
        for file_name in ["messages.jsonl", "state.json"] {
            let source = session_dir.join(file_name);
            if tokio::fs::try_exists(&source).await? {
                match tokio::fs::copy(&source, archive_dir.join(file_name)).await {
                    Ok(_) => {
                        files_archived.push(file_name.to_string());
                        debug!(target: "legion", "archived {} for minion {}", file_name, minion_id);
                    }
                    Err(e) => {
                        warn!(target: "legion", "failed to archive {} for {}: {}", file_name, minion_id, e)
                    }
                }
            }
        }

        let metadata = DisposalMetadata {
            disposed_at: unix_timestamp(),
            reason: reason.to_string(),
            parent_overseer_id: parent_overseer_id.map(str::to_string),
            parent_overseer_name: parent_overseer_name.map(str::to_string),
            legion_id: info
                .as_ref()
                .map(|i| i.project_id.clone())
                .unwrap_or_default(),
            final_state: info
                .as_ref()
                .map(|i| i.state.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            minion_id: minion_id.to_string(),
            minion_name: info
                .as_ref()
                .map(|i| i.display_name())
                .unwrap_or_else(|| "unknown".to_string()),
            minion_role: info.as_ref().and_then(|i| i.role.clone()),
            overseer_level: info.as_ref().map(|i| i.overseer_level).unwrap_or(0),
            child_minion_ids: info
                .as_ref()
                .map(|i| i.child_minion_ids.clone())
                .unwrap_or_default(),
            descendants_count,
        };
        storage::write_json(&archive_dir.join("disposal_metadata.json"), &metadata).await?;
        files_archived.push("disposal_metadata.json".to_string());

        info!(target: "legion", "archived minion {} ({}) to {}", metadata.minion_name, minion_id, archive_dir.display());
        Ok(ArchiveResult {
            archive_path: archive_dir,
            files_archived,
        })
    }

    /// List archives recorded for a minion, oldest first.
    pub async fn list_archives(&self, minion_id: &str) -> Result<Vec<(String, DisposalMetadata)>> {
        let minion_dir = self.archives_dir().join(minion_id);
        if !tokio::fs::try_exists(&minion_dir).await? {
            return Ok(Vec::new());
        }

        let mut archives = Vec::new();
        let mut entries = tokio::fs::read_dir(&minion_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let metadata_file = entry.path().join("disposal_metadata.json");
            if let Some(metadata) =
                storage::read_json::<DisposalMetadata>(&metadata_file).await?
            {
                archives.push((entry.file_name().to_string_lossy().to_string(), metadata));
            }
        }
        archives.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CreateSessionParams;
    use crate::storage::SessionStorage;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_archive_copies_session_files() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path()));
        sessions.initialize().await.unwrap();
        let info = sessions
            .create_session(
                "p1",
                Path::new("/tmp/p1"),
                0,
                CreateSessionParams {
                    name: Some("alpha".to_string()),
                    role: Some("Scout".to_string()),
                    ..CreateSessionParams::default()
                },
            )
            .await
            .unwrap();
        let storage = SessionStorage::new(sessions.session_directory(&info.session_id));
        storage.initialize().await.unwrap();
        storage
            .append_message(json!({"type": "user", "content": "hi"}))
            .await
            .unwrap();

        let archive = ArchiveManager::new(dir.path(), Arc::clone(&sessions));
        let result = archive
            .archive_minion(&info.session_id, "user_deleted", None, None, 2)
            .await
            .unwrap();

        assert!(result.files_archived.contains(&"messages.jsonl".to_string()));
        assert!(result.files_archived.contains(&"state.json".to_string()));
        assert!(result
            .files_archived
            .contains(&"disposal_metadata.json".to_string()));

        let archives = archive.list_archives(&info.session_id).await.unwrap();
        assert_eq!(archives.len(), 1);
        let (_, metadata) = &archives[0];
        assert_eq!(metadata.minion_name, "alpha");
        assert_eq!(metadata.minion_role.as_deref(), Some("Scout"));
        assert_eq!(metadata.descendants_count, 2);
        assert_eq!(metadata.reason, "user_deleted");
    }

    #[tokio::test]
    async fn test_archive_of_unknown_session_still_writes_metadata() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path()));
        sessions.initialize().await.unwrap();
        let archive = ArchiveManager::new(dir.path(), sessions);

        let result = archive
            .archive_minion("ghost", "cascade_disposal", Some("p"), Some("Parent"), 0)
            .await
            .unwrap();
        assert_eq!(result.files_archived, vec!["disposal_metadata.json"]);
        let archives = archive.list_archives("ghost").await.unwrap();
        assert_eq!(archives[0].1.minion_name, "unknown");
    }
}
