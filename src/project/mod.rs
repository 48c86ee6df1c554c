//! Project grouping.
//!
//! A project scopes a set of sessions to one working directory. The
//! ordered session list drives UI layout; the working directory is
//! immutable for the project's lifetime. A project whose last session
//! is removed is deleted automatically, but startup validation keeps
//! empty projects so new minions can land in them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LegionError, Result};
use crate::storage;

/// Project metadata and state.
///
/// The legacy `is_multi_agent` flag is gone (every project can host
/// hordes and channels) and is silently dropped when old snapshots
/// are loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub project_id: String,
    pub name: String,
    /// Absolute path; immutable after creation
    pub working_directory: PathBuf,
    /// Ordered list of child session ids
    pub session_ids: Vec<String>,
    /// UI expansion state (persisted)
    pub is_expanded: bool,
    /// Display order among projects
    pub order: i64,
    /// Cap on concurrently existing minions in this project
    pub max_concurrent_minions: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4().to_string(),
            name: String::new(),
            working_directory: PathBuf::new(),
            session_ids: Vec::new(),
            is_expanded: true,
            order: 0,
            max_concurrent_minions: 20,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Registry of projects with per-project persistence.
pub struct ProjectManager {
    projects_dir: PathBuf,
    projects: Mutex<HashMap<String, ProjectInfo>>,
}

impl ProjectManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: data_dir.into().join("projects"),
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Load existing project state from disk.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.projects_dir).await?;
        let mut entries = tokio::fs::read_dir(&self.projects_dir).await?;
        let mut loaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let state_file = entry.path().join("state.json");
            match storage::read_json::<ProjectInfo>(&state_file).await {
                Ok(Some(project)) => {
                    self.projects
                        .lock()
                        .await
                        .insert(project.project_id.clone(), project);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "project", "failed to load project from {}: {}", state_file.display(), e);
                }
            }
        }
        info!(target: "project", "loaded {} existing projects", loaded);
        Ok(())
    }

    /// Create a new project at display order 0, shifting the rest down.
    pub async fn create_project(
        &self,
        name: &str,
        working_directory: &Path,
        max_concurrent_minions: usize,
    ) -> Result<ProjectInfo> {
        let project = ProjectInfo {
            name: name.to_string(),
            working_directory: working_directory.to_path_buf(),
            max_concurrent_minions,
            ..ProjectInfo::default()
        };

        {
            let mut projects = self.projects.lock().await;
            for existing in projects.values_mut() {
                existing.order += 1;
            }
            projects.insert(project.project_id.clone(), project.clone());
        }
        // Persist the shifted orders along with the new project.
        self.persist_all().await?;

        info!(target: "project", "created project {} ({}) at {}", project.project_id, name, working_directory.display());
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Option<ProjectInfo> {
        self.projects.lock().await.get(project_id).cloned()
    }

    /// All projects, sorted by display order then creation time.
    pub async fn list_projects(&self) -> Vec<ProjectInfo> {
        let mut projects: Vec<ProjectInfo> = self.projects.lock().await.values().cloned().collect();
        projects.sort_by(|a, b| a.order.cmp(&b.order).then(a.created_at.cmp(&b.created_at)));
        projects
    }

    /// Update mutable metadata; the working directory cannot change.
    pub async fn update_project(
        &self,
        project_id: &str,
        name: Option<String>,
        is_expanded: Option<bool>,
        order: Option<i64>,
    ) -> Result<ProjectInfo> {
        let updated = {
            let mut projects = self.projects.lock().await;
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;
            if let Some(name) = name {
                project.name = name;
            }
            if let Some(expanded) = is_expanded {
                project.is_expanded = expanded;
            }
            if let Some(order) = order {
                project.order = order;
            }
            project.updated_at = Utc::now();
            project.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    pub async fn toggle_expansion(&self, project_id: &str) -> Result<ProjectInfo> {
        let updated = {
            let mut projects = self.projects.lock().await;
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;
            project.is_expanded = !project.is_expanded;
            project.updated_at = Utc::now();
            project.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Append a session to the project's ordered list (idempotent).
    pub async fn add_session_to_project(&self, project_id: &str, session_id: &str) -> Result<()> {
        let updated = {
            let mut projects = self.projects.lock().await;
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;
            if !project.session_ids.contains(&session_id.to_string()) {
                project.session_ids.push(session_id.to_string());
                project.updated_at = Utc::now();
            }
            project.clone()
        };
        self.persist(&updated).await
    }

    /// Remove a session from the project. When the list becomes empty
    /// the project itself is deleted. Returns (removed, project_deleted).
    pub async fn remove_session_from_project(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<(bool, bool)> {
        let (removed, now_empty, snapshot) = {
            let mut projects = self.projects.lock().await;
            let project = match projects.get_mut(project_id) {
                Some(p) => p,
                None => return Ok((false, false)),
            };
            let before = project.session_ids.len();
            project.session_ids.retain(|s| s != session_id);
            let removed = project.session_ids.len() != before;
            if removed {
                project.updated_at = Utc::now();
            }
            (removed, project.session_ids.is_empty(), project.clone())
        };

        if removed && now_empty {
            self.delete_project(project_id).await?;
            info!(target: "project", "project {} was empty after session removal and has been deleted", project_id);
            return Ok((true, true));
        }
        if removed {
            self.persist(&snapshot).await?;
        }
        Ok((removed, false))
    }

    /// Replace the session ordering; the new list must be a permutation
    /// of the current one.
    pub async fn reorder_project_sessions(
        &self,
        project_id: &str,
        session_ids: Vec<String>,
    ) -> Result<()> {
        let updated = {
            let mut projects = self.projects.lock().await;
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;

            let mut current: Vec<&String> = project.session_ids.iter().collect();
            let mut proposed: Vec<&String> = session_ids.iter().collect();
            current.sort();
            proposed.sort();
            if current != proposed {
                return Err(LegionError::validation(
                    "session id list is not a permutation of the project's sessions",
                ));
            }

            project.session_ids = session_ids;
            project.updated_at = Utc::now();
            project.clone()
        };
        self.persist(&updated).await
    }

    /// Assign sequential display orders following the given id list.
    pub async fn reorder_projects(&self, project_ids: Vec<String>) -> Result<()> {
        let snapshots = {
            let mut projects = self.projects.lock().await;
            let mut snapshots = Vec::new();
            for (i, project_id) in project_ids.iter().enumerate() {
                match projects.get_mut(project_id) {
                    Some(project) => {
                        project.order = i as i64;
                        project.updated_at = Utc::now();
                        snapshots.push(project.clone());
                    }
                    None => {
                        warn!(target: "project", "project {} not found during reorder", project_id)
                    }
                }
            }
            snapshots
        };
        for snapshot in &snapshots {
            self.persist(snapshot).await?;
        }
        Ok(())
    }

    /// Remove a project and delete its directory.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let existed = self.projects.lock().await.remove(project_id).is_some();
        if !existed {
            return Ok(false);
        }
        storage::remove_dir_all_with_retry(&self.projects_dir.join(project_id)).await?;
        info!(target: "project", "deleted project {}", project_id);
        Ok(true)
    }

    /// Overwrite a project's session list in place (startup cleanup).
    pub async fn replace_session_ids(
        &self,
        project_id: &str,
        session_ids: Vec<String>,
    ) -> Result<()> {
        let updated = {
            let mut projects = self.projects.lock().await;
            let project = projects
                .get_mut(project_id)
                .ok_or_else(|| LegionError::validation(format!("project {} not found", project_id)))?;
            project.session_ids = session_ids;
            project.updated_at = Utc::now();
            project.clone()
        };
        self.persist(&updated).await
    }

    async fn persist(&self, project: &ProjectInfo) -> Result<()> {
        let state_file = self
            .projects_dir
            .join(&project.project_id)
            .join("state.json");
        storage::write_json(&state_file, project).await
    }

    async fn persist_all(&self) -> Result<()> {
        let snapshots: Vec<ProjectInfo> = self.projects.lock().await.values().cloned().collect();
        for project in &snapshots {
            self.persist(project).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_shifts_existing_down() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::new(dir.path());
        manager.initialize().await.unwrap();

        let first = manager
            .create_project("one", Path::new("/tmp/one"), 20)
            .await
            .unwrap();
        let second = manager
            .create_project("two", Path::new("/tmp/two"), 20)
            .await
            .unwrap();

        let listed = manager.list_projects().await;
        assert_eq!(listed[0].project_id, second.project_id);
        assert_eq!(listed[0].order, 0);
        assert_eq!(listed[1].project_id, first.project_id);
        assert_eq!(listed[1].order, 1);
    }

    #[tokio::test]
    async fn test_auto_delete_when_empty() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::new(dir.path());
        manager.initialize().await.unwrap();

        let project = manager
            .create_project("one", Path::new("/tmp/one"), 20)
            .await
            .unwrap();
        manager
            .add_session_to_project(&project.project_id, "s1")
            .await
            .unwrap();
        manager
            .add_session_to_project(&project.project_id, "s2")
            .await
            .unwrap();

        let (removed, deleted) = manager
            .remove_session_from_project(&project.project_id, "s1")
            .await
            .unwrap();
        assert!(removed);
        assert!(!deleted);

        let (removed, deleted) = manager
            .remove_session_from_project(&project.project_id, "s2")
            .await
            .unwrap();
        assert!(removed);
        assert!(deleted);
        assert!(manager.get_project(&project.project_id).await.is_none());
    }

    #[tokio::test]
    async fn test_reorder_sessions_validates_permutation() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::new(dir.path());
        manager.initialize().await.unwrap();

        let project = manager
            .create_project("one", Path::new("/tmp/one"), 20)
            .await
            .unwrap();
        for sid in ["a", "b", "c"] {
            manager
                .add_session_to_project(&project.project_id, sid)
                .await
                .unwrap();
        }

        manager
            .reorder_project_sessions(
                &project.project_id,
                vec!["c".to_string(), "a".to_string(), "b".to_string()],
            )
            .await
            .unwrap();
        let reloaded = manager.get_project(&project.project_id).await.unwrap();
        assert_eq!(reloaded.session_ids, vec!["c", "a", "b"]);

        let err = manager
            .reorder_project_sessions(&project.project_id, vec!["a".to_string()])
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_legacy_is_multi_agent_key_is_dropped() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::new(dir.path());
        manager.initialize().await.unwrap();

        let project_id = Uuid::new_v4().to_string();
        let state_file = dir
            .path()
            .join("projects")
            .join(&project_id)
            .join("state.json");
        let legacy = serde_json::json!({
            "project_id": project_id,
            "name": "legacy",
            "working_directory": "/tmp/legacy",
            "session_ids": ["s1"],
            "is_multi_agent": true
        });
        storage::write_json(&state_file, &legacy).await.unwrap();

        let reloaded = ProjectManager::new(dir.path());
        reloaded.initialize().await.unwrap();
        let project = reloaded.get_project(&project_id).await.unwrap();
        assert_eq!(project.name, "legacy");
        assert_eq!(project.session_ids, vec!["s1"]);
        assert_eq!(project.max_concurrent_minions, 20);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::new(dir.path());
        manager.initialize().await.unwrap();
        let project = manager
            .create_project("one", Path::new("/tmp/one"), 5)
            .await
            .unwrap();

        let reloaded = ProjectManager::new(dir.path());
        reloaded.initialize().await.unwrap();
        let loaded = reloaded.get_project(&project.project_id).await.unwrap();
        assert_eq!(loaded.name, "one");
        assert_eq!(loaded.max_concurrent_minions, 5);
        assert_eq!(loaded.working_directory, PathBuf::from("/tmp/one"));
    }
}
