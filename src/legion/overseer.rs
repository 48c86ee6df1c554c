//! Overseer hierarchy: spawning and disposing minions under parent
//! authority, and horde bookkeeping.
//!
//! A horde is the transitive tree under one user-created minion. It is
//! persisted flat (`hordes/<id>.json` with the full member list) so the
//! hierarchy survives restarts independent of the session snapshots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::SessionCoordinator;
use crate::error::{LegionError, Result};
use crate::legion::capabilities::CapabilityRegistry;
use crate::legion::channels::ChannelManager;
use crate::legion::comms::{Comm, CommType, InterruptPriority};
use crate::legion::router::CommRouter;
use crate::session::{CreateSessionParams, PermissionMode};
use crate::storage;

/// Hierarchical group: a root overseer plus all transitive descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Horde {
    pub horde_id: String,
    pub legion_id: String,
    pub name: String,
    pub root_overseer_id: String,
    /// Flattened membership of the whole tree
    pub all_minion_ids: Vec<String>,
    /// "user" or a minion id
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Horde {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            horde_id: Uuid::new_v4().to_string(),
            legion_id: String::new(),
            name: String::new(),
            root_overseer_id: String::new(),
            all_minion_ids: Vec::new(),
            created_by: "user".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistent registry of hordes.
pub struct HordeStore {
    hordes_dir: PathBuf,
    hordes: RwLock<HashMap<String, Horde>>,
}

impl HordeStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            hordes_dir: data_dir.into().join("hordes"),
            hordes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load_all(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.hordes_dir).await? {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&self.hordes_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match storage::read_json::<Horde>(&entry.path()).await {
                Ok(Some(horde)) => {
                    self.hordes
                        .write()
                        .await
                        .insert(horde.horde_id.clone(), horde);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "legion", "failed to load horde from {}: {}", entry.path().display(), e)
                }
            }
        }
        Ok(())
    }

    pub async fn get(&self, horde_id: &str) -> Option<Horde> {
        self.hordes.read().await.get(horde_id).cloned()
    }

    /// The legion's horde, if one exists yet.
    pub async fn horde_for_legion(&self, legion_id: &str) -> Option<Horde> {
        self.hordes
            .read()
            .await
            .values()
            .find(|h| h.legion_id == legion_id)
            .cloned()
    }

    /// Add the minion to the legion's horde, creating one rooted at the
    /// minion when the legion has none. Returns the horde id.
    pub async fn ensure_member(
        &self,
        legion_id: &str,
        minion_id: &str,
        minion_name: &str,
    ) -> Result<String> {
        let updated = {
            let mut hordes = self.hordes.write().await;
            if let Some(horde) = hordes.values_mut().find(|h| h.legion_id == legion_id) {
                if !horde.all_minion_ids.contains(&minion_id.to_string()) {
                    horde.all_minion_ids.push(minion_id.to_string());
                    horde.updated_at = Utc::now();
                }
                horde.clone()
            } else {
                let horde = Horde {
                    legion_id: legion_id.to_string(),
                    name: format!("{}'s Horde", minion_name),
                    root_overseer_id: minion_id.to_string(),
                    all_minion_ids: vec![minion_id.to_string()],
                    ..Horde::default()
                };
                hordes.insert(horde.horde_id.clone(), horde.clone());
                horde
            }
        };
        self.persist(&updated).await?;
        Ok(updated.horde_id)
    }

    /// Remove a minion from whichever horde contains it.
    pub async fn remove_member(&self, minion_id: &str) -> Result<()> {
        let updated = {
            let mut hordes = self.hordes.write().await;
            let horde = hordes
                .values_mut()
                .find(|h| h.all_minion_ids.contains(&minion_id.to_string()));
            match horde {
                Some(horde) => {
                    horde.all_minion_ids.retain(|m| m != minion_id);
                    horde.updated_at = Utc::now();
                    Some(horde.clone())
                }
                None => None,
            }
        };
        if let Some(horde) = updated {
            self.persist(&horde).await?;
        }
        Ok(())
    }

    async fn persist(&self, horde: &Horde) -> Result<()> {
        let path = self.hordes_dir.join(format!("{}.json", horde.horde_id));
        storage::write_json(&path, horde).await
    }
}

/// Spawns and disposes minions under parent authority.
pub struct OverseerController {
    coordinator: Arc<SessionCoordinator>,
    router: Arc<CommRouter>,
    channels: Arc<ChannelManager>,
    capabilities: Arc<CapabilityRegistry>,
    hordes: Arc<HordeStore>,
}

impl OverseerController {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        router: Arc<CommRouter>,
        channels: Arc<ChannelManager>,
        capabilities: Arc<CapabilityRegistry>,
        hordes: Arc<HordeStore>,
    ) -> Self {
        Self {
            coordinator,
            router,
            channels,
            capabilities,
            hordes,
        }
    }

    /// Validate the legion has room and the name is free.
    async fn check_capacity_and_name(&self, legion_id: &str, name: &str) -> Result<()> {
        let project = self
            .coordinator
            .projects()
            .get_project(legion_id)
            .await
            .ok_or_else(|| LegionError::validation(format!("legion {} not found", legion_id)))?;

        let minions = self
            .coordinator
            .sessions()
            .sessions_in_project(legion_id)
            .await;
        if minions.len() >= project.max_concurrent_minions {
            return Err(LegionError::validation(format!(
                "legion at maximum capacity ({} minions), cannot spawn more",
                project.max_concurrent_minions
            )));
        }
        if minions.iter().any(|m| m.name.as_deref() == Some(name)) {
            return Err(LegionError::validation(format!(
                "minion name '{}' already exists in this legion",
                name
            )));
        }
        Ok(())
    }

    /// Create a root minion on behalf of the user (overseer level 0).
    pub async fn create_minion_for_user(
        &self,
        legion_id: &str,
        name: &str,
        role: &str,
        system_prompt: &str,
        capabilities: Vec<String>,
    ) -> Result<String> {
        self.check_capacity_and_name(legion_id, name).await?;

        let info = self
            .coordinator
            .create_session(
                legion_id,
                CreateSessionParams {
                    name: Some(name.to_string()),
                    permission_mode: PermissionMode::Default,
                    system_prompt: if system_prompt.is_empty() {
                        None
                    } else {
                        Some(system_prompt.to_string())
                    },
                    role: if role.is_empty() {
                        None
                    } else {
                        Some(role.to_string())
                    },
                    capabilities: capabilities.clone(),
                    ..CreateSessionParams::default()
                },
            )
            .await?;

        self.capabilities.register(&info.session_id, &capabilities);
        let horde_id = self
            .hordes
            .ensure_member(legion_id, &info.session_id, name)
            .await?;
        self.coordinator
            .sessions()
            .modify(&info.session_id, |s| s.horde_id = Some(horde_id))
            .await?;

        info!(target: "legion", "created minion {} ({}) for user in legion {}", name, info.session_id, legion_id);
        Ok(info.session_id)
    }

    /// Spawn a child minion autonomously under a parent overseer.
    pub async fn spawn_minion(
        &self,
        parent_overseer_id: &str,
        name: &str,
        role: &str,
        system_prompt: &str,
        capabilities: Vec<String>,
        channels: Vec<String>,
    ) -> Result<String> {
        let parent = self
            .coordinator
            .sessions()
            .get_session(parent_overseer_id)
            .await
            .ok_or_else(|| {
                LegionError::validation(format!("parent overseer {} not found", parent_overseer_id))
            })?;
        let legion_id = parent.project_id.clone();

        self.check_capacity_and_name(&legion_id, name).await?;

        // Child joins the parent's horde; the parent gets one lazily if
        // this is its first spawn.
        let horde_id = match &parent.horde_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .hordes
                    .ensure_member(&legion_id, parent_overseer_id, &parent.display_name())
                    .await?;
                self.coordinator
                    .sessions()
                    .modify(parent_overseer_id, |s| s.horde_id = Some(id.clone()))
                    .await?;
                id
            }
        };

        let child = self
            .coordinator
            .create_session(
                &legion_id,
                CreateSessionParams {
                    name: Some(name.to_string()),
                    permission_mode: PermissionMode::Default,
                    system_prompt: if system_prompt.is_empty() {
                        None
                    } else {
                        Some(system_prompt.to_string())
                    },
                    role: Some(role.to_string()),
                    capabilities: capabilities.clone(),
                    parent_overseer_id: Some(parent_overseer_id.to_string()),
                    overseer_level: parent.overseer_level + 1,
                    horde_id: Some(horde_id.clone()),
                    ..CreateSessionParams::default()
                },
            )
            .await?;
        let child_id = child.session_id.clone();

        self.coordinator
            .sessions()
            .add_child(parent_overseer_id, &child_id)
            .await?;
        self.hordes.ensure_member(&legion_id, &child_id, name).await?;
        self.capabilities.register(&child_id, &capabilities);

        for channel_id in channels {
            if let Err(e) = self.channels.add_member(&channel_id, &child_id).await {
                warn!(target: "legion", "failed to add {} to channel {}: {}", name, channel_id, e);
            }
        }

        // Announce the spawn to the user.
        let spawn_comm = Comm {
            from_minion_id: Some(parent_overseer_id.to_string()),
            from_minion_name: parent.name.clone(),
            to_user: true,
            summary: format!("Spawned {}", name),
            content: format!(
                "**{}** spawned minion **{}** ({})",
                parent.display_name(),
                name,
                role
            ),
            comm_type: CommType::Spawn,
            interrupt_priority: InterruptPriority::Routine,
            ..Comm::default()
        };
        if let Err(e) = self.router.route_comm(spawn_comm).await {
            warn!(target: "legion", "failed to announce spawn of {}: {}", name, e);
        }

        if let Err(e) = self.coordinator.start_session(&child_id).await {
            warn!(target: "legion", "spawned minion {} failed to start: {}", name, e);
        }

        if let Some(project) = self.coordinator.projects().get_project(&legion_id).await {
            self.coordinator.broadcaster().broadcast_control(
                "project_updated",
                json!({"project": serde_json::to_value(&project)?}),
            );
        }

        info!(target: "legion", "minion {} spawned by {} (parent={}, child={})", name, parent.display_name(), parent_overseer_id, child_id);
        Ok(child_id)
    }

    /// Dispose a child by name under parent authority. Descendants are
    /// disposed depth-first; everything is archived. Returns the
    /// disposed minion's id and its descendants count.
    pub async fn dispose_minion(
        &self,
        parent_overseer_id: &str,
        child_minion_name: &str,
    ) -> Result<(String, usize)> {
        let parent = self
            .coordinator
            .sessions()
            .get_session(parent_overseer_id)
            .await
            .ok_or_else(|| {
                LegionError::validation(format!("parent overseer {} not found", parent_overseer_id))
            })?;

        // Only a minion's own parent may dispose it; resolve by name
        // among this parent's children.
        let mut child_id = None;
        let mut child_names = Vec::new();
        for candidate_id in &parent.child_minion_ids {
            if let Some(candidate) = self.coordinator.sessions().get_session(candidate_id).await {
                if candidate.name.as_deref() == Some(child_minion_name) {
                    child_id = Some(candidate_id.clone());
                }
                child_names.push(candidate.display_name());
            }
        }
        let child_id = child_id.ok_or_else(|| {
            LegionError::validation(format!(
                "no child minion named '{}' found; you can only dispose minions you spawned (your children: {:?})",
                child_minion_name, child_names
            ))
        })?;

        let descendants = self
            .coordinator
            .delete_session_with_reason(&child_id, "parent_initiated")
            .await?;

        let legion_id = parent.project_id.clone();
        let dispose_comm = Comm {
            from_minion_id: Some(parent_overseer_id.to_string()),
            from_minion_name: parent.name.clone(),
            to_user: true,
            summary: format!("Disposed {}", child_minion_name),
            content: if descendants > 0 {
                format!(
                    "**{}** disposed of minion **{}** (and {} descendants)",
                    parent.display_name(),
                    child_minion_name,
                    descendants
                )
            } else {
                format!(
                    "**{}** disposed of minion **{}**",
                    parent.display_name(),
                    child_minion_name
                )
            },
            comm_type: CommType::Dispose,
            interrupt_priority: InterruptPriority::Routine,
            ..Comm::default()
        };
        if let Err(e) = self.router.route_comm(dispose_comm).await {
            warn!(target: "legion", "failed to announce disposal of {}: {}", child_minion_name, e);
        }

        if let Some(project) = self.coordinator.projects().get_project(&legion_id).await {
            self.coordinator.broadcaster().broadcast_control(
                "project_updated",
                json!({"project": serde_json::to_value(&project)?}),
            );
        }

        info!(target: "legion", "minion {} disposed by {} (disposed_id={}, descendants={})", child_minion_name, parent.display_name(), child_id, descendants);
        Ok((child_id, descendants))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_horde_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = HordeStore::new(dir.path());

        let horde_id = store.ensure_member("legion1", "m1", "alpha").await.unwrap();
        // Second member joins the same horde.
        let same_id = store.ensure_member("legion1", "m2", "beta").await.unwrap();
        assert_eq!(horde_id, same_id);

        let horde = store.get(&horde_id).await.unwrap();
        assert_eq!(horde.root_overseer_id, "m1");
        assert_eq!(horde.name, "alpha's Horde");
        assert_eq!(horde.all_minion_ids, vec!["m1", "m2"]);

        let store2 = HordeStore::new(dir.path());
        store2.load_all().await.unwrap();
        let loaded = store2.get(&horde_id).await.unwrap();
        assert_eq!(loaded.all_minion_ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_horde_member_removal() {
        let dir = TempDir::new().unwrap();
        let store = HordeStore::new(dir.path());
        let horde_id = store.ensure_member("legion1", "m1", "alpha").await.unwrap();
        store.ensure_member("legion1", "m2", "beta").await.unwrap();

        store.remove_member("m2").await.unwrap();
        assert_eq!(
            store.get(&horde_id).await.unwrap().all_minion_ids,
            vec!["m1"]
        );
        // Removing an unknown member is a no-op.
        store.remove_member("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_member_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = HordeStore::new(dir.path());
        let horde_id = store.ensure_member("legion1", "m1", "alpha").await.unwrap();
        store.ensure_member("legion1", "m1", "alpha").await.unwrap();
        assert_eq!(
            store.get(&horde_id).await.unwrap().all_minion_ids,
            vec!["m1"]
        );
    }
}
