//! Channel management: multicast groups scoped to one legion.
//!
//! Membership is bidirectional: `channel.member_minion_ids` and each
//! member session's `channel_ids` are two sides of one relation, always
//! mutated together through the single add/remove entry points here.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{LegionError, Result};
use crate::session::SessionManager;
use crate::storage;

/// Strip a leading `#` so `#planning` and `planning` name the same
/// channel. Only the first `#` is removed.
pub fn normalize_channel_name(name: &str) -> &str {
    name.strip_prefix('#').unwrap_or(name)
}

/// A purpose-driven communication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub channel_id: String,
    /// Owning legion (project id)
    pub legion_id: String,
    pub name: String,
    pub description: String,
    /// e.g. "coordination" | "planning" | "research"
    pub purpose: String,
    pub member_minion_ids: Vec<String>,
    /// None when user-created
    pub created_by_minion_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Channel {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            channel_id: Uuid::new_v4().to_string(),
            legion_id: String::new(),
            name: String::new(),
            description: String::new(),
            purpose: String::new(),
            member_minion_ids: Vec::new(),
            created_by_minion_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Registry of channels with bidirectional membership maintenance.
pub struct ChannelManager {
    data_dir: PathBuf,
    sessions: Arc<SessionManager>,
    channels: DashMap<String, Channel>,
}

impl ChannelManager {
    pub fn new(data_dir: impl Into<PathBuf>, sessions: Arc<SessionManager>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sessions,
            channels: DashMap::new(),
        }
    }

    fn channel_dir(&self, legion_id: &str, channel_id: &str) -> PathBuf {
        self.data_dir
            .join("legions")
            .join(legion_id)
            .join("channels")
            .join(channel_id)
    }

    /// Create a channel. Names are unique within one legion,
    /// case-insensitively; the same name may exist in other legions.
    pub async fn create_channel(
        &self,
        legion_id: &str,
        name: &str,
        description: &str,
        purpose: &str,
        member_minion_ids: Vec<String>,
        created_by_minion_id: Option<String>,
    ) -> Result<Channel> {
        let name = normalize_channel_name(name);
        if name.is_empty() {
            return Err(LegionError::validation("channel name must not be empty"));
        }

        let name_lower = name.to_lowercase();
        for existing in self.channels.iter() {
            if existing.legion_id == legion_id && existing.name.to_lowercase() == name_lower {
                return Err(LegionError::validation(format!(
                    "channel '{}' already exists in this legion (case-insensitive match: '{}')",
                    name, existing.name
                )));
            }
        }

        for minion_id in &member_minion_ids {
            if self.sessions.get_session(minion_id).await.is_none() {
                return Err(LegionError::validation(format!(
                    "minion {} does not exist",
                    minion_id
                )));
            }
        }

        let channel = Channel {
            legion_id: legion_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            purpose: purpose.to_string(),
            created_by_minion_id,
            ..Channel::default()
        };
        self.channels
            .insert(channel.channel_id.clone(), channel.clone());
        self.persist(&channel).await?;

        // Members join through add_member so both relation sides stay
        // consistent.
        for minion_id in member_minion_ids {
            self.add_member(&channel.channel_id, &minion_id).await?;
        }

        info!(target: "legion", "created channel '{}' ({}) in legion {}", name, channel.channel_id, legion_id);
        self.get_channel(&channel.channel_id)
            .await
            .ok_or_else(|| LegionError::validation("channel vanished during creation"))
    }

    pub async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.get(channel_id).map(|c| c.clone())
    }

    /// Look up a channel by (normalized, case-insensitive) name within
    /// one legion.
    pub async fn find_by_name(&self, legion_id: &str, name: &str) -> Option<Channel> {
        let name_lower = normalize_channel_name(name).to_lowercase();
        self.channels
            .iter()
            .find(|c| c.legion_id == legion_id && c.name.to_lowercase() == name_lower)
            .map(|c| c.clone())
    }

    pub async fn list_channels(&self, legion_id: &str) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|c| c.legion_id == legion_id)
            .map(|c| c.clone())
            .collect()
    }

    /// Add a member. Idempotent: adding an existing member succeeds
    /// without change. Updates both relation sides and persists both.
    pub async fn add_member(&self, channel_id: &str, minion_id: &str) -> Result<()> {
        if self.sessions.get_session(minion_id).await.is_none() {
            return Err(LegionError::validation(format!(
                "minion {} does not exist",
                minion_id
            )));
        }

        let snapshot = {
            let mut channel = self.channels.get_mut(channel_id).ok_or_else(|| {
                LegionError::validation(format!("channel {} does not exist", channel_id))
            })?;
            if channel.member_minion_ids.contains(&minion_id.to_string()) {
                return Ok(());
            }
            channel.member_minion_ids.push(minion_id.to_string());
            channel.updated_at = Utc::now();
            channel.clone()
        };

        self.sessions.add_channel(minion_id, channel_id).await?;
        self.persist(&snapshot).await?;
        Ok(())
    }

    /// Remove a member. Idempotent: removing a non-member succeeds.
    pub async fn remove_member(&self, channel_id: &str, minion_id: &str) -> Result<()> {
        let snapshot = {
            let mut channel = self.channels.get_mut(channel_id).ok_or_else(|| {
                LegionError::validation(format!("channel {} does not exist", channel_id))
            })?;
            if !channel.member_minion_ids.contains(&minion_id.to_string()) {
                return Ok(());
            }
            channel.member_minion_ids.retain(|m| m != minion_id);
            channel.updated_at = Utc::now();
            channel.clone()
        };

        // The session may already be gone during cascades; membership
        // on the channel side is still cleaned up.
        if self.sessions.get_session(minion_id).await.is_some() {
            self.sessions.remove_channel(minion_id, channel_id).await?;
        }
        self.persist(&snapshot).await?;
        Ok(())
    }

    /// Remove a minion from every channel in a legion (disposal path).
    /// Returns the names of channels it was removed from.
    pub async fn remove_from_all_channels(
        &self,
        legion_id: &str,
        minion_id: &str,
    ) -> Result<Vec<String>> {
        let mut removed_names = Vec::new();
        let member_of: Vec<(String, String)> = self
            .channels
            .iter()
            .filter(|c| {
                c.legion_id == legion_id && c.member_minion_ids.contains(&minion_id.to_string())
            })
            .map(|c| (c.channel_id.clone(), c.name.clone()))
            .collect();

        for (channel_id, name) in member_of {
            match self.remove_member(&channel_id, minion_id).await {
                Ok(()) => removed_names.push(name),
                Err(e) => {
                    error!(target: "legion", "failed to remove minion {} from channel {}: {}", minion_id, channel_id, e)
                }
            }
        }
        Ok(removed_names)
    }

    /// Delete a channel and its directory. Member sessions drop the
    /// channel id first so the bidirectional invariant holds throughout.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self
            .get_channel(channel_id)
            .await
            .ok_or_else(|| LegionError::validation(format!("channel {} does not exist", channel_id)))?;

        for minion_id in &channel.member_minion_ids {
            if self.sessions.get_session(minion_id).await.is_some() {
                self.sessions.remove_channel(minion_id, channel_id).await?;
            }
        }
        self.channels.remove(channel_id);
        storage::remove_dir_all_with_retry(&self.channel_dir(&channel.legion_id, channel_id))
            .await?;
        info!(target: "legion", "deleted channel {} ({})", channel.name, channel_id);
        Ok(())
    }

    /// Load every persisted channel for every legion.
    pub async fn load_all(&self) -> Result<()> {
        let legions_dir = self.data_dir.join("legions");
        if !tokio::fs::try_exists(&legions_dir).await? {
            return Ok(());
        }
        let mut legion_entries = tokio::fs::read_dir(&legions_dir).await?;
        while let Some(legion_entry) = legion_entries.next_entry().await? {
            if !legion_entry.file_type().await?.is_dir() {
                continue;
            }
            let channels_dir = legion_entry.path().join("channels");
            if !tokio::fs::try_exists(&channels_dir).await? {
                continue;
            }
            let mut channel_entries = tokio::fs::read_dir(&channels_dir).await?;
            while let Some(channel_entry) = channel_entries.next_entry().await? {
                if !channel_entry.file_type().await?.is_dir() {
                    continue;
                }
                let state_file = channel_entry.path().join("channel_state.json");
                match storage::read_json::<Channel>(&state_file).await {
                    Ok(Some(channel)) => {
                        self.channels.insert(channel.channel_id.clone(), channel);
                    }
                    Ok(None) => {
                        warn!(target: "legion", "channel directory {} missing channel_state.json", channel_entry.path().display())
                    }
                    Err(e) => {
                        warn!(target: "legion", "error loading channel from {}: {}", state_file.display(), e)
                    }
                }
            }
        }
        info!(target: "legion", "loaded {} channels", self.channels.len());
        Ok(())
    }

    async fn persist(&self, channel: &Channel) -> Result<()> {
        let state_file = self
            .channel_dir(&channel.legion_id, &channel.channel_id)
            .join("channel_state.json");
        storage::write_json(&state_file, channel).await
    }
}
