//! Session model and registry.
//!
//! A session ("minion") wraps one logical conversation with an agent
//! SDK subprocess: identity, working directory, permission policy,
//! hierarchy links, and the lifecycle state machine. The
//! [`SessionManager`] is the process-wide registry; persistence is
//! authoritative: every mutation is written back to the session's
//! `state.json` so a restart re-materializes the full fleet from disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LegionError, Result};
use crate::storage;

/// Reserved id representing the human user in comm routing.
pub const USER_SENDER_ID: &str = "00000000-0000-0000-0000-000000000000";
/// Reserved id for system-generated comms (delivery failures etc.).
pub const SYSTEM_SENDER_ID: &str = "00000000-0000-0000-0000-000000000001";
/// Display name attached to system-generated comms.
pub const SYSTEM_SENDER_NAME: &str = "System";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created but never started
    Created,
    /// SDK subprocess is launching
    Starting,
    /// SDK is healthy and accepting input
    Active,
    /// Blocked on a permission decision or explicitly paused
    Paused,
    /// SDK failed fatally; see the session's error message
    Error,
    /// Explicitly shut down; may be started again
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
            SessionState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Session-wide policy governing automatic tool-use approvals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = LegionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(LegionError::validation(format!(
                "invalid permission mode: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full persisted state of one session.
///
/// Unknown keys in stored snapshots are tolerated and dropped on load
/// (forward-compatible deserialization); the legacy `is_minion` flag
/// falls into that bucket since every session is a minion now.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    /// Unique identifier (UUID string)
    pub session_id: String,
    /// Display name; unique within a legion for spawned minions
    pub name: Option<String>,
    /// Absolute working directory (immutable after creation)
    pub working_directory: PathBuf,
    /// Current lifecycle state
    pub state: SessionState,
    /// True while an SDK turn is in flight
    pub is_processing: bool,
    /// Last fatal error, when state == Error
    pub error_message: Option<String>,
    /// Opaque token from the SDK's init message; enables resuming the
    /// same logical conversation across subprocess restarts
    pub resume_token: Option<String>,
    /// Current permission mode
    pub permission_mode: PermissionMode,
    /// Persisted allow rules (`Tool(rule:*)` literals)
    pub allowed_tools: Vec<String>,
    /// Persisted deny rules
    pub disallowed_tools: Vec<String>,
    /// Stored system prompt text
    pub system_prompt: Option<String>,
    /// When false the SDK appends the prompt to its built-in preset;
    /// when true the prompt replaces the preset entirely
    pub override_system_prompt: bool,
    /// Model selector forwarded to the SDK
    pub model: Option<String>,
    /// Position within the owning project at creation time
    pub order: usize,
    /// Owning project id; the session's directory equals the project's
    pub project_id: String,
    /// Display role, e.g. "Code Expert"
    pub role: Option<String>,
    /// Capability keywords for discovery
    pub capabilities: Vec<String>,
    /// Parent overseer session id (None for user-created minions)
    pub parent_overseer_id: Option<String>,
    /// Depth from the hierarchy root (0 for user-created)
    pub overseer_level: u32,
    /// True while this session has at least one child
    pub is_overseer: bool,
    /// Ordered child session ids
    pub child_minion_ids: Vec<String>,
    /// Horde membership
    pub horde_id: Option<String>,
    /// Channels this session belongs to (mirror of channel member sets)
    pub channel_ids: Vec<String>,
    /// Opaque sandbox configuration forwarded to the SDK
    pub sandbox: Option<Value>,
    /// Which settings files contribute permissions (user/project/local)
    pub setting_sources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            name: None,
            working_directory: PathBuf::new(),
            state: SessionState::Created,
            is_processing: false,
            error_message: None,
            resume_token: None,
            permission_mode: PermissionMode::Default,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            system_prompt: None,
            override_system_prompt: false,
            model: None,
            order: 0,
            project_id: String::new(),
            role: None,
            capabilities: Vec::new(),
            parent_overseer_id: None,
            overseer_level: 0,
            is_overseer: false,
            child_minion_ids: Vec::new(),
            horde_id: None,
            channel_ids: Vec::new(),
            sandbox: None,
            setting_sources: vec![
                "user".to_string(),
                "project".to_string(),
                "local".to_string(),
            ],
            created_at: now,
            updated_at: now,
        }
    }
}

impl SessionInfo {
    /// Name for display, falling back to a short id prefix.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.session_id.chars().take(8).collect(),
        }
    }

    /// A session can be interrupted while active or mid-turn.
    pub fn is_interruptible(&self) -> bool {
        self.state == SessionState::Active || self.is_processing
    }
}

/// Parameters for creating a session. Hierarchy fields are filled in by
/// the overseer controller when a minion spawns a child.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub permission_mode: PermissionMode,
    pub system_prompt: Option<String>,
    pub override_system_prompt: bool,
    pub tools: Vec<String>,
    pub model: Option<String>,
    pub role: Option<String>,
    pub capabilities: Vec<String>,
    pub parent_overseer_id: Option<String>,
    pub overseer_level: u32,
    pub horde_id: Option<String>,
    pub sandbox: Option<Value>,
    pub setting_sources: Option<Vec<String>>,
}

/// Process-wide registry of sessions with persisted state.
pub struct SessionManager {
    data_dir: PathBuf,
    sessions_dir: PathBuf,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl SessionManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            sessions_dir: data_dir.join("sessions"),
            data_dir,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding one session's logs and state snapshot.
    pub fn session_directory(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Load every persisted session from disk into the registry.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;

        let mut loaded = 0usize;
        let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let state_file = entry.path().join("state.json");
            match storage::read_json::<SessionInfo>(&state_file).await {
                Ok(Some(info)) => {
                    self.sessions
                        .write()
                        .await
                        .insert(info.session_id.clone(), info);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "session", "failed to load session state from {}: {}", state_file.display(), e);
                }
            }
        }
        info!(target: "session", "loaded {} persisted sessions", loaded);
        Ok(())
    }

    /// Create a new session record and persist it.
    pub async fn create_session(
        &self,
        project_id: &str,
        working_directory: &Path,
        order: usize,
        params: CreateSessionParams,
    ) -> Result<SessionInfo> {
        let session_id = params
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&session_id) {
                return Err(LegionError::validation(format!(
                    "session {} already exists",
                    session_id
                )));
            }
        }

        let info = SessionInfo {
            session_id: session_id.clone(),
            name: params.name,
            working_directory: working_directory.to_path_buf(),
            permission_mode: params.permission_mode,
            allowed_tools: params.tools,
            system_prompt: params.system_prompt,
            override_system_prompt: params.override_system_prompt,
            model: params.model,
            order,
            project_id: project_id.to_string(),
            role: params.role,
            capabilities: params.capabilities,
            parent_overseer_id: params.parent_overseer_id,
            overseer_level: params.overseer_level,
            horde_id: params.horde_id,
            sandbox: params.sandbox,
            setting_sources: params.setting_sources.unwrap_or_else(|| {
                vec![
                    "user".to_string(),
                    "project".to_string(),
                    "local".to_string(),
                ]
            }),
            ..SessionInfo::default()
        };

        self.persist(&info).await?;
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), info.clone());
        info!(target: "session", "created session {} in project {}", session_id, project_id);
        Ok(info)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Find a session by display name within a project (case-sensitive).
    pub async fn find_by_name(&self, project_id: &str, name: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.project_id == project_id && s.name.as_deref() == Some(name))
            .cloned()
    }

    /// Sessions belonging to a project.
    pub async fn sessions_in_project(&self, project_id: &str) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Apply a mutation to a session under the registry lock and
    /// persist the result. The closure must not block.
    pub async fn modify<F>(&self, session_id: &str, mutate: F) -> Result<SessionInfo>
    where
        F: FnOnce(&mut SessionInfo),
    {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let info = sessions
                .get_mut(session_id)
                .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
            mutate(info);
            info.updated_at = Utc::now();
            info.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Transition to Starting. Valid from Created, Terminated, or Error.
    pub async fn mark_starting(&self, session_id: &str) -> Result<SessionInfo> {
        let current = self
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        match current.state {
            SessionState::Created | SessionState::Terminated | SessionState::Error => {
                self.modify(session_id, |s| {
                    s.state = SessionState::Starting;
                    s.error_message = None;
                })
                .await
            }
            SessionState::Active | SessionState::Starting => Ok(current),
            other => Err(LegionError::session(
                session_id,
                format!("cannot start session in {} state", other),
            )),
        }
    }

    /// Transition to Active (from Starting or Paused).
    pub async fn mark_active(&self, session_id: &str) -> Result<SessionInfo> {
        self.modify(session_id, |s| {
            s.state = SessionState::Active;
        })
        .await
    }

    /// Pause (from Active); used both for explicit pause and while a
    /// permission decision is pending.
    pub async fn pause_session(&self, session_id: &str) -> Result<SessionInfo> {
        let current = self
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        if current.state != SessionState::Active {
            return Err(LegionError::session(
                session_id,
                format!("cannot pause session in {} state", current.state),
            ));
        }
        self.modify(session_id, |s| s.state = SessionState::Paused)
            .await
    }

    /// Resume a paused session. State-only: the SDK handle is untouched.
    pub async fn resume_session(&self, session_id: &str) -> Result<SessionInfo> {
        let current = self
            .get_session(session_id)
            .await
            .ok_or_else(|| LegionError::session(session_id, "session not found"))?;
        if current.state != SessionState::Paused {
            return Err(LegionError::session(
                session_id,
                format!("cannot resume session in {} state", current.state),
            ));
        }
        self.modify(session_id, |s| s.state = SessionState::Active)
            .await
    }

    /// Move to Error with a user-facing message; forces processing off.
    pub async fn mark_error(&self, session_id: &str, message: &str) -> Result<SessionInfo> {
        self.modify(session_id, |s| {
            s.state = SessionState::Error;
            s.error_message = Some(message.to_string());
            s.is_processing = false;
        })
        .await
    }

    /// Terminate from any state. The queue stays on disk for replay.
    pub async fn terminate_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.modify(session_id, |s| {
            s.state = SessionState::Terminated;
            s.is_processing = false;
        })
        .await
    }

    pub async fn set_processing(&self, session_id: &str, processing: bool) -> Result<SessionInfo> {
        self.modify(session_id, |s| s.is_processing = processing)
            .await
    }

    pub async fn update_permission_mode(
        &self,
        session_id: &str,
        mode: PermissionMode,
    ) -> Result<SessionInfo> {
        self.modify(session_id, |s| s.permission_mode = mode).await
    }

    pub async fn set_resume_token(
        &self,
        session_id: &str,
        token: Option<String>,
    ) -> Result<SessionInfo> {
        self.modify(session_id, |s| s.resume_token = token).await
    }

    pub async fn update_name(&self, session_id: &str, name: &str) -> Result<SessionInfo> {
        let name = name.to_string();
        self.modify(session_id, move |s| s.name = Some(name)).await
    }

    /// Merge newly approved allow rules into the persisted set.
    pub async fn add_allowed_tools(
        &self,
        session_id: &str,
        tools: Vec<String>,
    ) -> Result<SessionInfo> {
        self.modify(session_id, move |s| {
            for tool in tools {
                if !s.allowed_tools.contains(&tool) {
                    s.allowed_tools.push(tool);
                }
            }
        })
        .await
    }

    /// Record a spawned child on its parent, marking it an overseer.
    pub async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<SessionInfo> {
        let child_id = child_id.to_string();
        self.modify(parent_id, move |s| {
            if !s.child_minion_ids.contains(&child_id) {
                s.child_minion_ids.push(child_id);
            }
            s.is_overseer = true;
        })
        .await
    }

    /// Remove a child; losing the last child clears the overseer flag.
    pub async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<SessionInfo> {
        let child_id = child_id.to_string();
        self.modify(parent_id, move |s| {
            s.child_minion_ids.retain(|c| *c != child_id);
            if s.child_minion_ids.is_empty() {
                s.is_overseer = false;
            }
        })
        .await
    }

    pub async fn add_channel(&self, session_id: &str, channel_id: &str) -> Result<SessionInfo> {
        let channel_id = channel_id.to_string();
        self.modify(session_id, move |s| {
            if !s.channel_ids.contains(&channel_id) {
                s.channel_ids.push(channel_id);
            }
        })
        .await
    }

    pub async fn remove_channel(&self, session_id: &str, channel_id: &str) -> Result<SessionInfo> {
        let channel_id = channel_id.to_string();
        self.modify(session_id, move |s| {
            s.channel_ids.retain(|c| *c != channel_id);
        })
        .await
    }

    /// Remove the session from the registry and delete its directory.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if !removed {
            debug!(target: "session", "delete requested for unknown session {}", session_id);
            return Ok(false);
        }
        storage::remove_dir_all_with_retry(&self.session_directory(session_id)).await?;
        info!(target: "session", "deleted session {}", session_id);
        Ok(true)
    }

    async fn persist(&self, info: &SessionInfo) -> Result<()> {
        let state_file = self.session_directory(&info.session_id).join("state.json");
        storage::write_json(&state_file, info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager_with_session(dir: &TempDir) -> (SessionManager, String) {
        let manager = SessionManager::new(dir.path());
        manager.initialize().await.unwrap();
        let info = manager
            .create_session(
                "p1",
                Path::new("/tmp/p1"),
                0,
                CreateSessionParams {
                    name: Some("alpha".to_string()),
                    ..CreateSessionParams::default()
                },
            )
            .await
            .unwrap();
        (manager, info.session_id)
    }

    #[tokio::test]
    async fn test_create_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let (manager, sid) = manager_with_session(&dir).await;

        let info = manager.get_session(&sid).await.unwrap();
        assert_eq!(info.state, SessionState::Created);
        assert_eq!(info.name.as_deref(), Some("alpha"));

        // A fresh manager over the same data dir sees the same record.
        let reloaded = SessionManager::new(dir.path());
        reloaded.initialize().await.unwrap();
        let info2 = reloaded.get_session(&sid).await.unwrap();
        assert_eq!(info2.session_id, info.session_id);
        assert_eq!(info2.working_directory, info.working_directory);
        assert_eq!(info2.permission_mode, info.permission_mode);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let (manager, sid) = manager_with_session(&dir).await;

        manager.mark_starting(&sid).await.unwrap();
        assert_eq!(
            manager.get_session(&sid).await.unwrap().state,
            SessionState::Starting
        );

        manager.mark_active(&sid).await.unwrap();
        manager.pause_session(&sid).await.unwrap();
        assert_eq!(
            manager.get_session(&sid).await.unwrap().state,
            SessionState::Paused
        );

        manager.resume_session(&sid).await.unwrap();
        assert_eq!(
            manager.get_session(&sid).await.unwrap().state,
            SessionState::Active
        );

        // Pausing a non-active session is an invalid transition.
        manager.terminate_session(&sid).await.unwrap();
        assert!(manager.pause_session(&sid).await.is_err());

        // Terminated sessions can start again.
        manager.mark_starting(&sid).await.unwrap();
        assert_eq!(
            manager.get_session(&sid).await.unwrap().state,
            SessionState::Starting
        );
    }

    #[tokio::test]
    async fn test_error_resets_processing() {
        let dir = TempDir::new().unwrap();
        let (manager, sid) = manager_with_session(&dir).await;

        manager.set_processing(&sid, true).await.unwrap();
        manager.mark_error(&sid, "CLI failed").await.unwrap();
        let info = manager.get_session(&sid).await.unwrap();
        assert_eq!(info.state, SessionState::Error);
        assert!(!info.is_processing);
        assert_eq!(info.error_message.as_deref(), Some("CLI failed"));
    }

    #[tokio::test]
    async fn test_child_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let (manager, parent) = manager_with_session(&dir).await;
        let child = manager
            .create_session(
                "p1",
                Path::new("/tmp/p1"),
                1,
                CreateSessionParams {
                    name: Some("beta".to_string()),
                    parent_overseer_id: Some(parent.clone()),
                    overseer_level: 1,
                    ..CreateSessionParams::default()
                },
            )
            .await
            .unwrap();

        manager.add_child(&parent, &child.session_id).await.unwrap();
        let p = manager.get_session(&parent).await.unwrap();
        assert!(p.is_overseer);
        assert_eq!(p.child_minion_ids, vec![child.session_id.clone()]);

        manager
            .remove_child(&parent, &child.session_id)
            .await
            .unwrap();
        let p = manager.get_session(&parent).await.unwrap();
        assert!(!p.is_overseer);
        assert!(p.child_minion_ids.is_empty());
    }

    #[tokio::test]
    async fn test_allowed_tools_deduplicated() {
        let dir = TempDir::new().unwrap();
        let (manager, sid) = manager_with_session(&dir).await;

        manager
            .add_allowed_tools(&sid, vec!["Bash(gh issue view:*)".to_string()])
            .await
            .unwrap();
        manager
            .add_allowed_tools(
                &sid,
                vec!["Bash(gh issue view:*)".to_string(), "Read".to_string()],
            )
            .await
            .unwrap();

        let info = manager.get_session(&sid).await.unwrap();
        assert_eq!(
            info.allowed_tools,
            vec!["Bash(gh issue view:*)".to_string(), "Read".to_string()]
        );
    }

    #[tokio::test]
    async fn test_legacy_is_minion_key_is_dropped() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(dir.path());
        manager.initialize().await.unwrap();

        // Hand-write a legacy snapshot with an is_minion key.
        let sid = Uuid::new_v4().to_string();
        let session_dir = manager.session_directory(&sid);
        tokio::fs::create_dir_all(&session_dir).await.unwrap();
        let legacy = serde_json::json!({
            "session_id": sid,
            "name": "legacy",
            "working_directory": "/tmp/p1",
            "state": "terminated",
            "is_minion": true,
            "project_id": "p1"
        });
        storage::write_json(&session_dir.join("state.json"), &legacy)
            .await
            .unwrap();

        let reloaded = SessionManager::new(dir.path());
        reloaded.initialize().await.unwrap();
        let info = reloaded.get_session(&sid).await.unwrap();
        assert_eq!(info.state, SessionState::Terminated);
        assert_eq!(info.name.as_deref(), Some("legacy"));
    }

    #[tokio::test]
    async fn test_delete_session_removes_directory() {
        let dir = TempDir::new().unwrap();
        let (manager, sid) = manager_with_session(&dir).await;
        let session_dir = manager.session_directory(&sid);
        assert!(session_dir.exists());

        assert!(manager.delete_session(&sid).await.unwrap());
        assert!(!session_dir.exists());
        assert!(manager.get_session(&sid).await.is_none());
        // Idempotent on repeat.
        assert!(!manager.delete_session(&sid).await.unwrap());
    }

    #[test]
    fn test_permission_mode_parse() {
        assert_eq!(
            "acceptEdits".parse::<PermissionMode>().unwrap(),
            PermissionMode::AcceptEdits
        );
        assert!("yolo".parse::<PermissionMode>().is_err());
    }
}
